use serde_json::Value as JsonValue;

/// Token-cost heuristic for one turn: serialized request length divided by
/// four, rounded up. A lower bound, not a contract.
pub(crate) fn estimate_tokens(
    verb: &str,
    prompt: Option<&str>,
    args: Option<&JsonValue>,
) -> u64 {
    let mut serialized_len = verb.len();
    if let Some(prompt) = prompt {
        serialized_len += prompt.len();
    }
    if let Some(args) = args {
        serialized_len += args.to_string().len();
    }
    (serialized_len as u64).div_ceil(4)
}
