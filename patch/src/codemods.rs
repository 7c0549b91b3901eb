//! The codemod registry. A plan may only cite transforms registered here;
//! anything else is a policy violation upstream.

use std::collections::BTreeMap;

use regex_lite::Regex;

use crate::PatchError;

type ApplyFn = fn(&str, &BTreeMap<String, String>) -> Result<(String, usize), PatchError>;

/// A registered AST-level transform. Parameters are validated before any
/// content is touched.
pub struct Codemod {
    pub id: &'static str,
    pub version: u32,
    pub params: &'static [&'static str],
    apply: ApplyFn,
}

impl Codemod {
    pub fn apply(
        &self,
        content: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<(String, usize), PatchError> {
        for required in self.params {
            if !params.contains_key(*required) {
                return Err(PatchError::MissingParam {
                    codemod: self.id.to_string(),
                    param: (*required).to_string(),
                });
            }
        }
        (self.apply)(content, params)
    }
}

const REGISTRY: &[Codemod] = &[
    Codemod {
        id: "rename_identifier_in_file",
        version: 1,
        params: &["from", "to"],
        apply: rename_identifier,
    },
    Codemod {
        id: "replace_string_literal",
        version: 1,
        params: &["from", "to"],
        apply: replace_string_literal,
    },
];

pub fn registered_codemods() -> &'static [Codemod] {
    REGISTRY
}

pub fn lookup_codemod(id: &str) -> Option<&'static Codemod> {
    REGISTRY.iter().find(|c| c.id == id)
}

pub fn is_registered_codemod(id: &str) -> bool {
    lookup_codemod(id).is_some()
}

/// Parse a `codemod:<id>` or `codemod:<id>@v<N>` citation token. Returns
/// the id and the cited version, if any.
pub fn parse_codemod_citation(citation: &str) -> Option<(&str, Option<u32>)> {
    let rest = citation.strip_prefix("codemod:")?;
    match rest.split_once("@v") {
        Some((id, version)) => {
            let version = version.parse().ok()?;
            Some((id, Some(version)))
        }
        None => Some((rest, None)),
    }
}

fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn identifier_param<'p>(
    codemod: &str,
    params: &'p BTreeMap<String, String>,
    key: &str,
) -> Result<&'p str, PatchError> {
    let value = params.get(key).map(String::as_str).unwrap_or_default();
    if !is_identifier(value) {
        return Err(PatchError::InvalidIdentifier {
            codemod: codemod.to_string(),
            param: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(value)
}

fn rename_identifier(
    content: &str,
    params: &BTreeMap<String, String>,
) -> Result<(String, usize), PatchError> {
    let from = identifier_param("rename_identifier_in_file", params, "from")?;
    let to = identifier_param("rename_identifier_in_file", params, "to")?;

    // `from` is a validated identifier, so it is safe to splice into the
    // pattern unescaped.
    let pattern = Regex::new(&format!(r"\b{from}\b")).map_err(|_| PatchError::InvalidIdentifier {
        codemod: "rename_identifier_in_file".to_string(),
        param: "from".to_string(),
        value: from.to_string(),
    })?;

    let count = pattern.find_iter(content).count();
    let new_content = pattern.replace_all(content, to).into_owned();
    Ok((new_content, count))
}

fn replace_string_literal(
    content: &str,
    params: &BTreeMap<String, String>,
) -> Result<(String, usize), PatchError> {
    let from = params.get("from").map(String::as_str).unwrap_or_default();
    let to = params.get("to").map(String::as_str).unwrap_or_default();
    if from.is_empty() {
        return Err(PatchError::MissingParam {
            codemod: "replace_string_literal".to_string(),
            param: "from".to_string(),
        });
    }

    // Match the literal with either quoting style so the transform works
    // across TS and Rust sources alike.
    let mut count = 0;
    let mut out = content.to_string();
    for quote in ['"', '\''] {
        let needle = format!("{quote}{from}{quote}");
        let replacement = format!("{quote}{to}{quote}");
        count += out.matches(&needle).count();
        out = out.replace(&needle, &replacement);
    }
    Ok((out, count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rename_respects_word_boundaries() {
        let mut params = BTreeMap::new();
        params.insert("from".to_string(), "TargetSymbol".to_string());
        params.insert("to".to_string(), "RenamedSymbol".to_string());

        let codemod = lookup_codemod("rename_identifier_in_file").expect("registered");
        let (out, count) = codemod
            .apply("const TargetSymbol = 1; // TargetSymbolic stays\n", &params)
            .expect("apply");
        assert_eq!(out, "const RenamedSymbol = 1; // TargetSymbolic stays\n");
        assert_eq!(count, 1);
    }

    #[test]
    fn rename_rejects_non_identifier_params() {
        let mut params = BTreeMap::new();
        params.insert("from".to_string(), "a b".to_string());
        params.insert("to".to_string(), "ok".to_string());

        let codemod = lookup_codemod("rename_identifier_in_file").expect("registered");
        assert!(matches!(
            codemod.apply("a b", &params),
            Err(PatchError::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn missing_param_is_reported() {
        let codemod = lookup_codemod("rename_identifier_in_file").expect("registered");
        assert!(matches!(
            codemod.apply("x", &BTreeMap::new()),
            Err(PatchError::MissingParam { .. })
        ));
    }

    #[test]
    fn string_literal_replacement_handles_both_quotes() {
        let mut params = BTreeMap::new();
        params.insert("from".to_string(), "old".to_string());
        params.insert("to".to_string(), "new".to_string());

        let codemod = lookup_codemod("replace_string_literal").expect("registered");
        let (out, count) = codemod
            .apply(r#"let a = "old"; let b = 'old';"#, &params)
            .expect("apply");
        assert_eq!(out, r#"let a = "new"; let b = 'new';"#);
        assert_eq!(count, 2);
    }

    #[test]
    fn citation_parsing() {
        assert_eq!(
            parse_codemod_citation("codemod:rename_identifier_in_file"),
            Some(("rename_identifier_in_file", None))
        );
        assert_eq!(
            parse_codemod_citation("codemod:rename_identifier_in_file@v1"),
            Some(("rename_identifier_in_file", Some(1)))
        );
        assert_eq!(parse_codemod_citation("policy:foo"), None);
        assert_eq!(parse_codemod_citation("codemod:x@vNaN"), None);
    }

    #[test]
    fn unknown_codemod_lookup_fails() {
        assert!(!is_registered_codemod("invented_custom_transform"));
    }
}
