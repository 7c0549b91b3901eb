//! Tool descriptor for the single `controller_turn` tool, derived from the
//! shared [`TurnRequest`] schema so the wire contract has one source of
//! truth.

use mcp_types::Tool;
use mcp_types::ToolInputSchema;
use schemars::r#gen::SchemaSettings;
use warden_protocol::TurnRequest;

pub(crate) const CONTROLLER_TURN_TOOL_NAME: &str = "controller_turn";

pub(crate) fn create_tool_for_controller_turn() -> Tool {
    let schema = SchemaSettings::draft2019_09()
        .with(|s| {
            s.inline_subschemas = true;
            s.option_add_null_type = false
        })
        .into_generator()
        .into_root_schema_for::<TurnRequest>();
    let schema_value =
        serde_json::to_value(&schema).expect("controller_turn schema should serialise to JSON");

    let tool_input_schema =
        serde_json::from_value::<ToolInputSchema>(schema_value).unwrap_or_else(|e| {
            panic!("failed to create Tool from schema: {e}");
        });
    Tool {
        name: CONTROLLER_TURN_TOOL_NAME.to_string(),
        input_schema: tool_input_schema,
        description: Some(
            "Advance a Warden work unit by one verb-parameterized turn. The response envelope \
             carries the capability set, scope, budget status and deny reasons."
                .to_string(),
        ),
        annotations: None,
    }
}
