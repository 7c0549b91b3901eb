//! Runs one `controller_turn` inside a spawned Tokio task and sends the
//! `tools/call` response when the envelope is ready.

use mcp_types::CallToolResult;
use mcp_types::CallToolResultContent;
use mcp_types::JSONRPC_VERSION;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCResponse;
use mcp_types::RequestId;
use mcp_types::TextContent;
use serde_json::json;
use tokio::sync::mpsc::Sender;
use warden_core::Controller;
use warden_protocol::TurnRequest;

pub(crate) async fn run_controller_turn(
    id: RequestId,
    request: TurnRequest,
    controller: &Controller,
    outgoing: Sender<JSONRPCMessage>,
) {
    let envelope = controller.handle_turn(request).await;

    let (text, is_error) = match serde_json::to_string(&envelope) {
        Ok(text) => (text, None),
        Err(e) => {
            tracing::error!("failed to serialize response envelope: {e}");
            // Fail open: the agent must be able to continue even when the
            // envelope cannot be delivered.
            (
                json!({"continue": true, "error": e.to_string()}).to_string(),
                Some(true),
            )
        }
    };

    let result = CallToolResult {
        content: vec![CallToolResultContent::TextContent(TextContent {
            r#type: "text".to_string(),
            text,
            annotations: None,
        })],
        is_error,
    };
    let _ = outgoing
        .send(JSONRPCMessage::Response(JSONRPCResponse {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: result.into(),
        }))
        .await;
}
