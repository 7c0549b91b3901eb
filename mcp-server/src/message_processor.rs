use std::sync::Arc;

use mcp_types::CallToolRequestParams;
use mcp_types::CallToolResult;
use mcp_types::CallToolResultContent;
use mcp_types::ClientRequest;
use mcp_types::JSONRPC_VERSION;
use mcp_types::JSONRPCError;
use mcp_types::JSONRPCErrorError;
use mcp_types::JSONRPCMessage;
use mcp_types::JSONRPCNotification;
use mcp_types::JSONRPCRequest;
use mcp_types::JSONRPCResponse;
use mcp_types::ListToolsResult;
use mcp_types::ModelContextProtocolNotification;
use mcp_types::ModelContextProtocolRequest;
use mcp_types::RequestId;
use mcp_types::TextContent;
use serde_json::json;
use tokio::sync::OnceCell;
use tokio::sync::mpsc;
use tokio::task;
use warden_core::Config;
use warden_core::ConfigOverrides;
use warden_core::Controller;
use warden_protocol::TurnRequest;

use crate::tool_config::CONTROLLER_TURN_TOOL_NAME;
use crate::tool_config::create_tool_for_controller_turn;
use crate::tool_runner::run_controller_turn;

pub(crate) struct MessageProcessor {
    outgoing: mpsc::Sender<JSONRPCMessage>,
    initialized: bool,
    /// The heavy runtime, bootstrapped on the first `tools/call`. The
    /// handshake never waits on it.
    controller: Arc<OnceCell<Controller>>,
}

impl MessageProcessor {
    /// Create a new `MessageProcessor`, retaining a handle to the outgoing
    /// `Sender` so handlers can enqueue messages to be written to stdout.
    pub(crate) fn new(outgoing: mpsc::Sender<JSONRPCMessage>) -> Self {
        Self {
            outgoing,
            initialized: false,
            controller: Arc::new(OnceCell::new()),
        }
    }

    pub(crate) fn process_request(&mut self, request: JSONRPCRequest) {
        // Hold on to the ID so we can respond.
        let request_id = request.id.clone();

        let client_request = match ClientRequest::try_from(request) {
            Ok(client_request) => client_request,
            Err(e) => {
                tracing::warn!("unsupported request: {e}");
                self.send_error(
                    request_id,
                    -32601,
                    "method not supported by this server".to_string(),
                );
                return;
            }
        };

        match client_request {
            ClientRequest::InitializeRequest(params) => {
                self.handle_initialize(request_id, params);
            }
            ClientRequest::PingRequest(params) => {
                self.handle_ping(request_id, params);
            }
            ClientRequest::ListToolsRequest(params) => {
                self.handle_list_tools(request_id, params);
            }
            ClientRequest::CallToolRequest(params) => {
                self.handle_call_tool(request_id, params);
            }
        }
    }

    /// Handle a standalone JSON-RPC response originating from the peer.
    pub(crate) fn process_response(&mut self, response: JSONRPCResponse) {
        tracing::info!("<- response: {:?}", response);
    }

    /// Handle a fire-and-forget JSON-RPC notification.
    pub(crate) fn process_notification(&mut self, notification: JSONRPCNotification) {
        match notification.method.as_str() {
            mcp_types::InitializedNotification::METHOD => {
                tracing::info!("client initialized");
            }
            other => tracing::info!("<- notification: {other}"),
        }
    }

    /// Handle an error object received from the peer.
    pub(crate) fn process_error(&mut self, err: JSONRPCError) {
        tracing::error!("<- error: {:?}", err);
    }

    fn handle_initialize(
        &mut self,
        id: RequestId,
        params: <mcp_types::InitializeRequest as ModelContextProtocolRequest>::Params,
    ) {
        tracing::info!("initialize -> params: {:?}", params);

        if self.initialized {
            // Already initialised: send JSON-RPC error response.
            self.send_error(id, -32600, "initialize called more than once".to_string());
            return;
        }

        self.initialized = true;

        let result = mcp_types::InitializeResult {
            capabilities: mcp_types::ServerCapabilities {
                tools: Some(mcp_types::ServerCapabilitiesTools {
                    list_changed: Some(false),
                }),
            },
            instructions: Some(
                "Call the controller_turn tool with a verb to advance the work unit lifecycle."
                    .to_string(),
            ),
            protocol_version: params.protocol_version.clone(),
            server_info: mcp_types::Implementation {
                name: "warden-mcp-server".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };

        self.send_response::<mcp_types::InitializeRequest>(id, result);
    }

    fn handle_ping(
        &self,
        id: RequestId,
        params: <mcp_types::PingRequest as ModelContextProtocolRequest>::Params,
    ) {
        tracing::trace!("ping -> params: {:?}", params);
        self.send_response::<mcp_types::PingRequest>(id, json!({}));
    }

    fn handle_list_tools(
        &self,
        id: RequestId,
        params: <mcp_types::ListToolsRequest as ModelContextProtocolRequest>::Params,
    ) {
        tracing::trace!("tools/list -> {params:?}");
        let result = ListToolsResult {
            tools: vec![create_tool_for_controller_turn()],
            next_cursor: None,
        };

        self.send_response::<mcp_types::ListToolsRequest>(id, result);
    }

    fn handle_call_tool(&self, id: RequestId, params: CallToolRequestParams) {
        tracing::info!("tools/call -> tool: {}", params.name);
        let CallToolRequestParams { name, arguments } = params;

        if name != CONTROLLER_TURN_TOOL_NAME {
            self.send_tool_error(id, format!("Unknown tool '{name}'"));
            return;
        }

        let request: TurnRequest = match arguments {
            Some(value) => match serde_json::from_value(value) {
                Ok(request) => request,
                Err(e) => {
                    self.send_tool_error(
                        id,
                        format!("Failed to parse controller_turn arguments: {e}"),
                    );
                    return;
                }
            },
            None => {
                self.send_tool_error(
                    id,
                    "Missing arguments for controller_turn; the `verb` field is required."
                        .to_string(),
                );
                return;
            }
        };

        // Bootstrap the runtime on first use and run the turn without
        // blocking the synchronous message loop.
        let outgoing = self.outgoing.clone();
        let controller = Arc::clone(&self.controller);
        task::spawn(async move {
            let controller = controller
                .get_or_try_init(|| async {
                    let config = Config::load_with_overrides(ConfigOverrides::default())?;
                    Controller::new(config).await
                })
                .await;
            match controller {
                Ok(controller) => {
                    run_controller_turn(id, request, controller, outgoing).await;
                }
                Err(e) => {
                    tracing::error!("failed to bootstrap the Warden runtime: {e}");
                    // Transport-level failure: fail open so the agent can
                    // continue without the controller.
                    let result = CallToolResult {
                        content: vec![CallToolResultContent::TextContent(TextContent {
                            r#type: "text".to_string(),
                            text: json!({"continue": true, "error": e.to_string()}).to_string(),
                            annotations: None,
                        })],
                        is_error: Some(true),
                    };
                    let _ = outgoing
                        .send(JSONRPCMessage::Response(JSONRPCResponse {
                            jsonrpc: JSONRPC_VERSION.into(),
                            id,
                            result: result.into(),
                        }))
                        .await;
                }
            }
        });
    }

    fn send_response<T>(&self, id: RequestId, result: T::Result)
    where
        T: ModelContextProtocolRequest,
    {
        let result = match serde_json::to_value(result) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("failed to serialize response: {e}");
                return;
            }
        };
        let response = JSONRPCMessage::Response(JSONRPCResponse {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result,
        });

        if let Err(e) = self.outgoing.try_send(response) {
            tracing::error!("failed to send response: {e}");
        }
    }

    fn send_error(&self, id: RequestId, code: i64, message: String) {
        let error_msg = JSONRPCMessage::Error(JSONRPCError {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            error: JSONRPCErrorError {
                code,
                message,
                data: None,
            },
        });

        if let Err(e) = self.outgoing.try_send(error_msg) {
            tracing::error!("failed to send error: {e}");
        }
    }

    fn send_tool_error(&self, id: RequestId, text: String) {
        let result = CallToolResult {
            content: vec![CallToolResultContent::TextContent(TextContent {
                r#type: "text".to_string(),
                text,
                annotations: None,
            })],
            is_error: Some(true),
        };
        self.send_response::<mcp_types::CallToolRequest>(id, result);
    }
}
