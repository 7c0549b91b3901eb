//! Hand-rolled subset of the Model Context Protocol schema: the JSON-RPC
//! 2.0 framing plus the handful of requests a tool server must answer
//! (`initialize`, `ping`, `tools/list`, `tools/call`).
//!
//! Wire names follow the MCP schema (camelCase field names, `type`-tagged
//! content blocks), so a conforming client can talk to the server without
//! knowing it only implements this subset.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as JsonValue;

pub const JSONRPC_VERSION: &str = "2.0";
pub const MCP_SCHEMA_VERSION: &str = "2025-03-26";

/// A request id may be a string or an integer on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Integer(i64),
}

/// Trait implemented by each concrete MCP request so handlers can be
/// written generically over `(Params, Result)` pairs.
pub trait ModelContextProtocolRequest {
    const METHOD: &'static str;
    type Params: serde::de::DeserializeOwned;
    type Result: Serialize;
}

/// Counterpart of [`ModelContextProtocolRequest`] for notifications.
pub trait ModelContextProtocolNotification {
    const METHOD: &'static str;
    type Params: serde::de::DeserializeOwned;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JSONRPCMessage {
    Request(JSONRPCRequest),
    Notification(JSONRPCNotification),
    Response(JSONRPCResponse),
    Error(JSONRPCError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JSONRPCRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JSONRPCNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JSONRPCResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    pub result: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JSONRPCError {
    pub jsonrpc: String,
    pub id: RequestId,
    pub error: JSONRPCErrorError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JSONRPCErrorError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

/// The requests a client may send to this server, discriminated by method
/// name. Unknown methods are surfaced as an error to the caller.
#[derive(Debug, Clone)]
pub enum ClientRequest {
    InitializeRequest(InitializeRequestParams),
    PingRequest(Option<JsonValue>),
    ListToolsRequest(Option<JsonValue>),
    CallToolRequest(CallToolRequestParams),
}

impl TryFrom<JSONRPCRequest> for ClientRequest {
    type Error = serde_json::Error;

    fn try_from(req: JSONRPCRequest) -> Result<Self, serde_json::Error> {
        let JSONRPCRequest { method, params, .. } = req;
        match method.as_str() {
            InitializeRequest::METHOD => {
                let params = serde_json::from_value(params.unwrap_or(JsonValue::Null))?;
                Ok(ClientRequest::InitializeRequest(params))
            }
            PingRequest::METHOD => Ok(ClientRequest::PingRequest(params)),
            ListToolsRequest::METHOD => Ok(ClientRequest::ListToolsRequest(params)),
            CallToolRequest::METHOD => {
                let params = serde_json::from_value(params.unwrap_or(JsonValue::Null))?;
                Ok(ClientRequest::CallToolRequest(params))
            }
            other => Err(serde::de::Error::custom(format!(
                "unsupported method: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// initialize
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum InitializeRequest {}

impl ModelContextProtocolRequest for InitializeRequest {
    const METHOD: &'static str = "initialize";
    type Params = InitializeRequestParams;
    type Result = InitializeResult;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequestParams {
    #[serde(default)]
    pub capabilities: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<Implementation>,
    pub protocol_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub capabilities: ServerCapabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub protocol_version: String,
    pub server_info: Implementation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ServerCapabilitiesTools>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilitiesTools {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

// ---------------------------------------------------------------------------
// ping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum PingRequest {}

impl ModelContextProtocolRequest for PingRequest {
    const METHOD: &'static str = "ping";
    type Params = Option<JsonValue>;
    type Result = JsonValue;
}

// ---------------------------------------------------------------------------
// tools/list
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum ListToolsRequest {}

impl ModelContextProtocolRequest for ListToolsRequest {
    const METHOD: &'static str = "tools/list";
    type Params = Option<JsonValue>;
    type Result = ListToolsResult;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    pub tools: Vec<Tool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    pub input_schema: ToolInputSchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInputSchema {
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// tools/call
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum CallToolRequest {}

impl ModelContextProtocolRequest for CallToolRequest {
    const METHOD: &'static str = "tools/call";
    type Params = CallToolRequestParams;
    type Result = CallToolResult;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolRequestParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    pub content: Vec<CallToolResultContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallToolResultContent {
    TextContent(TextContent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextContent {
    #[serde(rename = "type")]
    pub r#type: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<JsonValue>,
}

impl From<CallToolResult> for JsonValue {
    fn from(result: CallToolResult) -> Self {
        // CallToolResult is a closed struct of serializable fields, so this
        // cannot fail in practice.
        serde_json::to_value(result).unwrap_or(JsonValue::Null)
    }
}

// ---------------------------------------------------------------------------
// notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum InitializedNotification {}

impl ModelContextProtocolNotification for InitializedNotification {
    const METHOD: &'static str = "notifications/initialized";
    type Params = Option<JsonValue>;
}
