//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types and MCP protocol structures.

use std::collections::HashMap;
use std::fmt;

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC request id (number or string).
///
/// Ids issued by this client are always numbers; servers may use either form
/// for the requests they initiate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    String(String),
}

impl RequestId {
    /// The numeric id, if this is one.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            RequestId::Number(n) => Some(*n),
            RequestId::String(_) => None,
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        Self::Number(n)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s:?}"),
        }
    }
}

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcRequest {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            id: RequestId::Number(id),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (a request without an id).
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcNotification {
    pub method: String,
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a new JSON-RPC notification.
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response. Exactly one of result/error is carried.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    pub id: RequestId,
    pub outcome: Result<Value, JsonRpcError>,
}

impl JsonRpcResponse {
    /// A successful response.
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id: RequestId::Number(id),
            outcome: Ok(result),
        }
    }

    /// An error response.
    pub fn failure(id: u64, error: JsonRpcError) -> Self {
        Self {
            id: RequestId::Number(id),
            outcome: Err(error),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Any JSON-RPC 2.0 message, classified once at parse time.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl Message {
    /// Classify a decoded JSON value.
    ///
    /// `method` + `id` is a request, `method` alone is a notification, and
    /// `id` with `result` or `error` is a response. If a response carries both,
    /// the error wins.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let Value::Object(mut obj) = value else {
            return Err(serde_json::Error::custom("JSON-RPC message must be an object"));
        };

        let id = match obj.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(serde_json::from_value::<RequestId>(raw)?),
        };
        let params = obj.remove("params");

        if let Some(method) = obj.remove("method") {
            let Value::String(method) = method else {
                return Err(serde_json::Error::custom("'method' must be a string"));
            };
            return Ok(match id {
                Some(id) => Message::Request(JsonRpcRequest { id, method, params }),
                None => Message::Notification(JsonRpcNotification { method, params }),
            });
        }

        let id = id.ok_or_else(|| {
            serde_json::Error::custom("message has neither 'method' nor a usable 'id'")
        })?;

        if let Some(error) = obj.remove("error") {
            let error: JsonRpcError = serde_json::from_value(error)?;
            return Ok(Message::Response(JsonRpcResponse {
                id,
                outcome: Err(error),
            }));
        }

        match obj.remove("result") {
            Some(result) => Ok(Message::Response(JsonRpcResponse {
                id,
                outcome: Ok(result),
            })),
            None => Err(serde_json::Error::custom(
                "response missing both result and error",
            )),
        }
    }

    /// Method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(req) => Some(&req.method),
            Message::Notification(note) => Some(&note.method),
            Message::Response(_) => None,
        }
    }
}

impl From<JsonRpcRequest> for Message {
    fn from(req: JsonRpcRequest) -> Self {
        Message::Request(req)
    }
}

impl From<JsonRpcResponse> for Message {
    fn from(resp: JsonRpcResponse) -> Self {
        Message::Response(resp)
    }
}

impl From<JsonRpcNotification> for Message {
    fn from(note: JsonRpcNotification) -> Self {
        Message::Notification(note)
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", "2.0")?;
        match self {
            Message::Request(req) => {
                map.serialize_entry("id", &req.id)?;
                map.serialize_entry("method", &req.method)?;
                if let Some(params) = &req.params {
                    map.serialize_entry("params", params)?;
                }
            }
            Message::Notification(note) => {
                map.serialize_entry("method", &note.method)?;
                if let Some(params) = &note.params {
                    map.serialize_entry("params", params)?;
                }
            }
            Message::Response(resp) => {
                map.serialize_entry("id", &resp.id)?;
                match &resp.outcome {
                    Ok(result) => map.serialize_entry("result", result)?,
                    Err(error) => map.serialize_entry("error", error)?,
                }
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Message::from_value(value).map_err(D::Error::custom)
    }
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Protocol version sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// MCP method names used by the client.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
    pub const RESOURCES_UPDATED: &str = "notifications/resources/updated";
    pub const PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";
}

/// MCP tool descriptor as returned by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
}

/// MCP resource descriptor as returned by `resources/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub uri: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// A declared argument of a prompt template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// MCP prompt descriptor as returned by `prompts/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

/// Capabilities negotiated during `initialize`.
///
/// A capability counts as advertised when its key is present and not `false`
/// or `null`, so both `{"tools": true}` and `{"tools": {"listChanged": true}}`
/// enable tools.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerCapabilities {
    pub tools: bool,
    pub tools_list_changed: bool,
    pub resources: bool,
    pub resources_subscribe: bool,
    pub resources_list_changed: bool,
    pub prompts: bool,
    pub prompts_list_changed: bool,
    pub logging: bool,
}

impl ServerCapabilities {
    pub fn from_value(value: &Value) -> Self {
        let enabled = |key: &str| {
            !matches!(
                value.get(key),
                None | Some(Value::Null) | Some(Value::Bool(false))
            )
        };
        let flag = |key: &str, sub: &str| {
            value
                .get(key)
                .and_then(|v| v.get(sub))
                .and_then(Value::as_bool)
                .unwrap_or(false)
        };

        Self {
            tools: enabled("tools"),
            tools_list_changed: flag("tools", "listChanged"),
            resources: enabled("resources"),
            resources_subscribe: flag("resources", "subscribe"),
            resources_list_changed: flag("resources", "listChanged"),
            prompts: enabled("prompts"),
            prompts_list_changed: flag("prompts", "listChanged"),
            logging: enabled("logging"),
        }
    }
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
}

/// Body of a `resources/read` result item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    pub uri: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

/// One block of content in a tool, resource, or prompt result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Audio {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: ResourceContents,
    },
}

impl ContentBlock {
    /// Text of a `text` block (or of an embedded text resource).
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::Resource { resource } => resource.text.as_deref(),
            _ => None,
        }
    }
}

/// A message produced by `prompts/get`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: ContentBlock,
}

/// Result of a tool call, resource read, or prompt fetch.
///
/// Application-level failures reported by the server are carried here with
/// `is_error = true` rather than surfaced as `McpError`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct McpResult {
    pub content: Vec<ContentBlock>,
    pub is_error: bool,
    /// Prompt description (`prompts/get` only).
    pub description: Option<String>,
    /// Role-tagged prompt messages (`prompts/get` only).
    pub messages: Vec<PromptMessage>,
    /// `structuredContent` of a tool result, when present.
    pub structured_content: Option<Value>,
}

impl McpResult {
    /// An application-level error result with a single text block.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text { text: text.into() }],
            is_error: true,
            ..Self::default()
        }
    }

    /// Parse a `tools/call` result.
    ///
    /// Unknown content block types are skipped with a warning.
    pub fn from_tool_result(value: Value) -> Self {
        Self {
            content: parse_blocks(value.get("content")),
            is_error: value.get("isError").and_then(Value::as_bool).unwrap_or(false),
            structured_content: value.get("structuredContent").cloned(),
            ..Self::default()
        }
    }

    /// Parse a `resources/read` result: each item becomes a resource block.
    pub fn from_resource_result(value: Value) -> Self {
        let content = value
            .get("contents")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        serde_json::from_value::<ResourceContents>(item.clone())
                            .map_err(|e| {
                                tracing::warn!(error = %e, "skipping malformed resource contents")
                            })
                            .ok()
                    })
                    .map(|resource| ContentBlock::Resource { resource })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            content,
            ..Self::default()
        }
    }

    /// Parse a `prompts/get` result.
    pub fn from_prompt_result(value: Value) -> Self {
        let messages: Vec<PromptMessage> = value
            .get("messages")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        serde_json::from_value::<PromptMessage>(item.clone())
                            .map_err(|e| {
                                tracing::warn!(error = %e, "skipping malformed prompt message")
                            })
                            .ok()
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            content: messages.iter().map(|m| m.content.clone()).collect(),
            description: value
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            messages,
            ..Self::default()
        }
    }

    /// All text blocks joined with newlines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn parse_blocks(value: Option<&Value>) -> Vec<ContentBlock> {
    let Some(items) = value.and_then(Value::as_array) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<ContentBlock>(item.clone()) {
            Ok(block) => Some(block),
            Err(e) => {
                tracing::warn!(
                    block_type = ?item.get("type"),
                    error = %e,
                    "skipping unsupported content block"
                );
                None
            }
        })
        .collect()
}

/// A server-initiated notification forwarded to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerNotification {
    /// Name of the connection that received it.
    pub server: String,
    pub method: String,
    pub params: Option<Value>,
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Default per-call timeout (ms).
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

fn default_timeout_ms() -> u64 {
    DEFAULT_CALL_TIMEOUT_MS
}

/// Launch configuration for one server. Immutable once a connection starts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerConfig {
    /// Registry key. Injected from the map key when loaded from a config file.
    #[serde(default)]
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    /// Default timeout for each request on this connection.
    #[serde(default = "default_timeout_ms", alias = "timeoutMs")]
    pub timeout_ms: u64,
}

impl ServerConfig {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_cwd(mut self, cwd: &str) -> Self {
        self.cwd = Some(cwd.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// Top-level MCP servers configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct McpServersConfig {
    #[serde(alias = "mcpServers")]
    pub servers: HashMap<String, ServerConfig>,
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC / MCP error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
