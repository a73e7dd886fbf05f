//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
///
/// Application-level failures reported by a server (a tool that ran and
/// failed) are not errors: they come back as `McpResult { is_error: true }`.
#[derive(Debug, Error)]
pub enum McpError {
    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// JSON-RPC communication error (closed pipe, I/O error, malformed stream).
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// The connection is not in a state that accepts calls.
    #[error("server '{name}' is unavailable ({state})")]
    Unavailable {
        name: String,
        state: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A request timed out waiting for its response.
    #[error("'{method}' on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// No managed connection has this name.
    #[error("unknown server: '{name}'")]
    UnknownServer {
        name: String,
    },

    /// No connection advertises a tool with this name.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
    },

    /// No connection lists a resource with this URI.
    #[error("unknown resource: '{uri}'")]
    UnknownResource {
        uri: String,
    },

    /// No connection lists a prompt with this name.
    #[error("unknown prompt: '{name}'")]
    UnknownPrompt {
        name: String,
    },

    /// Configuration error (bad config file, unparseable entry).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl McpError {
    /// Whether this error is connection-scoped.
    ///
    /// Transport errors leave the connection FAILED; restoring service takes
    /// an explicit `remove_server` + `add_server`.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            McpError::SpawnFailed { .. }
                | McpError::InitFailed { .. }
                | McpError::TransportError { .. }
                | McpError::Unavailable { .. }
        )
    }
}
