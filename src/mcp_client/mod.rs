//! MCP Client: JSON-RPC over stdio transport for MCP server management.
//!
//! This module handles:
//! - Content-Length framing of JSON-RPC 2.0 messages over process stdio
//! - Correlating concurrent requests with their out-of-order responses
//! - Per-server lifecycle (spawn, initialize handshake, graceful shutdown)
//! - Aggregating tools/resources/prompts across servers and routing calls

pub mod client;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod errors;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use client::McpClient;
pub use connection::{ConnectionState, ServerConnection};
pub use errors::McpError;
pub use types::{
    McpResult, McpServersConfig, Prompt, Resource, ServerConfig, ServerNotification, Tool,
};
