pub mod mcp_client;

pub use mcp_client::{
    ConnectionState, McpClient, McpError, McpResult, McpServersConfig, ServerConfig,
    ServerConnection,
};

/// Default filter when `RUST_LOG` is not set.
const DEFAULT_LOG_FILTER: &str = "mcp_host=info,warn";

/// Initialize the tracing subscriber, writing to stderr.
///
/// Filtering follows `RUST_LOG` (default `mcp_host=info,warn`). Set
/// `MCP_HOST_LOG_FORMAT=json` for one JSON object per line. Calling this
/// more than once is harmless.
pub fn init_tracing() {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = std::env::var("MCP_HOST_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if installed.is_ok() {
        tracing::debug!(
            version = env!("CARGO_PKG_VERSION"),
            pid = std::process::id(),
            "tracing initialized"
        );
    }
}
