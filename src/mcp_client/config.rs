//! Server configuration loading.
//!
//! Config files map server names to launch settings:
//!
//! ```json
//! { "servers": { "filesystem": { "command": "npx", "args": ["-y", "@mcp/fs"] } } }
//! ```
//!
//! JSON and YAML are both accepted (chosen by file extension). String values
//! may reference environment variables as `${VAR}` or `${VAR:-default}`.

use std::path::{Path, PathBuf};

use super::errors::McpError;
use super::types::{McpServersConfig, ServerConfig};

/// File name looked up in the user config directory.
pub const CONFIG_FILE_NAME: &str = "mcp-servers.json";

impl McpServersConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, McpError> {
        serde_json::from_str(&interpolate_env_vars(raw)).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, McpError> {
        serde_yaml::from_str(&interpolate_env_vars(raw)).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })
    }

    /// Load a config file.
    ///
    /// Relative `cwd` entries are resolved against the file's directory.
    pub fn from_file(path: &Path) -> Result<Self, McpError> {
        let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml")
        );
        let mut config = if is_yaml {
            Self::from_yaml_str(&raw)?
        } else {
            Self::from_json_str(&raw)?
        };

        let base = path.parent().unwrap_or(Path::new("."));
        for server in config.servers.values_mut() {
            if let Some(cwd) = &server.cwd {
                server.cwd = Some(resolve_dir(base, cwd));
            }
        }

        tracing::info!(
            path = %path.display(),
            count = config.servers.len(),
            "loaded MCP server config"
        );
        Ok(config)
    }

    /// Validated configs sorted by name, with each name taken from its map key.
    pub fn into_server_configs(self) -> Result<Vec<ServerConfig>, McpError> {
        let mut configs: Vec<ServerConfig> = self
            .servers
            .into_iter()
            .map(|(name, mut config)| {
                config.name = name;
                config
            })
            .collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));

        for config in &configs {
            if config.name.trim().is_empty() {
                return Err(McpError::ConfigError {
                    reason: "server name must not be empty".into(),
                });
            }
            if config.command.trim().is_empty() {
                return Err(McpError::ConfigError {
                    reason: format!("server '{}' has an empty command", config.name),
                });
            }
            if config.timeout_ms == 0 {
                return Err(McpError::ConfigError {
                    reason: format!("server '{}' has a zero timeout", config.name),
                });
            }
        }

        Ok(configs)
    }
}

/// `<config dir>/mcp-host/mcp-servers.json`, if the platform has a config dir.
///
/// - macOS: `~/Library/Application Support/mcp-host/`
/// - Linux: `$XDG_CONFIG_HOME/mcp-host/` (fallback `~/.config/mcp-host/`)
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-host\`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("mcp-host").join(CONFIG_FILE_NAME))
}

fn resolve_dir(base: &Path, dir: &str) -> String {
    let expanded = expand_tilde(dir);
    let path = Path::new(&expanded);
    if path.is_absolute() {
        expanded
    } else {
        base.join(path).to_string_lossy().into_owned()
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`. Unset without a default is empty.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
