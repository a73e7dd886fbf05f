//! `mcp-host <config>`: start every configured server, print what they
//! offer, then shut them all down.

use std::path::PathBuf;

use anyhow::{Context, Result};
use mcp_host::mcp_client::config::default_config_path;
use mcp_host::{McpClient, McpServersConfig};

#[tokio::main]
async fn main() -> Result<()> {
    mcp_host::init_tracing();

    let path = match std::env::args_os().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => default_config_path()
            .context("no config path given and no platform config directory")?,
    };

    let configs = McpServersConfig::from_file(&path)
        .and_then(McpServersConfig::into_server_configs)
        .with_context(|| format!("failed to load {}", path.display()))?;

    let client = McpClient::new();
    for (name, error) in client.start_all(configs).await {
        eprintln!("{name}: failed to start: {error}");
    }

    for name in client.server_names().await {
        let state = client
            .server_state(&name)
            .await
            .map(|s| s.to_string())
            .unwrap_or_default();
        println!("{name} [{state}]");
    }

    let tools = client.get_all_tools().await;
    println!("\ntools ({}):", tools.len());
    for (server, tool) in &tools {
        println!("  {server}/{}  {}", tool.name, tool.description);
    }

    let resources = client.get_all_resources().await;
    println!("\nresources ({}):", resources.len());
    for (server, resource) in &resources {
        println!("  {server}/{}  {}", resource.name, resource.uri);
    }

    let prompts = client.get_all_prompts().await;
    println!("\nprompts ({}):", prompts.len());
    for (server, prompt) in &prompts {
        println!(
            "  {server}/{}  {}",
            prompt.name,
            prompt.description.as_deref().unwrap_or("")
        );
    }

    for (name, error) in client.stop_all().await {
        eprintln!("{name}: error during shutdown: {error}");
    }
    Ok(())
}
