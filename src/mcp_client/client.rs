//! MCP Client: the multi-server registry.
//!
//! Owns a name → connection map, aggregates tool/resource/prompt lists across
//! connections, routes calls by name, and coordinates shutdown. No lock spans
//! more than one connection: aggregate reads fan out concurrently, each bounded
//! by its own timeout.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

use super::connection::{ConnectionState, ServerConnection, NOTIFICATION_CAPACITY, SHUTDOWN_GRACE};
use super::errors::McpError;
use super::types::{McpResult, Prompt, Resource, ServerConfig, ServerNotification, Tool};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Bound on how long one connection may take to contribute to an aggregate.
const AGGREGATE_TIMEOUT: Duration = Duration::from_secs(5);

// ─── McpClient ───────────────────────────────────────────────────────────────

/// High-level MCP client that manages multiple servers and routes calls.
pub struct McpClient {
    connections: RwLock<HashMap<String, Arc<ServerConnection>>>,
    /// Shared by every connection this client creates.
    notifications: broadcast::Sender<ServerNotification>,
    shutdown_grace: Duration,
    aggregate_timeout: Duration,
}

impl Default for McpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl McpClient {
    pub fn new() -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            connections: RwLock::new(HashMap::new()),
            notifications,
            shutdown_grace: SHUTDOWN_GRACE,
            aggregate_timeout: AGGREGATE_TIMEOUT,
        }
    }

    /// Grace period given to each server on stop before it is killed.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Per-connection bound for `get_all_*` aggregation.
    pub fn with_aggregate_timeout(mut self, timeout: Duration) -> Self {
        self.aggregate_timeout = timeout;
        self
    }

    /// Notifications from every connection created by this client.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerNotification> {
        self.notifications.subscribe()
    }

    /// An unstarted connection wired to this client's notification channel
    /// and shutdown grace. Start it, then hand it to `add_connection`.
    pub fn new_connection(&self, config: ServerConfig) -> ServerConnection {
        ServerConnection::with_notification_sink(config, self.notifications.clone())
            .with_shutdown_grace(self.shutdown_grace)
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start a server unless one with the same name is already managed.
    ///
    /// An existing connection is returned unchanged, whatever its state. A
    /// connection that fails to start is not kept.
    pub async fn add_server(
        &self,
        config: ServerConfig,
    ) -> Result<Arc<ServerConnection>, McpError> {
        let connection = {
            let mut connections = self.connections.write().await;
            if let Some(existing) = connections.get(&config.name) {
                tracing::debug!(server = %config.name, "server already managed; reusing");
                return Ok(existing.clone());
            }
            let connection = Arc::new(self.new_connection(config));
            connections.insert(connection.name().to_string(), connection.clone());
            connection
        };

        if let Err(e) = connection.start().await {
            tracing::warn!(server = %connection.name(), error = %e, "failed to start server");
            let mut connections = self.connections.write().await;
            if connections
                .get(connection.name())
                .is_some_and(|current| Arc::ptr_eq(current, &connection))
            {
                connections.remove(connection.name());
            }
            return Err(e);
        }

        Ok(connection)
    }

    /// Manage a connection that was started elsewhere (e.g. over `start_io`).
    ///
    /// Idempotent by name like `add_server`: if the name is taken, the
    /// existing connection is returned and `connection` is dropped.
    pub async fn add_connection(&self, connection: ServerConnection) -> Arc<ServerConnection> {
        let mut connections = self.connections.write().await;
        if let Some(existing) = connections.get(connection.name()) {
            return existing.clone();
        }
        let connection = Arc::new(connection);
        connections.insert(connection.name().to_string(), connection.clone());
        connection
    }

    /// Start every config concurrently.
    ///
    /// Returns the servers that failed to start (partial startup is OK).
    pub async fn start_all<I>(&self, configs: I) -> Vec<(String, McpError)>
    where
        I: IntoIterator<Item = ServerConfig>,
    {
        let starts = configs.into_iter().map(|config| async move {
            let name = config.name.clone();
            self.add_server(config).await.err().map(|e| (name, e))
        });
        join_all(starts).await.into_iter().flatten().collect()
    }

    /// Stop a server and forget it. Returns `false` if the name is unknown.
    pub async fn remove_server(&self, name: &str) -> bool {
        let removed = self.connections.write().await.remove(name);
        let Some(connection) = removed else {
            return false;
        };
        if let Err(e) = connection.stop().await {
            tracing::warn!(server = %name, error = %e, "error while stopping server");
        }
        true
    }

    /// Stop every managed server, continuing past individual failures.
    ///
    /// Each stop is bounded by the shutdown grace plus a kill, so this
    /// returns even if some servers never exit on their own.
    pub async fn stop_all(&self) -> Vec<(String, McpError)> {
        let drained: Vec<Arc<ServerConnection>> = {
            let mut connections = self.connections.write().await;
            connections.drain().map(|(_, c)| c).collect()
        };
        tracing::info!(count = drained.len(), "stopping all servers");

        let stops = drained.iter().map(|connection| async move {
            connection
                .stop()
                .await
                .err()
                .map(|e| (connection.name().to_string(), e))
        });
        let errors: Vec<(String, McpError)> = join_all(stops).await.into_iter().flatten().collect();
        for (name, e) in &errors {
            tracing::warn!(server = %name, error = %e, "error while stopping server");
        }
        errors
    }

    // ─── Aggregation ─────────────────────────────────────────────────────

    /// Initialized connections, ordered by name.
    async fn ready_connections(&self) -> Vec<Arc<ServerConnection>> {
        let mut ready: Vec<Arc<ServerConnection>> = self
            .connections
            .read()
            .await
            .values()
            .filter(|c| c.state() == ConnectionState::Initialized)
            .cloned()
            .collect();
        ready.sort_by(|a, b| a.name().cmp(b.name()));
        ready
    }

    /// Gather one list from every ready connection concurrently.
    async fn gather<T, F, Fut>(&self, list: F) -> Vec<(String, T)>
    where
        F: Fn(Arc<ServerConnection>) -> Fut,
        Fut: Future<Output = Vec<T>>,
    {
        let timeout = self.aggregate_timeout;
        let lists = self.ready_connections().await.into_iter().map(|connection| {
            let items = list(connection.clone());
            async move {
                match tokio::time::timeout(timeout, items).await {
                    Ok(items) => items
                        .into_iter()
                        .map(|item| (connection.name().to_string(), item))
                        .collect(),
                    Err(_) => {
                        tracing::warn!(
                            server = %connection.name(),
                            "skipping server in aggregate: timed out"
                        );
                        Vec::new()
                    }
                }
            }
        });
        join_all(lists).await.into_iter().flatten().collect()
    }

    /// `(server_name, tool)` pairs across all ready servers.
    pub async fn get_all_tools(&self) -> Vec<(String, Tool)> {
        self.gather(|c| async move { c.tools().await }).await
    }

    /// `(server_name, resource)` pairs across all ready servers.
    pub async fn get_all_resources(&self) -> Vec<(String, Resource)> {
        self.gather(|c| async move { c.resources().await }).await
    }

    /// `(server_name, prompt)` pairs across all ready servers.
    pub async fn get_all_prompts(&self) -> Vec<(String, Prompt)> {
        self.gather(|c| async move { c.prompts().await }).await
    }

    // ─── Routing ─────────────────────────────────────────────────────────

    pub async fn get(&self, name: &str) -> Option<Arc<ServerConnection>> {
        self.connections.read().await.get(name).cloned()
    }

    async fn require(&self, name: &str) -> Result<Arc<ServerConnection>, McpError> {
        self.get(name).await.ok_or_else(|| McpError::UnknownServer {
            name: name.to_string(),
        })
    }

    /// First ready server (by name) advertising this tool.
    pub async fn find_server_for_tool(&self, tool: &str) -> Option<Arc<ServerConnection>> {
        for connection in self.ready_connections().await {
            if connection.tools().await.iter().any(|t| t.name == tool) {
                return Some(connection);
            }
        }
        None
    }

    /// First ready server (by name) listing this resource URI.
    pub async fn find_server_for_resource(&self, uri: &str) -> Option<Arc<ServerConnection>> {
        for connection in self.ready_connections().await {
            if connection.resources().await.iter().any(|r| r.uri == uri) {
                return Some(connection);
            }
        }
        None
    }

    /// First ready server (by name) listing this prompt.
    pub async fn find_server_for_prompt(&self, prompt: &str) -> Option<Arc<ServerConnection>> {
        for connection in self.ready_connections().await {
            if connection.prompts().await.iter().any(|p| p.name == prompt) {
                return Some(connection);
            }
        }
        None
    }

    /// Execute a tool call.
    ///
    /// With a server name the call is dispatched there directly; without one,
    /// the first ready server advertising `tool` handles it.
    pub async fn call_tool(
        &self,
        server: Option<&str>,
        tool: &str,
        arguments: Value,
    ) -> Result<McpResult, McpError> {
        let connection = match server {
            Some(name) => self.require(name).await?,
            None => self
                .find_server_for_tool(tool)
                .await
                .ok_or_else(|| McpError::UnknownTool {
                    name: tool.to_string(),
                })?,
        };
        tracing::debug!(server = %connection.name(), tool, "dispatching tool call");
        connection.call_tool(tool, arguments).await
    }

    /// Read a resource, routed like `call_tool`.
    pub async fn read_resource(
        &self,
        server: Option<&str>,
        uri: &str,
    ) -> Result<McpResult, McpError> {
        let connection = match server {
            Some(name) => self.require(name).await?,
            None => self
                .find_server_for_resource(uri)
                .await
                .ok_or_else(|| McpError::UnknownResource {
                    uri: uri.to_string(),
                })?,
        };
        connection.read_resource(uri).await
    }

    /// Render a prompt, routed like `call_tool`.
    pub async fn get_prompt(
        &self,
        server: Option<&str>,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<McpResult, McpError> {
        let connection = match server {
            Some(server) => self.require(server).await?,
            None => self
                .find_server_for_prompt(name)
                .await
                .ok_or_else(|| McpError::UnknownPrompt {
                    name: name.to_string(),
                })?,
        };
        connection.get_prompt(name, arguments).await
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Names of all managed servers, sorted.
    pub async fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn server_state(&self, name: &str) -> Option<ConnectionState> {
        self.connections.read().await.get(name).map(|c| c.state())
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::testing::{self, FakePeer};
    use crate::mcp_client::types::{error_codes, methods, JsonRpcError};
    use serde_json::json;
    use std::time::Instant;

    /// Answers `tools/call` with "<server>:<tool>" and `resources/read` /
    /// `prompts/get` with a fixed body.
    fn serve_as(peer: FakePeer, server: &'static str) {
        peer.serve(move |req| match req.method.as_str() {
            methods::TOOLS_CALL => {
                let tool = req.params.as_ref().and_then(|p| p["name"].as_str()).unwrap_or("");
                Ok(json!({"content": [{"type": "text", "text": format!("{server}:{tool}")}]}))
            }
            methods::RESOURCES_READ => Ok(json!({"contents": [
                {"uri": "file:///notes.md", "mimeType": "text/markdown", "text": "# notes"}
            ]})),
            methods::PROMPTS_GET => Ok(json!({
                "description": "summarize",
                "messages": [{"role": "user", "content": {"type": "text", "text": "Summarize it"}}]
            })),
            other => Err(JsonRpcError::new(error_codes::METHOD_NOT_FOUND, other)),
        });
    }

    async fn add_fake(
        client: &McpClient,
        name: &str,
        capabilities: Value,
        inventory: Value,
    ) -> (Arc<ServerConnection>, FakePeer) {
        let connection = client.new_connection(ServerConfig::new(name, "unused"));
        let peer = testing::start_fake(&connection, capabilities, inventory).await;
        (client.add_connection(connection).await, peer)
    }

    /// serverA exposes `read_file` and a resource, serverB exposes `search`
    /// and a prompt.
    async fn two_servers() -> (McpClient, FakePeer, FakePeer) {
        let client = McpClient::new();
        let (_, a) = add_fake(
            &client,
            "serverA",
            json!({"tools": {}, "resources": {}}),
            json!({
                "tools": [{"name": "read_file", "description": "reads a file"}],
                "resources": [{"uri": "file:///notes.md", "name": "notes"}],
            }),
        )
        .await;
        let (_, b) = add_fake(
            &client,
            "serverB",
            json!({"tools": {}, "prompts": {}}),
            json!({
                "tools": [{"name": "search"}],
                "prompts": [{
                    "name": "summarize",
                    "arguments": [{"name": "topic", "required": true}],
                }],
            }),
        )
        .await;
        (client, a, b)
    }

    #[tokio::test]
    async fn test_new_client_empty() {
        let client = McpClient::new();
        assert!(client.is_empty().await);
        assert!(client.get_all_tools().await.is_empty());
        assert!(client.server_state("filesystem").await.is_none());
    }

    #[tokio::test]
    async fn test_aggregates_across_servers() {
        let (client, _a, _b) = two_servers().await;

        let tools: Vec<(String, String)> = client
            .get_all_tools()
            .await
            .into_iter()
            .map(|(server, tool)| (server, tool.name))
            .collect();
        assert_eq!(
            tools,
            vec![
                ("serverA".to_string(), "read_file".to_string()),
                ("serverB".to_string(), "search".to_string()),
            ]
        );

        let resources = client.get_all_resources().await;
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].0, "serverA");

        let prompts = client.get_all_prompts().await;
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].1.arguments[0].name, "topic");
        assert!(prompts[0].1.arguments[0].required);

        assert_eq!(client.server_names().await, vec!["serverA", "serverB"]);
        assert_eq!(client.len().await, 2);
    }

    #[tokio::test]
    async fn test_call_tool_routing() {
        let (client, a, b) = two_servers().await;
        serve_as(a, "serverA");
        serve_as(b, "serverB");

        let result = client
            .call_tool(None, "read_file", json!({"path": "x"}))
            .await
            .unwrap();
        assert_eq!(result.text(), "serverA:read_file");

        let result = client
            .call_tool(Some("serverB"), "search", json!({"q": "rust"}))
            .await
            .unwrap();
        assert_eq!(result.text(), "serverB:search");

        let err = client.call_tool(None, "nope", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::UnknownTool { ref name } if name == "nope"));

        let err = client
            .call_tool(Some("ghost"), "read_file", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::UnknownServer { .. }));
    }

    #[tokio::test]
    async fn test_read_resource_and_get_prompt_routing() {
        let (client, a, b) = two_servers().await;
        serve_as(a, "serverA");
        serve_as(b, "serverB");

        let result = client.read_resource(None, "file:///notes.md").await.unwrap();
        assert_eq!(result.text(), "# notes");

        let result = client
            .get_prompt(None, "summarize", Some(json!({"topic": "rust"})))
            .await
            .unwrap();
        assert_eq!(result.description.as_deref(), Some("summarize"));
        assert_eq!(result.messages.len(), 1);

        let err = client.read_resource(None, "file:///missing").await.unwrap_err();
        assert!(matches!(err, McpError::UnknownResource { .. }));
        let err = client.get_prompt(None, "missing", None).await.unwrap_err();
        assert!(matches!(err, McpError::UnknownPrompt { .. }));
    }

    #[tokio::test]
    async fn test_failed_server_is_isolated() {
        let (client, a, b) = two_servers().await;
        serve_as(b, "serverB");

        let server_a = client.get("serverA").await.unwrap();
        let mut states = server_a.state_changes();
        drop(a);
        tokio::time::timeout(
            testing::TEST_TIMEOUT,
            states.wait_for(|s| *s == ConnectionState::Failed),
        )
        .await
        .unwrap()
        .unwrap();

        let tools = client.get_all_tools().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].0, "serverB");

        let err = client
            .call_tool(Some("serverA"), "read_file", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Unavailable { .. }));

        let result = client.call_tool(None, "search", json!({})).await.unwrap();
        assert_eq!(result.text(), "serverB:search");

        // Restoring service takes an explicit remove + add.
        assert!(client.remove_server("serverA").await);
        assert!(!client.remove_server("serverA").await);
        assert_eq!(client.server_names().await, vec!["serverB"]);
    }

    #[tokio::test]
    async fn test_add_connection_is_idempotent() {
        let client = McpClient::new();
        let (first, _peer) = add_fake(&client, "serverA", json!({}), json!({})).await;
        let (second, _other) = add_fake(&client, "serverA", json!({}), json!({})).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(client.len().await, 1);
    }

    #[tokio::test]
    async fn test_notifications_fan_in() {
        let client = McpClient::new();
        let mut rx = client.subscribe();
        let caps = json!({"resources": {"subscribe": true}});
        let (_, mut a) = add_fake(&client, "serverA", caps.clone(), json!({})).await;
        let (_, mut b) = add_fake(&client, "serverB", caps, json!({})).await;

        a.notify(methods::RESOURCES_UPDATED, Some(json!({"uri": "file:///a"}))).await;
        let note = testing::recv_notification(&mut rx).await;
        assert_eq!(note.server, "serverA");

        b.notify(methods::RESOURCES_UPDATED, Some(json!({"uri": "file:///b"}))).await;
        let note = testing::recv_notification(&mut rx).await;
        assert_eq!(note.server, "serverB");
    }

    #[tokio::test]
    async fn test_stop_all_empties_registry() {
        let (client, _a, _b) = two_servers().await;
        let errors = client.stop_all().await;
        assert!(errors.is_empty());
        assert!(client.is_empty().await);
    }

    #[tokio::test]
    async fn test_add_server_spawn_failure_is_not_kept() {
        let client = McpClient::new();
        let config = ServerConfig::new("missing", "/nonexistent/definitely-not-a-server");
        let Err(err) = client.add_server(config).await else {
            panic!("expected spawn failure");
        };
        assert!(matches!(err, McpError::SpawnFailed { .. }));
        assert!(client.is_empty().await);
    }

    #[tokio::test]
    async fn test_start_all_reports_partial_failures() {
        let client = McpClient::new();
        let failures = client
            .start_all([
                ServerConfig::new("bad1", "/nonexistent/one"),
                ServerConfig::new("bad2", "/nonexistent/two"),
            ])
            .await;
        let mut names: Vec<String> = failures.into_iter().map(|(name, _)| name).collect();
        names.sort();
        assert_eq!(names, vec!["bad1", "bad2"]);
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::mcp_client::testing::{shell_server, spawn_count};

        #[tokio::test]
        async fn test_add_server_twice_spawns_once() {
            let dir = tempfile::tempdir().unwrap();
            let config = shell_server(dir.path(), "shell", "cat >/dev/null");
            let client = McpClient::new();

            let (first, second) = tokio::join!(
                client.add_server(config.clone()),
                client.add_server(config.clone())
            );
            let (first, second) = (first.unwrap(), second.unwrap());
            assert!(Arc::ptr_eq(&first, &second));

            let third = client.add_server(config).await.unwrap();
            assert!(Arc::ptr_eq(&first, &third));
            assert_eq!(spawn_count(dir.path()), 1);
            assert_eq!(client.server_state("shell").await, Some(ConnectionState::Initialized));

            assert!(client.stop_all().await.is_empty());
        }

        #[tokio::test]
        async fn test_stop_all_bounded_with_unresponsive_server() {
            let dir = tempfile::tempdir().unwrap();
            let stubborn = shell_server(
                dir.path(),
                "stubborn",
                "trap '' TERM; exec 0<&-; while :; do sleep 1; done",
            );
            let polite = shell_server(dir.path(), "polite", "cat >/dev/null");

            let client = McpClient::new().with_shutdown_grace(Duration::from_millis(300));
            assert!(client.start_all([stubborn, polite]).await.is_empty());
            assert_eq!(spawn_count(dir.path()), 2);

            let started = Instant::now();
            let errors = client.stop_all().await;
            assert!(errors.is_empty(), "{errors:?}");
            assert!(started.elapsed() < Duration::from_secs(3));
            assert!(client.is_empty().await);
        }
    }
}
