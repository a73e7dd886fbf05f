//! Server process lifecycle management.
//!
//! One `ServerConnection` per child process. It owns the process handle, the
//! single background reader task that consumes the server's stdout, the
//! initialize handshake, and the cached tool/resource/prompt lists.
//!
//! States: `Unstarted → Starting → Initialized → Stopping → Stopped`, with
//! `Failed` reachable from `Starting` or `Initialized` on a transport error.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::correlator::Correlator;
use super::errors::McpError;
use super::transport;
use super::types::{
    error_codes, methods, InitializeResult, JsonRpcError, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, McpResult, Message, Prompt, Resource, ServerCapabilities, ServerConfig,
    ServerInfo, ServerNotification, Tool, PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for the initialize request.
///
/// Set to 30s to accommodate servers that load large frameworks at startup.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Time a server gets to exit after stdin is closed before it is killed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How long `stop()` waits for the stderr drain to finish after the process exits.
const STDERR_FLUSH_TIMEOUT: Duration = Duration::from_millis(200);

/// Upper bound on `nextCursor` pages followed for one list.
const MAX_LIST_PAGES: usize = 100;

/// Buffered server notifications per subscriber.
pub const NOTIFICATION_CAPACITY: usize = 64;

const CLIENT_NAME: &str = "mcp-host";

// ─── ConnectionState ─────────────────────────────────────────────────────────

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unstarted,
    Starting,
    Initialized,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Unstarted => "unstarted",
            ConnectionState::Starting => "starting",
            ConnectionState::Initialized => "initialized",
            ConnectionState::Stopping => "stopping",
            ConnectionState::Stopped => "stopped",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Tools,
    Resources,
    Prompts,
}

impl ListKind {
    fn method(self) -> &'static str {
        match self {
            ListKind::Tools => methods::TOOLS_LIST,
            ListKind::Resources => methods::RESOURCES_LIST,
            ListKind::Prompts => methods::PROMPTS_LIST,
        }
    }

    fn from_notification(method: &str) -> Option<Self> {
        match method {
            methods::TOOLS_LIST_CHANGED => Some(ListKind::Tools),
            methods::RESOURCES_LIST_CHANGED => Some(ListKind::Resources),
            methods::PROMPTS_LIST_CHANGED => Some(ListKind::Prompts),
            _ => None,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

// ─── Shared state ────────────────────────────────────────────────────────────

/// State shared between the connection handle and its reader task.
struct Shared {
    config: ServerConfig,
    correlator: Correlator,
    state: watch::Sender<ConnectionState>,
    capabilities: RwLock<ServerCapabilities>,
    server_info: RwLock<Option<ServerInfo>>,
    tools: RwLock<Vec<Tool>>,
    resources: RwLock<Vec<Resource>>,
    prompts: RwLock<Vec<Prompt>>,
    /// One per list kind, held across fetch and store so a slower, older
    /// refresh cannot overwrite a newer one.
    refresh_locks: [Mutex<()>; 3],
    notifications: broadcast::Sender<ServerNotification>,
}

impl Shared {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, to: ConnectionState) {
        let from = self.state.send_replace(to);
        if from != to {
            tracing::info!(server = %self.name(), %from, %to, "connection state changed");
        }
    }

    /// Move `from → to` only if the connection is still in `from`.
    fn advance(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let moved = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::info!(server = %self.name(), %from, %to, "connection state changed");
        }
        moved
    }

    /// Mark the connection FAILED if it was starting or ready.
    fn fail(&self, reason: &str) {
        let mut from = None;
        self.state.send_if_modified(|state| match *state {
            ConnectionState::Starting | ConnectionState::Initialized => {
                from = Some(*state);
                *state = ConnectionState::Failed;
                true
            }
            _ => false,
        });
        if let Some(from) = from {
            tracing::warn!(server = %self.name(), %from, reason, "connection failed");
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let result = self.correlator.send(method, params, timeout).await;
        if let Err(McpError::TransportError { reason, .. }) = &result {
            self.fail(reason);
        }
        result
    }

    /// Run the initialize handshake and populate the capability caches.
    async fn initialize(&self) -> Result<(), McpError> {
        let init_failed = |reason: String| McpError::InitFailed {
            name: self.name().to_string(),
            reason,
        };

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let result = self
            .request(methods::INITIALIZE, Some(params), INIT_TIMEOUT)
            .await
            .map_err(|e| init_failed(e.to_string()))?;

        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| init_failed(format!("failed to parse initialize response: {e}")))?;

        let capabilities = ServerCapabilities::from_value(&init.capabilities);
        tracing::info!(
            server = %self.name(),
            protocol_version = ?init.protocol_version,
            server_name = ?init.server_info.as_ref().and_then(|i| i.name.clone()),
            tools = capabilities.tools,
            resources = capabilities.resources,
            prompts = capabilities.prompts,
            "initialize handshake complete"
        );
        *self.capabilities.write().await = capabilities.clone();
        *self.server_info.write().await = init.server_info;

        self.correlator
            .notify(methods::INITIALIZED, None, INIT_TIMEOUT)
            .await
            .map_err(|e| init_failed(e.to_string()))?;

        for (advertised, kind) in [
            (capabilities.tools, ListKind::Tools),
            (capabilities.resources, ListKind::Resources),
            (capabilities.prompts, ListKind::Prompts),
        ] {
            if advertised {
                self.refresh(kind)
                    .await
                    .map_err(|e| init_failed(format!("{} failed: {e}", kind.method())))?;
            }
        }

        Ok(())
    }

    /// Fetch every page of a list, following `nextCursor`.
    async fn fetch_all<T: DeserializeOwned>(
        &self,
        method: &str,
        key: &str,
    ) -> Result<Vec<T>, McpError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let result = self.request(method, params, self.timeout()).await?;

            if let Some(page) = result.get(key).and_then(Value::as_array) {
                for item in page {
                    match serde_json::from_value::<T>(item.clone()) {
                        Ok(parsed) => items.push(parsed),
                        Err(e) => tracing::warn!(
                            server = %self.name(),
                            method,
                            error = %e,
                            "skipping malformed list entry"
                        ),
                    }
                }
            }

            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                return Ok(items);
            }
        }

        tracing::warn!(
            server = %self.name(),
            method,
            pages = MAX_LIST_PAGES,
            "stopped following list pagination"
        );
        Ok(items)
    }

    /// Re-fetch one cached list, replacing it wholesale.
    async fn refresh(&self, kind: ListKind) -> Result<(), McpError> {
        let _serial = self.refresh_locks[kind.index()].lock().await;
        let count = match kind {
            ListKind::Tools => {
                let tools: Vec<Tool> = self.fetch_all(kind.method(), "tools").await?;
                let count = tools.len();
                *self.tools.write().await = tools;
                count
            }
            ListKind::Resources => {
                let resources: Vec<Resource> =
                    self.fetch_all(kind.method(), "resources").await?;
                let count = resources.len();
                *self.resources.write().await = resources;
                count
            }
            ListKind::Prompts => {
                let prompts: Vec<Prompt> = self.fetch_all(kind.method(), "prompts").await?;
                let count = prompts.len();
                *self.prompts.write().await = prompts;
                count
            }
        };
        tracing::debug!(server = %self.name(), method = kind.method(), count, "refreshed list");
        Ok(())
    }

    fn publish(&self, note: JsonRpcNotification) {
        // No subscribers is fine.
        let _ = self.notifications.send(ServerNotification {
            server: self.name().to_string(),
            method: note.method,
            params: note.params,
        });
    }
}

// ─── Reader loop ─────────────────────────────────────────────────────────────

/// Sole consumer of the server's output stream.
async fn reader_loop<R>(shared: Arc<Shared>, mut reader: R)
where
    R: AsyncBufRead + Unpin,
{
    let reason = loop {
        match transport::read_message(&mut reader).await {
            Ok(Some(Message::Response(response))) => {
                shared.correlator.resolve(response);
            }
            Ok(Some(Message::Notification(note))) => handle_notification(&shared, note),
            Ok(Some(Message::Request(request))) => handle_server_request(&shared, request),
            Ok(None) => break "server closed its output stream".to_string(),
            Err(e) => break format!("failed to read from stdout: {e}"),
        }
    };

    tracing::debug!(server = %shared.name(), reason = %reason, "reader loop exiting");
    shared.correlator.close(&reason);
    shared.fail(&reason);
}

fn handle_notification(shared: &Arc<Shared>, note: JsonRpcNotification) {
    if let Some(kind) = ListKind::from_notification(&note.method) {
        // The refresh waits on responses this loop delivers, so it cannot run inline.
        let shared = shared.clone();
        tokio::spawn(async move {
            if matches!(
                shared.state(),
                ConnectionState::Starting | ConnectionState::Initialized
            ) {
                if let Err(e) = shared.refresh(kind).await {
                    tracing::warn!(
                        server = %shared.name(),
                        method = kind.method(),
                        error = %e,
                        "list refresh failed"
                    );
                }
            }
            shared.publish(note);
        });
        return;
    }

    match note.method.as_str() {
        methods::RESOURCES_UPDATED => shared.publish(note),
        other => tracing::trace!(server = %shared.name(), method = other, "ignoring notification"),
    }
}

fn handle_server_request(shared: &Arc<Shared>, request: JsonRpcRequest) {
    let outcome = match request.method.as_str() {
        methods::PING => Ok(json!({})),
        other => {
            tracing::debug!(server = %shared.name(), method = other, "rejecting server request");
            Err(JsonRpcError::new(
                error_codes::METHOD_NOT_FOUND,
                format!("method not supported by client: {other}"),
            ))
        }
    };

    let shared = shared.clone();
    tokio::spawn(async move {
        let response = JsonRpcResponse {
            id: request.id,
            outcome,
        };
        match shared.correlator.reply(response, shared.timeout()).await {
            Ok(()) => {}
            Err(McpError::TransportError { reason, .. }) => shared.fail(&reason),
            Err(e) => tracing::debug!(
                server = %shared.name(),
                error = %e,
                "failed to answer server request"
            ),
        }
    });
}

/// Forward the server's diagnostic output to the log.
async fn drain_stderr(server: String, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                tracing::debug!(
                    target: "mcp_host::stderr",
                    server = %server,
                    "{}",
                    text.trim_end()
                );
            }
            Err(e) => {
                tracing::debug!(server = %server, error = %e, "stderr read failed");
                break;
            }
        }
    }
}

// ─── ServerConnection ────────────────────────────────────────────────────────

/// A connection to one MCP server.
pub struct ServerConnection {
    shared: Arc<Shared>,
    process: Mutex<Option<Child>>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
    stderr_task: StdMutex<Option<JoinHandle<()>>>,
    shutdown_grace: Duration,
}

impl ServerConnection {
    /// Create an unstarted connection.
    pub fn new(config: ServerConfig) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self::with_notification_sink(config, notifications)
    }

    /// Create an unstarted connection that publishes server notifications to
    /// an existing channel.
    pub fn with_notification_sink(
        config: ServerConfig,
        notifications: broadcast::Sender<ServerNotification>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Unstarted);
        Self {
            shared: Arc::new(Shared {
                correlator: Correlator::new(&config.name),
                config,
                state,
                capabilities: RwLock::new(ServerCapabilities::default()),
                server_info: RwLock::new(None),
                tools: RwLock::new(Vec::new()),
                resources: RwLock::new(Vec::new()),
                prompts: RwLock::new(Vec::new()),
                refresh_locks: Default::default(),
                notifications,
            }),
            process: Mutex::new(None),
            reader_task: StdMutex::new(None),
            stderr_task: StdMutex::new(None),
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }

    /// Override how long `stop()` waits before force-killing.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    fn begin_start(&self) -> Result<(), McpError> {
        if self
            .shared
            .advance(ConnectionState::Unstarted, ConnectionState::Starting)
        {
            Ok(())
        } else {
            Err(self.unavailable())
        }
    }

    /// Spawn the server process and perform the initialization handshake.
    ///
    /// On failure the connection is left FAILED and the process is killed.
    /// No retry is attempted.
    pub async fn start(&self) -> Result<(), McpError> {
        self.begin_start()?;
        let config = &self.shared.config;

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let spawn_failed = |reason: String| McpError::SpawnFailed {
            name: config.name.clone(),
            reason,
        };

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.shared.fail("spawn failed");
                return Err(spawn_failed(format!("{e}")));
            }
        };

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            self.shared.fail("stdio not captured");
            let _ = child.kill().await;
            return Err(spawn_failed("failed to capture stdin/stdout".into()));
        };

        if let Some(stderr) = child.stderr.take() {
            let handle = tokio::spawn(drain_stderr(config.name.clone(), stderr));
            *lock(&self.stderr_task) = Some(handle);
        }

        tracing::info!(
            server = %config.name,
            command = %config.command,
            pid = ?child.id(),
            "spawned server process"
        );
        *self.process.lock().await = Some(child);

        self.handshake(BufReader::new(stdout), stdin).await
    }

    /// Run the handshake over arbitrary byte streams instead of a child process.
    pub async fn start_io<R, W>(&self, reader: R, writer: W) -> Result<(), McpError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.begin_start()?;
        self.handshake(BufReader::new(reader), writer).await
    }

    /// Create a connection and start it over the given streams.
    pub async fn connect_io<R, W>(
        config: ServerConfig,
        reader: R,
        writer: W,
    ) -> Result<Self, McpError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let connection = Self::new(config);
        connection.start_io(reader, writer).await?;
        Ok(connection)
    }

    async fn handshake<R, W>(&self, reader: R, writer: W) -> Result<(), McpError>
    where
        R: AsyncBufRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.shared.correlator.writer().attach(writer).await;

        // The reader must be running before the first request goes out.
        let handle = tokio::spawn(reader_loop(self.shared.clone(), reader));
        if let Some(previous) = lock(&self.reader_task).replace(handle) {
            previous.abort();
        }

        let outcome = match self.shared.initialize().await {
            Ok(())
                if self
                    .shared
                    .advance(ConnectionState::Starting, ConnectionState::Initialized) =>
            {
                Ok(())
            }
            Ok(()) => Err(McpError::InitFailed {
                name: self.name().to_string(),
                reason: format!("connection became {} during startup", self.state()),
            }),
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            self.shared.fail(&e.to_string());
            if let Err(teardown) = self.teardown(Duration::ZERO).await {
                tracing::debug!(
                    server = %self.name(),
                    error = %teardown,
                    "cleanup after failed start"
                );
            }
        }
        outcome
    }

    /// Shut the connection down.
    ///
    /// Cancels the reader, fails pending calls, closes stdin, waits up to the
    /// grace period for the process to exit, then kills it. Always ends in
    /// `Stopped`, even when an error is returned.
    pub async fn stop(&self) -> Result<(), McpError> {
        let already_stopped = !self.shared.state.send_if_modified(|state| {
            if *state == ConnectionState::Stopped {
                false
            } else {
                *state = ConnectionState::Stopping;
                true
            }
        });
        if already_stopped {
            return Ok(());
        }
        tracing::info!(server = %self.name(), "stopping server");

        let result = self.teardown(self.shutdown_grace).await;
        self.shared.set_state(ConnectionState::Stopped);
        result
    }

    async fn teardown(&self, grace: Duration) -> Result<(), McpError> {
        let reader = lock(&self.reader_task).take();
        if let Some(reader) = reader {
            reader.abort();
        }
        self.shared.correlator.close("connection stopped");

        // Closing stdin waits behind any in-flight write, which a server that
        // stopped reading never finishes. Both steps share the grace period.
        let deadline = Instant::now() + grace;
        let writer = self.shared.correlator.writer();
        if tokio::time::timeout_at(deadline, writer.close()).await.is_err() {
            tracing::warn!(server = %self.name(), "stdin is blocked; not waiting to close it");
        }

        let mut result = Ok(());
        let child = self.process.lock().await.take();
        if let Some(mut child) = child {
            let waited = tokio::time::timeout_at(deadline, child.wait()).await;
            match waited {
                Ok(Ok(status)) => {
                    tracing::debug!(server = %self.name(), %status, "server exited");
                }
                outcome => {
                    if let Ok(Err(e)) = outcome {
                        tracing::warn!(
                            server = %self.name(),
                            error = %e,
                            "failed to wait for server"
                        );
                    } else if !grace.is_zero() {
                        tracing::warn!(
                            server = %self.name(),
                            grace_ms = grace.as_millis() as u64,
                            "server did not exit in time; killing"
                        );
                    }
                    if let Err(e) = child.kill().await {
                        result = Err(McpError::TransportError {
                            server: self.name().to_string(),
                            reason: format!("failed to kill server process: {e}"),
                        });
                    }
                }
            }
        }

        let stderr = lock(&self.stderr_task).take();
        if let Some(mut stderr) = stderr {
            if tokio::time::timeout(STDERR_FLUSH_TIMEOUT, &mut stderr)
                .await
                .is_err()
            {
                stderr.abort();
            }
        }

        result
    }

    // ─── Calls ───────────────────────────────────────────────────────────

    fn unavailable(&self) -> McpError {
        McpError::Unavailable {
            name: self.name().to_string(),
            state: self.state().to_string(),
        }
    }

    fn ensure_ready(&self) -> Result<(), McpError> {
        if self.state() == ConnectionState::Initialized {
            Ok(())
        } else {
            Err(self.unavailable())
        }
    }

    /// Send an arbitrary request with the connection's default timeout.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        self.ensure_ready()?;
        self.shared
            .request(method, params, self.shared.timeout())
            .await
    }

    /// Invoke a tool. A tool that runs and fails comes back with `is_error`.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<McpResult, McpError> {
        self.call_tool_with_timeout(name, arguments, self.shared.timeout())
            .await
    }

    pub async fn call_tool_with_timeout(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<McpResult, McpError> {
        self.ensure_ready()?;
        let params = json!({
            "name": name,
            "arguments": arguments,
        });
        let result = self
            .shared
            .request(methods::TOOLS_CALL, Some(params), timeout)
            .await?;
        Ok(McpResult::from_tool_result(result))
    }

    /// Read a resource by URI.
    pub async fn read_resource(&self, uri: &str) -> Result<McpResult, McpError> {
        let result = self
            .request(methods::RESOURCES_READ, Some(json!({ "uri": uri })))
            .await?;
        Ok(McpResult::from_resource_result(result))
    }

    /// Render a prompt template.
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<McpResult, McpError> {
        let mut params = json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        let result = self.request(methods::PROMPTS_GET, Some(params)).await?;
        Ok(McpResult::from_prompt_result(result))
    }

    /// Liveness check.
    pub async fn ping(&self) -> Result<(), McpError> {
        self.request(methods::PING, None).await.map(|_| ())
    }

    /// Re-fetch the tool list from the server.
    pub async fn list_tools(&self) -> Result<Vec<Tool>, McpError> {
        self.ensure_ready()?;
        self.shared.refresh(ListKind::Tools).await?;
        Ok(self.tools().await)
    }

    /// Re-fetch the resource list from the server.
    pub async fn list_resources(&self) -> Result<Vec<Resource>, McpError> {
        self.ensure_ready()?;
        self.shared.refresh(ListKind::Resources).await?;
        Ok(self.resources().await)
    }

    /// Re-fetch the prompt list from the server.
    pub async fn list_prompts(&self) -> Result<Vec<Prompt>, McpError> {
        self.ensure_ready()?;
        self.shared.refresh(ListKind::Prompts).await?;
        Ok(self.prompts().await)
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Receive `resources/updated` and list-changed notifications.
    ///
    /// List-changed events are delivered after the cache has been refreshed.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerNotification> {
        self.shared.notifications.subscribe()
    }

    pub async fn capabilities(&self) -> ServerCapabilities {
        self.shared.capabilities.read().await.clone()
    }

    pub async fn server_info(&self) -> Option<ServerInfo> {
        self.shared.server_info.read().await.clone()
    }

    /// Cached tool list.
    pub async fn tools(&self) -> Vec<Tool> {
        self.shared.tools.read().await.clone()
    }

    /// Cached resource list.
    pub async fn resources(&self) -> Vec<Resource> {
        self.shared.resources.read().await.clone()
    }

    /// Cached prompt list.
    pub async fn prompts(&self) -> Vec<Prompt> {
        self.shared.prompts.read().await.clone()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.correlator.pending_count()
    }

    /// Responses that arrived with no pending request (usually late replies).
    pub fn dropped_responses(&self) -> u64 {
        self.shared.correlator.dropped_responses()
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        // The child itself is killed by `kill_on_drop`.
        if let Some(reader) = lock(&self.reader_task).take() {
            reader.abort();
        }
        if let Some(stderr) = lock(&self.stderr_task).take() {
            stderr.abort();
        }
    }
}

impl fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnection")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
