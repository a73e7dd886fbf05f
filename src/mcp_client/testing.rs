//! Test doubles: an in-memory MCP peer and scripted shell servers.

use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{duplex, split, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::connection::ServerConnection;
use super::transport::{read_message, write_message};
use super::types::{
    methods, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message,
    RequestId, ServerCapabilities, ServerConfig, ServerNotification, PROTOCOL_VERSION,
};

/// Test timeout to prevent hanging tests.
pub(crate) const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) type ClientReader = ReadHalf<DuplexStream>;
pub(crate) type ClientWriter = WriteHalf<DuplexStream>;

/// The server end of an in-memory connection.
pub(crate) struct FakePeer {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

/// A connected pair: the peer plus the streams to hand to the client.
pub(crate) fn pipe() -> (FakePeer, ClientReader, ClientWriter) {
    let (client, server) = duplex(64 * 1024);
    let (client_reader, client_writer) = split(client);
    let (server_reader, server_writer) = split(server);
    let peer = FakePeer {
        reader: BufReader::new(server_reader),
        writer: server_writer,
    };
    (peer, client_reader, client_writer)
}

impl FakePeer {
    pub(crate) async fn recv(&mut self) -> Message {
        timeout(TEST_TIMEOUT, read_message(&mut self.reader))
            .await
            .expect("timed out waiting for client")
            .unwrap()
            .expect("client closed the stream")
    }

    pub(crate) async fn expect_request(&mut self, method: &str) -> JsonRpcRequest {
        match self.recv().await {
            Message::Request(req) => {
                assert_eq!(req.method, method);
                req
            }
            other => panic!("expected {method} request, got {other:?}"),
        }
    }

    pub(crate) async fn expect_notification(&mut self, method: &str) -> JsonRpcNotification {
        match self.recv().await {
            Message::Notification(note) => {
                assert_eq!(note.method, method);
                note
            }
            other => panic!("expected {method} notification, got {other:?}"),
        }
    }

    pub(crate) async fn send(&mut self, message: Message) {
        write_message(&mut self.writer, &message).await.unwrap();
    }

    pub(crate) async fn respond(&mut self, id: &RequestId, result: Value) {
        self.send(
            JsonRpcResponse {
                id: id.clone(),
                outcome: Ok(result),
            }
            .into(),
        )
        .await;
    }

    pub(crate) async fn respond_error(&mut self, id: &RequestId, code: i32, message: &str) {
        self.send(
            JsonRpcResponse {
                id: id.clone(),
                outcome: Err(JsonRpcError::new(code, message)),
            }
            .into(),
        )
        .await;
    }

    pub(crate) async fn notify(&mut self, method: &str, params: Option<Value>) {
        self.send(JsonRpcNotification::new(method, params).into())
            .await;
    }

    pub(crate) async fn send_request(&mut self, id: RequestId, method: &str) {
        self.send(
            JsonRpcRequest {
                id,
                method: method.to_string(),
                params: None,
            }
            .into(),
        )
        .await;
    }

    /// Answer `initialize` and the list requests that follow it.
    ///
    /// `inventory` maps `tools` / `resources` / `prompts` to the arrays
    /// returned for each advertised capability.
    pub(crate) async fn handshake(&mut self, capabilities: Value, inventory: Value) {
        let req = self.expect_request(methods::INITIALIZE).await;
        self.respond(
            &req.id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": capabilities.clone(),
                "serverInfo": {"name": "fake", "version": "0.1.0"},
            }),
        )
        .await;
        self.expect_notification(methods::INITIALIZED).await;

        let advertised = ServerCapabilities::from_value(&capabilities);
        for (enabled, method, key) in [
            (advertised.tools, methods::TOOLS_LIST, "tools"),
            (advertised.resources, methods::RESOURCES_LIST, "resources"),
            (advertised.prompts, methods::PROMPTS_LIST, "prompts"),
        ] {
            if enabled {
                let req = self.expect_request(method).await;
                let items = inventory.get(key).cloned().unwrap_or_else(|| json!([]));
                let mut result = serde_json::Map::new();
                result.insert(key.to_string(), items);
                self.respond(&req.id, Value::Object(result)).await;
            }
        }
    }

    /// Answer every request with `handler` until the client goes away.
    pub(crate) fn serve<F>(mut self, handler: F) -> JoinHandle<()>
    where
        F: Fn(&JsonRpcRequest) -> Result<Value, JsonRpcError> + Send + 'static,
    {
        tokio::spawn(async move {
            while let Ok(Some(message)) = read_message(&mut self.reader).await {
                let Message::Request(req) = message else {
                    continue;
                };
                let response = JsonRpcResponse {
                    outcome: handler(&req),
                    id: req.id,
                };
                if write_message(&mut self.writer, &response.into()).await.is_err() {
                    break;
                }
            }
        })
    }
}

/// Start `connection` against a fresh in-memory peer.
pub(crate) async fn start_fake(
    connection: &ServerConnection,
    capabilities: Value,
    inventory: Value,
) -> FakePeer {
    let (mut peer, reader, writer) = pipe();
    let (started, ()) = tokio::join!(
        connection.start_io(reader, writer),
        peer.handshake(capabilities, inventory)
    );
    started.expect("handshake should succeed");
    peer
}

pub(crate) async fn fake_connection(
    config: ServerConfig,
    capabilities: Value,
    inventory: Value,
) -> (ServerConnection, FakePeer) {
    let connection = ServerConnection::new(config);
    let peer = start_fake(&connection, capabilities, inventory).await;
    (connection, peer)
}

pub(crate) async fn recv_notification(
    rx: &mut broadcast::Receiver<ServerNotification>,
) -> ServerNotification {
    timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for notification")
        .unwrap()
}

/// Write a `sh` script that completes the handshake with no capabilities,
/// then runs `then`.
///
/// Each launch appends a line to `spawns.log` in `dir`.
#[cfg(unix)]
pub(crate) fn shell_server(dir: &Path, name: &str, then: &str) -> ServerConfig {
    let init_reply = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "result": {
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "serverInfo": {"name": name, "version": "1"},
        },
    });
    let script = format!(
        r#"
read_frame() {{
  len=0
  while IFS= read -r line; do
    line=$(printf '%s' "$line" | tr -d '\r')
    [ -z "$line" ] && break
    case "$line" in
      Content-Length:*) len=${{line#Content-Length: }} ;;
    esac
  done
  dd bs=1 count="$len" 2>/dev/null
}}
send() {{
  printf 'Content-Length: %s\r\n\r\n%s' "${{#1}}" "$1"
}}
echo "$$" >> "{log}"
echo "{name} starting" >&2
read_frame >/dev/null
send '{init_reply}'
read_frame >/dev/null
{then}
"#,
        log = dir.join("spawns.log").display(),
    );

    let path = dir.join(format!("{name}.sh"));
    std::fs::write(&path, script).unwrap();
    ServerConfig::new(name, "sh").with_args([path.display().to_string()])
}

/// Number of processes launched from `shell_server` scripts in `dir`.
#[cfg(unix)]
pub(crate) fn spawn_count(dir: &Path) -> usize {
    std::fs::read_to_string(dir.join("spawns.log"))
        .map(|log| log.lines().count())
        .unwrap_or(0)
}
