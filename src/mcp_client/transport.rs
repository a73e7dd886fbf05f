//! JSON-RPC over stdio transport.
//!
//! Handles low-level framing for MCP server child processes:
//! - `Content-Length: N` header block, blank line, then N bytes of JSON
//! - Header names are case-insensitive; CRLF and LF line endings are accepted
//! - Each outgoing frame goes out as a single write under the writer lock

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::errors::McpError;
use super::types::Message;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Maximum frame body (100MB). A larger declared length is treated as desync.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

const CONTENT_LENGTH: &str = "Content-Length";

// ─── Reading ─────────────────────────────────────────────────────────────────

/// Read one frame body.
///
/// Returns `Ok(None)` at end of stream. A header block without a usable
/// `Content-Length`, an oversized length, or a body cut short by EOF means
/// the stream is desynchronized, which is also reported as `None`.
/// Header lines that cannot be parsed are skipped.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    let mut line = Vec::new();

    loop {
        line.clear();
        let bytes_read = reader.read_until(b'\n', &mut line).await?;
        if bytes_read == 0 {
            return Ok(None);
        }

        let text = String::from_utf8_lossy(&line);
        let trimmed = text.trim();

        if trimmed.is_empty() {
            break;
        }

        let Some((key, value)) = trimmed.split_once(':') else {
            tracing::debug!(header = %trimmed, "skipping malformed header line");
            continue;
        };

        if key.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
            match value.trim().parse::<usize>() {
                Ok(n) => content_length = Some(n),
                Err(_) => {
                    tracing::debug!(value = %value.trim(), "skipping invalid Content-Length");
                }
            }
        }
    }

    let Some(size) = content_length else {
        tracing::warn!("frame header without Content-Length; treating stream as desynchronized");
        return Ok(None);
    };

    if size > MAX_MESSAGE_SIZE {
        tracing::warn!(size, max = MAX_MESSAGE_SIZE, "frame exceeds maximum size");
        return Ok(None);
    }

    let mut body = vec![0u8; size];
    match reader.read_exact(&mut body).await {
        Ok(_) => Ok(Some(body)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            tracing::warn!(expected = size, "stream closed mid-frame");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Read the next well-formed JSON-RPC message.
///
/// Frames whose body is not valid JSON, or not a recognizable JSON-RPC shape,
/// are dropped and reading continues with the next frame.
pub async fn read_message<R>(reader: &mut R) -> io::Result<Option<Message>>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let Some(body) = read_frame(reader).await? else {
            return Ok(None);
        };

        match serde_json::from_slice::<Message>(&body) {
            Ok(message) => return Ok(Some(message)),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    len = body.len(),
                    "dropping unparseable frame"
                );
            }
        }
    }
}

// ─── Writing ─────────────────────────────────────────────────────────────────

/// Serialize a message into a complete frame (header + blank line + body).
pub fn encode_frame(message: &Message) -> io::Result<Vec<u8>> {
    let body = serde_json::to_vec(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let header = format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len());
    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Write one framed message with a single `write_all`, then flush.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

// ─── FrameWriter ─────────────────────────────────────────────────────────────

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Why a deadline-bounded send did not complete.
#[derive(Debug)]
pub enum SendError {
    /// The deadline passed while waiting for the writer. Nothing was written.
    Queued,
    /// The deadline passed mid-frame. The stream may hold a partial frame and
    /// has been detached.
    Stalled,
    /// The stream is not connected or the write failed.
    Failed(McpError),
}

/// Shared, serialized write half of a connection.
///
/// Concurrent senders take the lock for the duration of one frame, so frames
/// never interleave on the wire. Starts detached; `attach` wires it to the
/// server's input stream once the process is spawned.
pub struct FrameWriter {
    server_name: String,
    writer: Mutex<Option<BoxedWriter>>,
}

impl FrameWriter {
    pub fn new(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            writer: Mutex::new(None),
        }
    }

    /// Connect the write half to a byte stream.
    pub async fn attach(&self, writer: impl AsyncWrite + Send + Unpin + 'static) {
        *self.writer.lock().await = Some(Box::new(writer));
    }

    /// Frame and write a message, giving up at `deadline`.
    ///
    /// A peer that stops draining its input cannot hold the lock past the
    /// deadline: the stalled stream is dropped and later sends fail.
    pub async fn send(&self, message: &Message, deadline: Instant) -> Result<(), SendError> {
        let Ok(mut guard) = tokio::time::timeout_at(deadline, self.writer.lock()).await else {
            return Err(SendError::Queued);
        };
        let writer = guard.as_mut().ok_or_else(|| {
            SendError::Failed(McpError::TransportError {
                server: self.server_name.clone(),
                reason: "stdin is not connected".into(),
            })
        })?;

        match tokio::time::timeout_at(deadline, write_message(writer, message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SendError::Failed(McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })),
            Err(_) => {
                tracing::warn!(server = %self.server_name, "stdin write stalled; detaching");
                *guard = None;
                Err(SendError::Stalled)
            }
        }
    }

    /// Close the write half. Later sends fail with a transport error.
    pub async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(server = %self.server_name, error = %e, "error closing stdin");
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
