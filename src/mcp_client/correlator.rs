//! Request/response correlation for one connection.
//!
//! Callers register a pending entry keyed by a fresh id, write the request,
//! then suspend on a oneshot receiver. The connection's reader loop resolves
//! the entry when the matching response arrives. A timeout or a dropped
//! caller removes the entry, and any later reply for that id is discarded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::errors::McpError;
use super::transport::{FrameWriter, SendError};
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message};

type Completion = oneshot::Sender<Result<Value, McpError>>;

/// A request that has been sent and not yet answered.
struct PendingRequest {
    method: String,
    deadline: Instant,
    completion: Completion,
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<u64, PendingRequest>,
    /// Set once the connection can no longer deliver responses.
    closed: Option<String>,
}

/// Per-connection id allocator and pending-request table.
pub struct Correlator {
    server_name: String,
    writer: FrameWriter,
    next_id: AtomicU64,
    pending: Mutex<PendingTable>,
    dropped_responses: AtomicU64,
}

impl Correlator {
    pub fn new(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            writer: FrameWriter::new(server_name),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(PendingTable::default()),
            dropped_responses: AtomicU64::new(0),
        }
    }

    /// The write half shared by requests, notifications, and replies.
    pub fn writer(&self) -> &FrameWriter {
        &self.writer
    }

    /// Allocate the next request id. Strictly increasing, never reused.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send a request and wait for its response or for `timeout` to elapse.
    ///
    /// The timeout covers the write as well as the wait. A write that stalls
    /// partway through a frame leaves the stream unusable, so the correlator
    /// is closed and the caller gets a transport error.
    pub async fn send(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let id = self.next_id();
        let deadline = Instant::now() + timeout;
        let (completion, receiver) = oneshot::channel();

        {
            let mut table = self.table();
            if let Some(reason) = &table.closed {
                return Err(McpError::TransportError {
                    server: self.server_name.clone(),
                    reason: reason.clone(),
                });
            }
            table.entries.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    deadline,
                    completion,
                },
            );
        }

        // Removes the entry on every exit path, including caller cancellation.
        let _guard = PendingGuard {
            correlator: self,
            id,
        };

        tracing::trace!(server = %self.server_name, id, method, "sending request");
        let request = JsonRpcRequest::new(id, method, params).into();
        self.write(&request, method, deadline, timeout).await?;

        match tokio::time::timeout_at(deadline, receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(McpError::TransportError {
                server: self.server_name.clone(),
                reason: "connection closed before a response arrived".into(),
            }),
            Err(_) => {
                tracing::debug!(server = %self.server_name, id, method, "request timed out");
                Err(self.timed_out(method, timeout))
            }
        }
    }

    /// Send a notification (no response expected), giving up after `timeout`.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<(), McpError> {
        let notification = JsonRpcNotification::new(method, params).into();
        self.write(&notification, method, Instant::now() + timeout, timeout)
            .await
    }

    /// Send a reply to a server-initiated request, giving up after `timeout`.
    pub async fn reply(
        &self,
        response: JsonRpcResponse,
        timeout: Duration,
    ) -> Result<(), McpError> {
        let message = Message::Response(response);
        self.write(&message, "response", Instant::now() + timeout, timeout)
            .await
    }

    async fn write(
        &self,
        message: &Message,
        method: &str,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<(), McpError> {
        match self.writer.send(message, deadline).await {
            Ok(()) => Ok(()),
            Err(SendError::Queued) => Err(self.timed_out(method, timeout)),
            Err(SendError::Stalled) => {
                let reason = "stdin write stalled past its deadline";
                self.close(reason);
                Err(McpError::TransportError {
                    server: self.server_name.clone(),
                    reason: reason.into(),
                })
            }
            Err(SendError::Failed(e)) => Err(e),
        }
    }

    fn timed_out(&self, method: &str, timeout: Duration) -> McpError {
        McpError::Timeout {
            server: self.server_name.clone(),
            method: method.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Deliver a response to its waiting caller.
    ///
    /// Returns `false` when no pending request has this id (a reply that
    /// arrived after its timeout, or one we never asked for). Such responses
    /// are counted and discarded.
    pub fn resolve(&self, response: JsonRpcResponse) -> bool {
        let entry = response
            .id
            .as_u64()
            .and_then(|id| self.table().entries.remove(&id));

        let Some(entry) = entry else {
            let dropped = self.dropped_responses.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                server = %self.server_name,
                id = %response.id,
                dropped,
                "discarding response with no pending request"
            );
            return false;
        };

        if Instant::now() > entry.deadline {
            tracing::debug!(
                server = %self.server_name,
                id = %response.id,
                method = %entry.method,
                "response arrived at its deadline"
            );
        }

        let outcome = response.outcome.map_err(|e| McpError::ServerError {
            code: e.code,
            message: e.message,
            data: e.data,
        });
        // The caller may have gone away in the meantime; nothing to do then.
        let _ = entry.completion.send(outcome);
        true
    }

    /// Fail every pending request and refuse new ones.
    pub fn close(&self, reason: &str) {
        let drained: Vec<(u64, PendingRequest)> = {
            let mut table = self.table();
            if table.closed.is_none() {
                table.closed = Some(reason.to_string());
            }
            table.entries.drain().collect()
        };

        for (id, entry) in drained {
            tracing::debug!(
                server = %self.server_name,
                id,
                method = %entry.method,
                reason,
                "failing pending request"
            );
            let _ = entry.completion.send(Err(McpError::TransportError {
                server: self.server_name.clone(),
                reason: reason.to_string(),
            }));
        }
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.table().entries.len()
    }

    /// Responses discarded because no request was waiting for them.
    pub fn dropped_responses(&self) -> u64 {
        self.dropped_responses.load(Ordering::Relaxed)
    }
}

/// Removes a pending entry when the sending future completes or is dropped.
struct PendingGuard<'a> {
    correlator: &'a Correlator,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.table().entries.remove(&self.id);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
