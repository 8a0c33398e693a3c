//! Newline-delimited JSON-RPC over an async byte stream.
//!
//! A background task owns the read half and routes each response to the
//! request waiting for it, so a request that times out never leaves a stale
//! reply in the way of the next one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, trace, warn};

use crate::protocol::{
    Incoming, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
};

/// Maximum size of a single message (1MB).
/// Sized for large tool outputs (file reads, search results).
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

type Writer = FramedWrite<BoxedWriter, LinesCodec>;
type Pending = HashMap<RequestId, oneshot::Sender<JsonRpcResponse>>;

/// Why a request produced no result.
#[derive(Debug)]
pub(crate) enum RequestError {
    Timeout,
    Disconnected,
    Rpc(JsonRpcError),
    Encode(serde_json::Error),
}

pub(crate) struct Transport {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
}

struct Shared {
    server: String,
    writer: Mutex<Option<Writer>>,
    pending: StdMutex<Pending>,
    next_id: AtomicI64,
    alive: AtomicBool,
}

impl Transport {
    /// Start routing messages for `server` over the given stream halves.
    pub(crate) fn start(server: impl Into<String>, reader: BoxedReader, writer: BoxedWriter) -> Self {
        let shared = Arc::new(Shared {
            server: server.into(),
            writer: Mutex::new(Some(FramedWrite::new(writer, LinesCodec::new()))),
            pending: StdMutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            alive: AtomicBool::new(true),
        });

        let lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_OUTPUT_SIZE));
        let reader = tokio::spawn(Arc::clone(&shared).read_loop(lines));

        Self { shared, reader }
    }

    /// Whether the peer is still connected.
    pub(crate) fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// Send a request and wait up to `limit` for its response.
    pub(crate) async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        limit: Duration,
    ) -> Result<Value, RequestError> {
        if !self.is_alive() {
            return Err(RequestError::Disconnected);
        }

        let id = RequestId::Number(self.shared.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        let _slot = PendingSlot::insert(&self.shared, id.clone(), tx);

        let mut request = JsonRpcRequest::new(id.clone(), method);
        request.params = params;

        let exchange = async {
            self.shared.write(&request).await?;
            rx.await.map_err(|_| RequestError::Disconnected)
        };

        let response = tokio::time::timeout(limit, exchange)
            .await
            .map_err(|_| {
                debug!(server = %self.shared.server, %id, method, "request timed out");
                RequestError::Timeout
            })??;

        response.into_result().map_err(RequestError::Rpc)
    }

    /// Send a notification (no response expected).
    pub(crate) async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), RequestError> {
        let mut notification = JsonRpcNotification::new(method);
        notification.params = params;
        self.shared.write(&notification).await
    }

    /// Release the stream. Pending requests observe a disconnect.
    pub(crate) async fn close(&self) {
        self.shared.alive.store(false, Ordering::SeqCst);
        self.reader.abort();
        self.shared.writer.lock().await.take();
        self.shared.fail_pending();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl Shared {
    async fn read_loop(self: Arc<Self>, mut lines: FramedRead<BoxedReader, LinesCodec>) {
        while let Some(frame) = lines.next().await {
            match frame {
                Ok(line) => self.handle_line(&line).await,
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(
                        server = %self.server,
                        max = MAX_OUTPUT_SIZE,
                        "discarding oversized message from tool provider"
                    );
                }
                Err(LinesCodecError::Io(e)) => {
                    warn!(server = %self.server, error = %e, "tool provider stream failed");
                    break;
                }
            }
        }

        debug!(server = %self.server, "tool provider stream closed");
        self.alive.store(false, Ordering::SeqCst);
        self.writer.lock().await.take();
        self.fail_pending();
    }

    async fn handle_line(&self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }

        let incoming = match Incoming::parse(trimmed) {
            Ok(incoming) => incoming,
            Err(e) => {
                debug!(server = %self.server, line = trimmed, error = %e, "skipping non-JSON-RPC line");
                return;
            }
        };

        match incoming {
            Incoming::Response(response) => {
                let waiter = self.lock_pending().remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        debug!(
                            server = %self.server,
                            id = %response.id,
                            "discarding response for unknown or expired request"
                        );
                    }
                }
            }
            Incoming::Request { id, method, .. } => {
                let reply = if method == "ping" {
                    JsonRpcResponse::success(id, Value::Object(Default::default()))
                } else {
                    warn!(server = %self.server, method, "tool provider sent unsupported request");
                    JsonRpcResponse::failure(
                        id,
                        JsonRpcError::new(
                            JsonRpcError::METHOD_NOT_FOUND,
                            format!("client does not implement method '{method}'"),
                        ),
                    )
                };
                if let Err(e) = self.write(&reply).await {
                    debug!(server = %self.server, error = ?e, "failed to answer provider request");
                }
            }
            Incoming::Notification { method, .. } => {
                trace!(server = %self.server, method, "notification from tool provider");
            }
        }
    }

    async fn write(&self, message: &impl Serialize) -> Result<(), RequestError> {
        let line = serde_json::to_string(message).map_err(RequestError::Encode)?;
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(RequestError::Disconnected)?;
        sink.send(line).await.map_err(|e| {
            debug!(server = %self.server, error = %e, "write to tool provider failed");
            RequestError::Disconnected
        })
    }

    fn fail_pending(&self) {
        // Dropping the senders wakes every waiter with a disconnect.
        self.lock_pending().clear();
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes a pending entry when the request finishes, times out or is
/// cancelled.
struct PendingSlot<'a> {
    shared: &'a Shared,
    id: RequestId,
}

impl<'a> PendingSlot<'a> {
    fn insert(shared: &'a Shared, id: RequestId, tx: oneshot::Sender<JsonRpcResponse>) -> Self {
        shared.lock_pending().insert(id.clone(), tx);
        Self { shared, id }
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.shared.lock_pending().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn pair() -> (Transport, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(client);
        let transport = Transport::start("test", Box::new(read), Box::new(write));
        (transport, server)
    }

    #[tokio::test]
    async fn late_response_is_discarded() {
        let (transport, server) = pair();
        let (read, mut write) = tokio::io::split(server);
        let mut lines = BufReader::new(read).lines();

        let slow = transport.request("slow", None, Duration::from_millis(50));
        let (outcome, first) = tokio::join!(slow, lines.next_line());
        assert!(matches!(outcome, Err(RequestError::Timeout)));
        let first: Value = serde_json::from_str(&first.unwrap().unwrap()).unwrap();
        assert_eq!(first["id"], 1);

        // Answer the expired request, then the live one.
        let serve = async {
            let second = lines.next_line().await.unwrap().unwrap();
            let second: Value = serde_json::from_str(&second).unwrap();
            write
                .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":\"stale\"}\n")
                .await
                .unwrap();
            let reply = format!(
                "{{\"jsonrpc\":\"2.0\",\"id\":{},\"result\":\"fresh\"}}\n",
                second["id"]
            );
            write.write_all(reply.as_bytes()).await.unwrap();
        };
        let (result, ()) = tokio::join!(
            transport.request("fast", None, Duration::from_secs(5)),
            serve
        );
        assert_eq!(result.unwrap(), Value::String("fresh".into()));
        assert!(transport.is_alive());
    }

    #[tokio::test]
    async fn eof_fails_pending_requests() {
        let (transport, server) = pair();
        let request = transport.request("never", None, Duration::from_secs(5));
        let hang_up = async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(server);
        };
        let (outcome, ()) = tokio::join!(request, hang_up);
        assert!(matches!(outcome, Err(RequestError::Disconnected)));
        assert!(!transport.is_alive());
    }

    #[tokio::test]
    async fn answers_ping_from_provider() {
        let (_transport, server) = pair();
        let (read, mut write) = tokio::io::split(server);
        let mut lines = BufReader::new(read).lines();

        write
            .write_all(b"not json at all\n{\"jsonrpc\":\"2.0\",\"id\":\"p1\",\"method\":\"ping\"}\n")
            .await
            .unwrap();
        let reply: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["id"], "p1");
        assert!(reply["result"].is_object());
    }
}
