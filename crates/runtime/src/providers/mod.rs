//! Model backend adapters.
//!
//! Each adapter translates the conversation and tool catalog into one
//! backend's wire format and back into a [`DecodedReply`].

mod anthropic;
mod cohere;
mod directive;
mod ollama;

pub use anthropic::{AnthropicAuth, AnthropicBackend, AnthropicBackendBuilder};
pub use cohere::{CohereBackend, CohereBackendBuilder};
pub use directive::{DirectiveBackend, DirectiveBackendBuilder};
pub use ollama::{DEFAULT_OLLAMA_PORT, OllamaBackend, OllamaBackendBuilder};

use std::future::Future;
use std::time::Duration;

use mcp::ToolDescriptor;
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;

use crate::conversation::Conversation;
use crate::model::{BackendError, DecodedReply};

/// Default deadline for one backend exchange.
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(120);

/// Deadline for connectivity probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A model backend the orchestration loop can drive.
pub trait BackendAdapter: Send + Sync {
    /// Wire request.
    type Request: Send;
    /// Wire response, before translation.
    type Response: Send;

    /// Short label for logs, e.g. `ollama(qwen3:8b)`.
    fn describe(&self) -> String;

    /// Encode the whole transcript, in order, plus every tool descriptor.
    fn encode_request(&self, conversation: &Conversation, catalog: &[ToolDescriptor]) -> Self::Request;

    fn send(&self, request: Self::Request) -> impl Future<Output = Result<Self::Response, BackendError>> + Send;

    fn decode_response(&self, response: Self::Response) -> Result<DecodedReply, BackendError>;

    /// Check that the backend is reachable and knows the configured model.
    fn probe(&self) -> impl Future<Output = Result<ProbeReport, BackendError>> + Send;
}

/// Result of a connectivity probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    pub endpoint: String,
    pub model: String,
    /// Models the backend listed.
    pub models: Vec<String>,
}

impl ProbeReport {
    /// Whether the configured model is among the listed ones. A bare name
    /// matches its `:latest` tag.
    pub fn model_available(&self) -> bool {
        let latest = format!("{}:latest", self.model);
        self.models.iter().any(|m| *m == self.model || *m == latest)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared HTTP plumbing
// ─────────────────────────────────────────────────────────────────────────────

/// Run one exchange under `limit`.
pub(crate) async fn with_deadline<T>(
    limit: Duration,
    exchange: impl Future<Output = Result<T, BackendError>>,
) -> Result<T, BackendError> {
    tokio::time::timeout(limit, exchange)
        .await
        .map_err(|_| BackendError::Timeout(limit))?
}

/// Send a request and fail on anything but a success status.
pub(crate) async fn execute(request: RequestBuilder, endpoint: &str) -> Result<reqwest::Response, BackendError> {
    let response = request.send().await.map_err(|e| transport_error(e, endpoint))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BackendError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

/// Read a JSON body.
pub(crate) async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, BackendError> {
    let body = response
        .bytes()
        .await
        .map_err(|e| BackendError::Network(e.to_string()))?;
    serde_json::from_slice(&body).map_err(|e| BackendError::InvalidResponse(e.to_string()))
}

/// Fetch a model listing for [`BackendAdapter::probe`].
pub(crate) async fn fetch_models<T: DeserializeOwned>(
    request: RequestBuilder,
    endpoint: &str,
) -> Result<T, BackendError> {
    with_deadline(PROBE_TIMEOUT, async {
        let response = execute(request, endpoint).await?;
        read_json(response).await
    })
    .await
}

pub(crate) fn transport_error(e: reqwest::Error, endpoint: &str) -> BackendError {
    if e.is_connect() {
        BackendError::Unavailable {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        }
    } else {
        BackendError::Network(e.to_string())
    }
}

/// Join a base URL and a path without doubling slashes.
pub(crate) fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
pub(crate) mod stub {
    //! Minimal HTTP/1.1 server for exercising adapters without a network.

    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// How the stub answers.
    #[derive(Clone)]
    pub enum Reply {
        /// Complete response with the given status and body.
        Full { status: u16, body: String },
        /// Body sent as separate writes, each flushed.
        Chunked(Vec<String>),
        /// Accept the connection and never answer.
        Hang,
    }

    impl Reply {
        pub fn json(body: serde_json::Value) -> Self {
            Self::Full {
                status: 200,
                body: body.to_string(),
            }
        }
    }

    /// A bound server and the request bodies it has received.
    pub struct Stub {
        pub addr: SocketAddr,
        requests: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl Stub {
        pub fn base_url(&self) -> String {
            format!("http://{}", self.addr)
        }

        /// `(request line, body)` pairs in arrival order.
        pub fn requests(&self) -> Vec<(String, String)> {
            self.requests.lock().unwrap().clone()
        }
    }

    /// Serve `reply` to every connection.
    pub async fn serve(reply: Reply) -> Stub {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let reply = reply.clone();
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let _ = answer(stream, reply, seen).await;
                });
            }
        });
        Stub { addr, requests }
    }

    /// An address nothing listens on.
    pub async fn closed_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    async fn answer(
        mut stream: TcpStream,
        reply: Reply,
        seen: Arc<Mutex<Vec<(String, String)>>>,
    ) -> std::io::Result<()> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let length = head
            .lines()
            .find_map(|l| {
                let (name, value) = l.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())
                    .flatten()
            })
            .unwrap_or(0);
        while buf.len() < header_end + length {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let body = String::from_utf8_lossy(&buf[header_end..]).to_string();
        let request_line = head.lines().next().unwrap_or_default().to_string();
        seen.lock().unwrap().push((request_line, body));

        match reply {
            Reply::Full { status, body } => {
                let response = format!(
                    "HTTP/1.1 {status} Stub\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(response.as_bytes()).await?;
            }
            Reply::Chunked(parts) => {
                stream
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: application/x-ndjson\r\nconnection: close\r\n\r\n")
                    .await?;
                for part in parts {
                    stream.write_all(part.as_bytes()).await?;
                    stream.flush().await?;
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
            }
            Reply::Hang => {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            }
        }
        stream.shutdown().await
    }
}
