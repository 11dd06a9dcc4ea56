//! Backend chat client: opens a chat-completions stream against an
//! OpenAI-compatible endpoint and yields parsed chunks.
//!
//! The [`ChatBackend`] trait is the seam between the request handler and the
//! network; [`HttpChatBackend`] is the real implementation (reqwest +
//! SSE parsing), tests substitute scripted backends.

use crate::error::ProxyError;
use crate::openai::{ChatCompletionChunk, ChatCompletionRequest};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// A stream of parsed chunks, or the error that ended it.
pub type ChunkStream = BoxStream<'static, Result<ChatCompletionChunk, ProxyError>>;

/// The backend seam: one method, one stream.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Opens the stream. Errors returned here are pre-stream (no bytes were
    /// sent to the client yet); errors inside the stream are mid-stream.
    async fn open_stream(&self, request: &ChatCompletionRequest) -> Result<ChunkStream, ProxyError>;
}

/// Real HTTP backend.
pub struct HttpChatBackend {
    http: reqwest::Client,
    /// Base URL including `/v1` (e.g. `http://127.0.0.1:8080/v1`).
    base_url: String,
    api_key: Option<String>,
    request_timeout: Duration,
}

impl HttpChatBackend {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key,
            request_timeout,
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn open_stream(&self, request: &ChatCompletionRequest) -> Result<ChunkStream, ProxyError> {
        let url = self.chat_url();
        debug!(url = %url, model = %request.model, "opening backend chat stream");

        let mut builder = self
            .http
            .post(&url)
            .json(request)
            .timeout(self.request_timeout);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| ProxyError::from_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.is_client_error() && status.as_u16() != 429 {
                dump_client_error(&url, status.as_u16(), request, &body);
            }
            return Err(match status.as_u16() {
                429 | 503 => ProxyError::UpstreamUnavailable(format!("status {status}: {body}")),
                _ => ProxyError::UpstreamProtocol(format!("status {status}: {body}")),
            });
        }

        let events = response.bytes_stream().eventsource();
        let chunks = async_stream::stream! {
            futures::pin_mut!(events);
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        if event.data == "[DONE]" {
                            break;
                        }
                        match serde_json::from_str::<ChatCompletionChunk>(&event.data) {
                            Ok(chunk) => yield Ok(chunk),
                            Err(e) => {
                                yield Err(ProxyError::UpstreamProtocol(format!(
                                    "bad chunk: {e}"
                                )));
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        yield Err(ProxyError::StreamInterrupted(e.to_string()));
                        break;
                    }
                }
            }
        };
        Ok(chunks.boxed())
    }
}

/// Dumps a non-429 4xx exchange for postmortem, off the request path.
/// Dump failures are logged and swallowed.
fn dump_client_error(url: &str, status: u16, request: &ChatCompletionRequest, body: &str) {
    let Some(dir) = dirs::home_dir().map(|h| h.join(".anyclaude").join("debug")) else {
        return;
    };
    let record = serde_json::json!({
        "at": chrono::Utc::now().to_rfc3339(),
        "url": url,
        "status": status,
        "request": serde_json::to_value(request).unwrap_or_default(),
        "response": body,
    });
    let path: PathBuf = dir.join(format!(
        "backend-{}-{}.json",
        status,
        chrono::Utc::now().timestamp_millis()
    ));
    let write = move || {
        if let Err(e) = std::fs::create_dir_all(&dir)
            .and_then(|_| std::fs::write(&path, record.to_string()))
        {
            warn!(error = %e, "failed to dump backend 4xx exchange");
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(write);
        }
        Err(_) => write(),
    }
}

/// Fresh Anthropic-style message id for a synthesized response.
pub fn new_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}
