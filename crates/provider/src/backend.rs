//! Upstream chat-completion transport
//!
//! `ChatBackend` is the seam between pool logic and the network: pools hand
//! it a resolved credential target plus the transformed request, and get back
//! a completion or a transport error. The reqwest implementation always sends
//! `stream: false` — stream rendering is synthesized gateway-side.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use common::Secret;
use serde_json::json;
use tracing::{debug, warn};

use crate::types::{
    ChatCompletion, ChatRequest, DEFAULT_FREQUENCY_PENALTY, DEFAULT_MAX_TOKENS,
    DEFAULT_PRESENCE_PENALTY, DEFAULT_TEMPERATURE, DEFAULT_TOP_P,
};
use crate::BackendError;

/// Resolved credential fields needed for one upstream call.
///
/// `url` is the OpenAI-compatible base URL (typically ending in `/v1`);
/// the chat-completions path is appended at call time.
#[derive(Debug, Clone)]
pub struct BackendTarget {
    pub url: String,
    pub secret: Secret<String>,
    pub model: String,
}

/// Opaque remote chat-completion call.
///
/// Dyn-compatible (`Arc<dyn ChatBackend>`): pools are constructed against
/// this trait so tests can substitute a recording backend.
pub trait ChatBackend: Send + Sync {
    fn complete(
        &self,
        target: BackendTarget,
        request: ChatRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ChatCompletion, BackendError>> + Send + '_>>;
}

/// reqwest-based backend with a fixed per-call timeout.
pub struct HttpBackend {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// Join the credential's base URL with the chat-completions path.
    fn endpoint(base: &str) -> String {
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }
}

impl ChatBackend for HttpBackend {
    fn complete(
        &self,
        target: BackendTarget,
        request: ChatRequest,
    ) -> Pin<Box<dyn Future<Output = Result<ChatCompletion, BackendError>> + Send + '_>> {
        Box::pin(async move {
            let endpoint = Self::endpoint(&target.url);
            // The upstream call is always non-streaming; the gateway renders
            // a synthetic stream to the caller when asked to.
            let body = json!({
                "model": target.model,
                "messages": request.messages,
                "temperature": request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
                "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
                "top_p": request.top_p.unwrap_or(DEFAULT_TOP_P),
                "frequency_penalty": request.frequency_penalty.unwrap_or(DEFAULT_FREQUENCY_PENALTY),
                "presence_penalty": request.presence_penalty.unwrap_or(DEFAULT_PRESENCE_PENALTY),
                "stream": false,
            });

            debug!(endpoint = %endpoint, model = %target.model, "calling upstream");

            let response = self
                .client
                .post(&endpoint)
                .bearer_auth(target.secret.expose())
                .timeout(self.timeout)
                .json(&body)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        BackendError::Timeout(self.timeout.as_secs())
                    } else {
                        BackendError::Transport(e.to_string())
                    }
                })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                warn!(status = status.as_u16(), "upstream returned error status");
                return Err(BackendError::Status {
                    status: status.as_u16(),
                    body,
                });
            }

            response
                .json::<ChatCompletion>()
                .await
                .map_err(|e| BackendError::Decode(e.to_string()))
        })
    }
}
