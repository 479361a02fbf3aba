//! Dispatch contract and backend transport for the keypool gateway
//!
//! Defines the `Handler` trait that makes rotation pools, tiered pools, and
//! canned responders interchangeable from the pipeline's point of view: the
//! pipeline holds a name→handler map and never inspects which variant it
//! dispatches to. Also owns the OpenAI chat-completion wire model and the
//! `ChatBackend` transport seam with its reqwest implementation.

pub mod backend;
pub mod types;

pub use backend::{BackendTarget, ChatBackend, HttpBackend};
pub use types::{
    ChatCompletion, ChatCompletionChunk, ChatDelta, ChatMessage, ChatRequest, Choice, ChunkChoice,
    Usage,
};

use std::future::Future;
use std::pin::Pin;

/// Errors from the upstream chat-completion transport.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("upstream timeout after {0}s")]
    Timeout(u64),

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid completion payload: {0}")]
    Decode(String),
}

/// Errors a handler can surface to the dispatch pipeline.
///
/// `NoAvailableCredential` is terminal for the current request — the pipeline
/// never retries it. Backend errors propagate unchanged after the credential
/// lease has been released.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("no available credential: {0}")]
    NoAvailableCredential(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Result alias for handler calls.
pub type Result<T> = std::result::Result<T, HandlerError>;

/// Anything the pipeline can dispatch a chat request to.
///
/// Implemented by rotation pools, tiered pools, and canned responders. The
/// handler receives the (possibly transformed) request and returns a single
/// non-streaming completion; stream rendering happens in the pipeline's host.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn Handler>` in the pipeline's handler map).
pub trait Handler: Send + Sync {
    /// Name the pipeline routes on (the gateway's virtual model id).
    fn name(&self) -> &str;

    /// Dispatch one chat request and produce a completion.
    fn call(&self, request: ChatRequest)
    -> Pin<Box<dyn Future<Output = Result<ChatCompletion>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_error_display_is_stable() {
        let err = HandlerError::NoAvailableCredential("pool chat exhausted".into());
        assert_eq!(
            err.to_string(),
            "no available credential: pool chat exhausted"
        );
    }

    #[test]
    fn backend_error_passes_through_transparently() {
        let err: HandlerError = BackendError::Status {
            status: 429,
            body: "rate limited".into(),
        }
        .into();
        assert_eq!(err.to_string(), "upstream returned 429: rate limited");
    }

    #[test]
    fn timeout_display_includes_seconds() {
        let err = BackendError::Timeout(30);
        assert_eq!(err.to_string(), "upstream timeout after 30s");
    }
}
