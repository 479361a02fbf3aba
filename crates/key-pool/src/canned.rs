//! Fixed-string responder

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use provider::{ChatCompletion, ChatRequest, Handler};
use tracing::debug;

/// A stand-in handler that answers every call with the next string from a
/// fixed list, never touching the registry or the network.
///
/// Used to soft-disable a feature: point its pool name at a responder and
/// every request gets a synthesized completion tagged with a fresh id and
/// the responder's name as model.
pub struct CannedResponder {
    name: String,
    replies: Vec<String>,
    next: AtomicUsize,
}

impl CannedResponder {
    pub fn new(name: impl Into<String>, replies: Vec<String>) -> Self {
        Self {
            name: name.into(),
            replies,
            next: AtomicUsize::new(0),
        }
    }
}

impl Handler for CannedResponder {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(
        &self,
        _request: ChatRequest,
    ) -> Pin<Box<dyn Future<Output = provider::Result<ChatCompletion>> + Send + '_>> {
        Box::pin(async move {
            let reply = if self.replies.is_empty() {
                ""
            } else {
                let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.replies.len();
                self.replies[idx].as_str()
            };
            debug!(responder = %self.name, "serving canned reply");
            Ok(ChatCompletion::from_text(self.name.clone(), reply))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cycles_replies_in_order() {
        let responder = CannedResponder::new("intent", vec!["one".into(), "two".into()]);

        let r1 = responder.call(ChatRequest::default()).await.unwrap();
        let r2 = responder.call(ChatRequest::default()).await.unwrap();
        let r3 = responder.call(ChatRequest::default()).await.unwrap();

        assert_eq!(r1.first_content(), Some("one"));
        assert_eq!(r2.first_content(), Some("two"));
        assert_eq!(r3.first_content(), Some("one"));
    }

    #[tokio::test]
    async fn ignores_request_content() {
        let responder = CannedResponder::new("intent", vec!["NOT_TIME_RELATED".into()]);
        let request = ChatRequest {
            model: Some("intent".into()),
            messages: vec![provider::ChatMessage::new("user", "what time is it?")],
            temperature: Some(0.0),
            ..Default::default()
        };
        let completion = responder.call(request).await.unwrap();
        assert_eq!(completion.first_content(), Some("NOT_TIME_RELATED"));
        assert_eq!(completion.model, "intent");
    }

    #[tokio::test]
    async fn each_reply_carries_a_fresh_id() {
        let responder = CannedResponder::new("intent", vec!["x".into()]);
        let a = responder.call(ChatRequest::default()).await.unwrap();
        let b = responder.call(ChatRequest::default()).await.unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn empty_reply_list_yields_empty_content() {
        let responder = CannedResponder::new("void", vec![]);
        let completion = responder.call(ChatRequest::default()).await.unwrap();
        assert_eq!(completion.first_content(), Some(""));
    }
}
