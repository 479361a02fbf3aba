//! OpenAI-style chat completion wire model
//!
//! Request fields the gateway does not recognize are ignored on
//! deserialization so that stock OpenAI clients work unmodified. Generation
//! parameters are optional on the wire; the defaults below are applied at
//! backend-call time so that pool-level overrides (tiered pool temperature)
//! can distinguish "caller set it" from "caller left it out".

use serde::{Deserialize, Serialize};

/// Default generation parameters applied when the caller omits them.
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 2000;
pub const DEFAULT_TOP_P: f64 = 1.0;
pub const DEFAULT_FREQUENCY_PENALTY: f64 = 0.2;
pub const DEFAULT_PRESENCE_PENALTY: f64 = 0.0;

/// One chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Inbound chat-completion request body.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChatRequest {
    /// Requested virtual model (handler name). Absence or an unknown name
    /// routes to the default handler — not an error.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub frequency_penalty: Option<f64>,
    #[serde(default)]
    pub presence_penalty: Option<f64>,
}

/// Token accounting reported by the upstream (or zeroed for synthetic
/// completions).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// One completion choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: ChatMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// A full (non-streaming) chat completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Usage,
}

impl ChatCompletion {
    /// Synthesize a completion from plain text, tagged with a fresh id.
    ///
    /// Used by canned responders and tests; usage is zeroed since no tokens
    /// were consumed anywhere.
    pub fn from_text(model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().as_simple()),
            object: "chat.completion".into(),
            created: now_unix(),
            model: model.into(),
            choices: vec![Choice {
                index: 0,
                message: ChatMessage::new("assistant", content),
                finish_reason: Some("stop".into()),
            }],
            usage: Usage::default(),
        }
    }

    /// Content of the first choice, if any.
    pub fn first_content(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

/// Incremental delta inside a streaming chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// One choice of a streaming chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChatDelta,
    pub finish_reason: Option<String>,
}

/// Streaming chat completion chunk (SSE `data:` payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

impl ChatCompletionChunk {
    /// A content-bearing delta chunk.
    pub fn content(id: &str, created: i64, model: &str, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object: "chat.completion.chunk".into(),
            created,
            model: model.into(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChatDelta {
                    role: None,
                    content: Some(text.into()),
                },
                finish_reason: None,
            }],
        }
    }

    /// The terminal chunk carrying `finish_reason` and an empty delta.
    pub fn finish(id: &str, created: i64, model: &str) -> Self {
        Self {
            id: id.into(),
            object: "chat.completion.chunk".into(),
            created,
            model: model.into(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChatDelta::default(),
                finish_reason: Some("stop".into()),
            }],
        }
    }
}

/// Current unix time in seconds.
pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_tolerate_minimal_body() {
        let req: ChatRequest =
            serde_json::from_str(r#"{"messages":[{"role":"user","content":"hi"}]}"#).unwrap();
        assert!(req.model.is_none());
        assert!(!req.stream);
        assert!(req.temperature.is_none());
        assert_eq!(req.messages.len(), 1);
    }

    #[test]
    fn request_ignores_unknown_fields() {
        let req: ChatRequest = serde_json::from_str(
            r#"{"messages":[],"model":"chat","logit_bias":{},"user":"abc"}"#,
        )
        .unwrap();
        assert_eq!(req.model.as_deref(), Some("chat"));
    }

    #[test]
    fn from_text_builds_single_stop_choice() {
        let completion = ChatCompletion::from_text("intent", "NOT_TIME_RELATED");
        assert!(completion.id.starts_with("chatcmpl-"));
        assert_eq!(completion.object, "chat.completion");
        assert_eq!(completion.model, "intent");
        assert_eq!(completion.first_content(), Some("NOT_TIME_RELATED"));
        assert_eq!(completion.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(completion.usage.total_tokens, 0);
    }

    #[test]
    fn from_text_ids_are_unique() {
        let a = ChatCompletion::from_text("m", "x");
        let b = ChatCompletion::from_text("m", "x");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn delta_serialization_omits_absent_fields() {
        let chunk = ChatCompletionChunk::content("chatcmpl-1", 0, "chat", "h");
        let json = serde_json::to_string(&chunk).unwrap();
        assert!(json.contains(r#""content":"h""#));
        assert!(!json.contains("role"));
    }
}
