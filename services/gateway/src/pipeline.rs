//! Request pipeline: transforms applied to a chat request before it is
//! dispatched to a handler.
//!
//! Stages run in a fixed order: timestamp injection, web page
//! summarization, keyword hooks, query APIs, dispatch. Each stage edits
//! the message list in place; connector failures are rendered inline into
//! the affected message instead of failing the request.

use crate::config::HookRuleConfig;
use crate::connectors::{QueryApi, WebFetcher};
use chrono::{DateTime, Local};
use provider::{ChatCompletion, ChatMessage, ChatRequest, Handler, HandlerError};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// System prompt used when condensing fetched pages through a handler.
const SUMMARY_PROMPT: &str = "You are a web content summarizer. The user message is a \
JSON object describing a fetched web page. Summarize its key information in one \
concise paragraph. Reply with the summary only.";

const SUMMARY_TEMPERATURE: f64 = 0.2;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// Web summarization stage settings, resolved from config at startup.
pub struct WebSummary {
    pub fetcher: Arc<dyn WebFetcher>,
    /// When absent, raw page JSON is injected instead of a summary.
    pub summary_handler: Option<Arc<dyn Handler>>,
    pub inter_request_delay: Duration,
}

pub struct Pipeline {
    handlers: HashMap<String, Arc<dyn Handler>>,
    default_handler: String,
    add_timestamp: bool,
    web_summary: Option<WebSummary>,
    hook_rules: Vec<HookRuleConfig>,
    query_apis: Vec<Arc<dyn QueryApi>>,
    url_re: Regex,
    token_re: Regex,
}

impl Pipeline {
    /// `default_handler` must be a key of `handlers`; config validation
    /// guarantees this before the pipeline is built.
    pub fn new(handlers: HashMap<String, Arc<dyn Handler>>, default_handler: String) -> Self {
        Self {
            handlers,
            default_handler,
            add_timestamp: false,
            web_summary: None,
            hook_rules: Vec::new(),
            query_apis: Vec::new(),
            url_re: Regex::new(r#"https?://[^\s"'<>\)\]]+"#).expect("url regex"),
            token_re: Regex::new(r"--([A-Za-z0-9_]+)").expect("token regex"),
        }
    }

    pub fn with_timestamp(mut self, enable: bool) -> Self {
        self.add_timestamp = enable;
        self
    }

    pub fn with_web_summary(mut self, web_summary: WebSummary) -> Self {
        self.web_summary = Some(web_summary);
        self
    }

    pub fn with_hook_rules(mut self, rules: Vec<HookRuleConfig>) -> Self {
        self.hook_rules = rules;
        self
    }

    pub fn with_query_apis(mut self, apis: Vec<Arc<dyn QueryApi>>) -> Self {
        self.query_apis = apis;
        self
    }

    /// Handler names, sorted, for the model listing endpoint.
    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run every enabled transform, then dispatch to the selected handler.
    pub async fn process(&self, mut request: ChatRequest) -> Result<ChatCompletion, PipelineError> {
        if request.messages.is_empty() {
            return Err(PipelineError::InvalidRequest(
                "messages must not be empty".into(),
            ));
        }

        let mut handler = self.resolve_handler(request.model.as_deref());

        if self.add_timestamp {
            apply_timestamp(&mut request.messages, Local::now());
        }
        if let Some(ref ws) = self.web_summary {
            self.apply_web_summary(ws, &mut request.messages).await;
        }
        if let Some(rule) = self.match_hook(&request.messages) {
            debug!(target = %rule.target, "keyword hook matched");
            if let Some(target) = self.handlers.get(&rule.target) {
                handler = Arc::clone(target);
            }
            request.temperature = Some(rule.temperature);
        }
        if !self.query_apis.is_empty() {
            self.apply_query_apis(&mut request.messages).await;
        }

        // Upstream calls are always non-streaming; streaming toward the
        // client is synthesized from the finished completion.
        request.stream = false;
        Ok(handler.call(request).await?)
    }

    fn resolve_handler(&self, model: Option<&str>) -> Arc<dyn Handler> {
        if let Some(name) = model {
            if let Some(handler) = self.handlers.get(name) {
                return Arc::clone(handler);
            }
            debug!(model = name, "unknown model, using default handler");
        }
        Arc::clone(
            self.handlers
                .get(&self.default_handler)
                .expect("default handler exists"),
        )
    }

    /// First rule with a keyword contained in the last message, when that
    /// message is from the user. A trailing assistant turn is never rerouted.
    fn match_hook(&self, messages: &[ChatMessage]) -> Option<&HookRuleConfig> {
        let last = messages.last().filter(|m| m.role == "user")?;
        self.hook_rules
            .iter()
            .find(|rule| rule.keywords.iter().any(|k| last.content.contains(k.as_str())))
    }

    async fn apply_web_summary(&self, ws: &WebSummary, messages: &mut [ChatMessage]) {
        let Some(last) = messages.last_mut() else {
            return;
        };
        if last.role != "user" {
            return;
        }
        let urls: Vec<String> = self
            .url_re
            .find_iter(&last.content)
            .map(|m| m.as_str().to_owned())
            .collect();
        if urls.is_empty() {
            return;
        }

        let mut block = String::from("\n\nInformation from web pages:\n");
        for (i, url) in urls.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(ws.inter_request_delay).await;
            }
            match self.summarize_url(ws, url).await {
                Ok(entry) => block.push_str(&entry),
                Err(msg) => {
                    warn!(url = %url, error = %msg, "web page lookup failed");
                    block.push_str(&format!("url: {url}\nerror: {msg}\n"));
                }
            }
        }
        last.content.push_str(&block);
    }

    /// Fetch one page and render its block entry. A String error here is a
    /// human-readable note, already safe to inline into the message.
    async fn summarize_url(&self, ws: &WebSummary, url: &str) -> Result<String, String> {
        let page = ws.fetcher.fetch(url).await.map_err(|e| e.to_string())?;

        let context = match ws.summary_handler {
            Some(ref handler) => {
                let page_json = serde_json::to_string(&page).map_err(|e| e.to_string())?;
                let request = ChatRequest {
                    messages: vec![
                        ChatMessage::new("system", SUMMARY_PROMPT),
                        ChatMessage::new("user", page_json),
                    ],
                    temperature: Some(SUMMARY_TEMPERATURE),
                    ..ChatRequest::default()
                };
                let completion = handler.call(request).await.map_err(|e| e.to_string())?;
                completion.first_content().unwrap_or_default().to_owned()
            }
            None => serde_json::to_string(&page).map_err(|e| e.to_string())?,
        };

        Ok(format!(
            "url: {}\ntitle: {}\ncontext: {}\n",
            page.url, page.title, context
        ))
    }

    async fn apply_query_apis(&self, messages: &mut [ChatMessage]) {
        let Some(last) = messages.last_mut() else {
            return;
        };
        if last.role != "user" {
            return;
        }

        // Each named API runs at most once per request even if its token
        // repeats. Tokens naming no configured API are left alone.
        let content = last.content.clone();
        let mut invoked: Vec<&str> = Vec::new();
        let mut block = String::new();
        for cap in self.token_re.captures_iter(&content) {
            let name = cap.get(1).map(|m| m.as_str()).unwrap_or_default();
            if invoked.contains(&name) {
                continue;
            }
            let Some(api) = self.query_apis.iter().find(|a| a.name() == name) else {
                continue;
            };
            invoked.push(api.name());
            match api.invoke().await {
                Ok(body) => block.push_str(&format!("{name}: {body}\n")),
                Err(e) => {
                    warn!(api = name, error = %e, "query api failed");
                    block.push_str(&format!("{name}: error: {e}\n"));
                }
            }
        }
        if !block.is_empty() {
            last.content.push_str("\n\nAPI call results:\n");
            last.content.push_str(&block);
        }
    }
}

/// Prefix the leading system message with the current local time so the
/// upstream model can answer "what time is it" style questions. Inserts a
/// system message when the conversation starts without one.
fn apply_timestamp(messages: &mut Vec<ChatMessage>, now: DateTime<Local>) {
    let line = format!("system timestamp: {}", now.format("%A, %Y/%m/%d, %H:%M"));
    match messages.first_mut() {
        Some(first) if first.role == "system" => {
            let rest = std::mem::take(&mut first.content);
            first.content = if rest.is_empty() {
                line
            } else {
                format!("{line}\n{rest}")
            };
        }
        _ => messages.insert(0, ChatMessage::new("system", line)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{ConnectorError, WebPage};
    use chrono::TimeZone;
    use provider::{BackendError, Result as HandlerResult};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    /// Records every request it receives and answers with a fixed reply.
    struct RecordingHandler {
        name: String,
        reply: String,
        seen: Mutex<Vec<ChatRequest>>,
    }

    impl RecordingHandler {
        fn new(name: &str, reply: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_owned(),
                reply: reply.to_owned(),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn last_request(&self) -> ChatRequest {
            self.seen.lock().unwrap().last().unwrap().clone()
        }

        fn call_count(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    impl Handler for RecordingHandler {
        fn name(&self) -> &str {
            &self.name
        }

        fn call(
            &self,
            request: ChatRequest,
        ) -> Pin<Box<dyn Future<Output = HandlerResult<ChatCompletion>> + Send + '_>> {
            Box::pin(async move {
                self.seen.lock().unwrap().push(request);
                Ok(ChatCompletion::from_text(self.name.clone(), &self.reply))
            })
        }
    }

    struct StubFetcher {
        fail_on: Option<String>,
    }

    impl WebFetcher for StubFetcher {
        fn fetch(
            &self,
            url: &str,
        ) -> Pin<Box<dyn Future<Output = Result<WebPage, ConnectorError>> + Send + '_>> {
            let url = url.to_owned();
            Box::pin(async move {
                if self.fail_on.as_deref() == Some(url.as_str()) {
                    return Err(ConnectorError::Status { status: 502 });
                }
                Ok(WebPage {
                    url: url.clone(),
                    title: format!("title of {url}"),
                    description: String::new(),
                    content: "page body".into(),
                })
            })
        }
    }

    struct StubApi {
        name: String,
        result: Result<String, u16>,
        calls: Mutex<usize>,
    }

    impl StubApi {
        fn ok(name: &str, body: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_owned(),
                result: Ok(body.to_owned()),
                calls: Mutex::new(0),
            })
        }

        fn failing(name: &str, status: u16) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_owned(),
                result: Err(status),
                calls: Mutex::new(0),
            })
        }
    }

    impl QueryApi for StubApi {
        fn name(&self) -> &str {
            &self.name
        }

        fn invoke(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<String, ConnectorError>> + Send + '_>> {
            Box::pin(async move {
                *self.calls.lock().unwrap() += 1;
                match &self.result {
                    Ok(body) => Ok(body.clone()),
                    Err(status) => Err(ConnectorError::Status { status: *status }),
                }
            })
        }
    }

    fn pipeline_with(handlers: Vec<Arc<RecordingHandler>>, default: &str) -> Pipeline {
        let map: HashMap<String, Arc<dyn Handler>> = handlers
            .into_iter()
            .map(|h| (h.name.clone(), h as Arc<dyn Handler>))
            .collect();
        Pipeline::new(map, default.to_owned())
    }

    fn user_request(content: &str) -> ChatRequest {
        ChatRequest {
            messages: vec![ChatMessage::new("user", content)],
            ..ChatRequest::default()
        }
    }

    #[tokio::test]
    async fn empty_messages_rejected_before_dispatch() {
        let chat = RecordingHandler::new("chat", "ok");
        let pipeline = pipeline_with(vec![chat.clone()], "chat");

        let err = pipeline.process(ChatRequest::default()).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRequest(_)));
        assert_eq!(chat.call_count(), 0);
    }

    #[tokio::test]
    async fn unknown_model_falls_back_to_default_handler() {
        let chat = RecordingHandler::new("chat", "ok");
        let other = RecordingHandler::new("other", "no");
        let pipeline = pipeline_with(vec![chat.clone(), other.clone()], "chat");

        let mut request = user_request("hi");
        request.model = Some("does-not-exist".into());
        let completion = pipeline.process(request).await.unwrap();

        assert_eq!(completion.model, "chat");
        assert_eq!(chat.call_count(), 1);
        assert_eq!(other.call_count(), 0);
    }

    #[tokio::test]
    async fn known_model_routes_to_named_handler() {
        let chat = RecordingHandler::new("chat", "ok");
        let other = RecordingHandler::new("other", "routed");
        let pipeline = pipeline_with(vec![chat.clone(), other.clone()], "chat");

        let mut request = user_request("hi");
        request.model = Some("other".into());
        let completion = pipeline.process(request).await.unwrap();
        assert_eq!(completion.first_content(), Some("routed"));
    }

    #[tokio::test]
    async fn dispatch_forces_non_streaming_upstream() {
        let chat = RecordingHandler::new("chat", "ok");
        let pipeline = pipeline_with(vec![chat.clone()], "chat");

        let mut request = user_request("hi");
        request.stream = true;
        pipeline.process(request).await.unwrap();
        assert!(!chat.last_request().stream);
    }

    #[test]
    fn timestamp_prefixes_leading_system_message() {
        let now = Local.with_ymd_and_hms(2025, 3, 10, 9, 5, 0).unwrap();
        let mut messages = vec![
            ChatMessage::new("system", "You are helpful."),
            ChatMessage::new("user", "what time is it"),
        ];
        apply_timestamp(&mut messages, now);

        assert_eq!(
            messages[0].content,
            "system timestamp: Monday, 2025/03/10, 09:05\nYou are helpful."
        );
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn timestamp_inserts_system_message_when_absent() {
        let now = Local.with_ymd_and_hms(2025, 3, 10, 9, 5, 0).unwrap();
        let mut messages = vec![ChatMessage::new("user", "hi")];
        apply_timestamp(&mut messages, now);

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(
            messages[0].content,
            "system timestamp: Monday, 2025/03/10, 09:05"
        );
    }

    #[tokio::test]
    async fn web_summary_appends_summarized_block() {
        let chat = RecordingHandler::new("chat", "ok");
        let summary = RecordingHandler::new("summary", "condensed page");
        let pipeline = pipeline_with(vec![chat.clone(), summary.clone()], "chat")
            .with_web_summary(WebSummary {
                fetcher: Arc::new(StubFetcher { fail_on: None }),
                summary_handler: Some(summary.clone() as Arc<dyn Handler>),
                inter_request_delay: Duration::ZERO,
            });

        pipeline
            .process(user_request("look at https://example.com/a please"))
            .await
            .unwrap();

        let sent = chat.last_request();
        let content = &sent.messages[0].content;
        assert!(content.contains("Information from web pages:"));
        assert!(content.contains("url: https://example.com/a"));
        assert!(content.contains("title: title of https://example.com/a"));
        assert!(content.contains("context: condensed page"));

        // The summarizer ran once, at its own temperature.
        assert_eq!(summary.call_count(), 1);
        assert_eq!(summary.last_request().temperature, Some(0.2));
        assert_eq!(summary.last_request().messages[0].role, "system");
    }

    #[tokio::test]
    async fn web_summary_fetch_failure_is_contained_per_url() {
        let chat = RecordingHandler::new("chat", "ok");
        let pipeline = pipeline_with(vec![chat.clone()], "chat").with_web_summary(WebSummary {
            fetcher: Arc::new(StubFetcher {
                fail_on: Some("https://bad.example.com/x".into()),
            }),
            summary_handler: None,
            inter_request_delay: Duration::ZERO,
        });

        pipeline
            .process(user_request(
                "see https://bad.example.com/x and https://good.example.com/y",
            ))
            .await
            .unwrap();

        let content = chat.last_request().messages[0].content.clone();
        assert!(content.contains("url: https://bad.example.com/x\nerror:"));
        assert!(content.contains("url: https://good.example.com/y"));
        assert!(content.contains("page body"), "raw page JSON without a summarizer");
    }

    #[tokio::test]
    async fn web_summary_skips_non_user_tail() {
        let chat = RecordingHandler::new("chat", "ok");
        let pipeline = pipeline_with(vec![chat.clone()], "chat").with_web_summary(WebSummary {
            fetcher: Arc::new(StubFetcher { fail_on: None }),
            summary_handler: None,
            inter_request_delay: Duration::ZERO,
        });

        let request = ChatRequest {
            messages: vec![
                ChatMessage::new("user", "see https://example.com"),
                ChatMessage::new("assistant", "noted"),
            ],
            ..ChatRequest::default()
        };
        pipeline.process(request).await.unwrap();

        let sent = chat.last_request();
        assert!(!sent.messages[0].content.contains("Information from web pages"));
        assert!(!sent.messages[1].content.contains("Information from web pages"));
    }

    #[tokio::test]
    async fn hook_first_matching_rule_overrides_handler_and_temperature() {
        let chat = RecordingHandler::new("chat", "ok");
        let intent = RecordingHandler::new("intent", "NOT_TIME_RELATED");
        let other = RecordingHandler::new("other", "no");
        let rules = vec![
            HookRuleConfig {
                keywords: vec!["__core_memory__".into()],
                target: "intent".into(),
                temperature: 0.2,
            },
            HookRuleConfig {
                keywords: vec!["__core".into()],
                target: "other".into(),
                temperature: 0.9,
            },
        ];
        let pipeline =
            pipeline_with(vec![chat.clone(), intent.clone(), other.clone()], "chat")
                .with_hook_rules(rules);

        let completion = pipeline
            .process(user_request("please run __core_memory__ now"))
            .await
            .unwrap();

        assert_eq!(completion.first_content(), Some("NOT_TIME_RELATED"));
        assert_eq!(intent.call_count(), 1);
        assert_eq!(other.call_count(), 0, "later rules must not fire");
        assert_eq!(intent.last_request().temperature, Some(0.2));
    }

    #[tokio::test]
    async fn hook_without_match_leaves_routing_alone() {
        let chat = RecordingHandler::new("chat", "ok");
        let intent = RecordingHandler::new("intent", "x");
        let pipeline = pipeline_with(vec![chat.clone(), intent.clone()], "chat")
            .with_hook_rules(vec![HookRuleConfig {
                keywords: vec!["__never__".into()],
                target: "intent".into(),
                temperature: 0.2,
            }]);

        pipeline.process(user_request("plain question")).await.unwrap();
        assert_eq!(chat.call_count(), 1);
        assert_eq!(intent.call_count(), 0);
        assert_eq!(chat.last_request().temperature, None);
    }

    #[tokio::test]
    async fn hook_ignores_keywords_when_last_message_is_not_user() {
        let chat = RecordingHandler::new("chat", "ok");
        let intent = RecordingHandler::new("intent", "x");
        let pipeline = pipeline_with(vec![chat.clone(), intent.clone()], "chat")
            .with_hook_rules(vec![HookRuleConfig {
                keywords: vec!["__core_memory__".into()],
                target: "intent".into(),
                temperature: 0.2,
            }]);

        let request = ChatRequest {
            messages: vec![
                ChatMessage::new("user", "please run __core_memory__ now"),
                ChatMessage::new("assistant", "done"),
            ],
            ..ChatRequest::default()
        };
        pipeline.process(request).await.unwrap();

        assert_eq!(chat.call_count(), 1);
        assert_eq!(intent.call_count(), 0);
    }

    #[tokio::test]
    async fn query_api_token_appends_raw_result() {
        let chat = RecordingHandler::new("chat", "ok");
        let weather = StubApi::ok("weather", r#"{"weather":"clear"}"#);
        let pipeline = pipeline_with(vec![chat.clone()], "chat")
            .with_query_apis(vec![weather.clone() as Arc<dyn QueryApi>]);

        pipeline
            .process(user_request("how is it outside --weather --foo"))
            .await
            .unwrap();

        let content = chat.last_request().messages[0].content.clone();
        assert!(content.contains("API call results:"));
        assert!(content.contains(r#"weather: {"weather":"clear"}"#));
        assert!(!content.contains("foo:"), "unknown tokens are ignored");
    }

    #[tokio::test]
    async fn query_api_repeated_token_invokes_once() {
        let chat = RecordingHandler::new("chat", "ok");
        let weather = StubApi::ok("weather", "sunny");
        let pipeline = pipeline_with(vec![chat.clone()], "chat")
            .with_query_apis(vec![weather.clone() as Arc<dyn QueryApi>]);

        pipeline
            .process(user_request("--weather and again --weather"))
            .await
            .unwrap();
        assert_eq!(*weather.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn query_api_failure_is_rendered_inline() {
        let chat = RecordingHandler::new("chat", "ok");
        let broken = StubApi::failing("stock", 500);
        let pipeline = pipeline_with(vec![chat.clone()], "chat")
            .with_query_apis(vec![broken as Arc<dyn QueryApi>]);

        pipeline.process(user_request("check --stock")).await.unwrap();
        let content = chat.last_request().messages[0].content.clone();
        assert!(content.contains("stock: error:"));
    }

    #[tokio::test]
    async fn message_without_tokens_is_untouched() {
        let chat = RecordingHandler::new("chat", "ok");
        let weather = StubApi::ok("weather", "sunny");
        let pipeline = pipeline_with(vec![chat.clone()], "chat")
            .with_query_apis(vec![weather as Arc<dyn QueryApi>]);

        pipeline.process(user_request("no tokens here")).await.unwrap();
        assert_eq!(chat.last_request().messages[0].content, "no tokens here");
    }

    #[tokio::test]
    async fn handler_errors_pass_through() {
        struct FailingHandler;
        impl Handler for FailingHandler {
            fn name(&self) -> &str {
                "chat"
            }
            fn call(
                &self,
                _request: ChatRequest,
            ) -> Pin<Box<dyn Future<Output = HandlerResult<ChatCompletion>> + Send + '_>>
            {
                Box::pin(async {
                    Err(HandlerError::Backend(BackendError::Status {
                        status: 429,
                        body: "rate limited".into(),
                    }))
                })
            }
        }

        let mut map: HashMap<String, Arc<dyn Handler>> = HashMap::new();
        map.insert("chat".into(), Arc::new(FailingHandler));
        let pipeline = Pipeline::new(map, "chat".into());

        let err = pipeline.process(user_request("hi")).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Handler(HandlerError::Backend(BackendError::Status {
                status: 429,
                ..
            }))
        ));
    }

    #[test]
    fn handler_names_are_sorted() {
        let a = RecordingHandler::new("zeta", "x");
        let b = RecordingHandler::new("alpha", "x");
        let pipeline = pipeline_with(vec![a, b], "alpha");
        assert_eq!(pipeline.handler_names(), vec!["alpha", "zeta"]);
    }
}
