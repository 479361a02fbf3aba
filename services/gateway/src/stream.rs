//! Client-side streaming synthesis.
//!
//! The upstream is always called non-streaming; when a client asked for
//! `stream: true` the finished completion is replayed as an SSE stream of
//! one-character delta chunks, a terminal chunk with `finish_reason`, and
//! the `[DONE]` marker.

use axum::response::sse::{Event, Sse};
use futures::stream::{self, Stream};
use provider::{ChatCompletion, ChatCompletionChunk};
use std::convert::Infallible;

/// Serialize a completion into the SSE `data:` payloads, in emit order.
/// The last element is always the literal `[DONE]` marker.
pub fn chunk_payloads(completion: &ChatCompletion) -> Vec<String> {
    let content = completion.first_content().unwrap_or_default();
    let mut payloads = Vec::with_capacity(content.chars().count() + 2);

    for ch in content.chars() {
        let chunk = ChatCompletionChunk::content(
            &completion.id,
            completion.created,
            &completion.model,
            ch.to_string(),
        );
        payloads.push(serde_json::to_string(&chunk).unwrap_or_default());
    }
    let finish =
        ChatCompletionChunk::finish(&completion.id, completion.created, &completion.model);
    payloads.push(serde_json::to_string(&finish).unwrap_or_default());
    payloads.push("[DONE]".to_owned());
    payloads
}

/// Build the SSE response for a streaming request.
pub fn sse_response(
    completion: &ChatCompletion,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + use<>> {
    let events = chunk_payloads(completion)
        .into_iter()
        .map(|payload| Ok(Event::default().data(payload)));
    Sse::new(stream::iter(events))
}
