//! SSE parsing for streamed completions.
//!
//! The gateway streams `data: {json}` lines separated by blank lines and
//! terminates with `data: [DONE]`. This adapter turns the raw byte stream
//! into domain `CompletionChunk`s, buffering across network frame
//! boundaries.

use bytes::Bytes;
use futures::{Stream, StreamExt};

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::ports::model_gateway::CompletionChunk;

use super::types::ChatCompletionChunk;

/// Parse one SSE event text into a chunk. Returns `Ok(None)` for the
/// `[DONE]` sentinel and for events without content.
fn parse_event(event_text: &str) -> CoreResult<Option<CompletionChunk>> {
    let mut data_line = None;
    for line in event_text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(':') {
            continue;
        }
        if let Some(value) = trimmed.strip_prefix("data:") {
            data_line = Some(value.trim());
        }
    }

    let Some(data) = data_line else {
        return Ok(None);
    };
    if data == "[DONE]" {
        return Ok(None);
    }

    let parsed: ChatCompletionChunk = serde_json::from_str(data)
        .map_err(|err| CoreError::Internal(format!("unparseable stream chunk: {err}")))?;
    let delta = parsed
        .choices
        .first()
        .and_then(|c| c.delta.content.clone())
        .unwrap_or_default();
    let tokens_used = parsed.usage.map(|u| u.total_tokens);

    if delta.is_empty() && tokens_used.is_none() {
        return Ok(None);
    }
    Ok(Some(CompletionChunk { delta, tokens_used }))
}

/// Turn a raw byte stream into a stream of completion chunks.
pub fn chunk_stream(
    bytes: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
) -> impl Stream<Item = CoreResult<CompletionChunk>> + Send + 'static {
    let buffered = futures::stream::unfold(
        (Box::pin(bytes), String::new(), false),
        |(mut inner, mut buffer, done)| async move {
            if done {
                return None;
            }
            loop {
                // Emit any complete event already buffered.
                if let Some(boundary) = buffer.find("\n\n") {
                    let event_text = buffer[..boundary].to_string();
                    buffer.drain(..boundary + 2);
                    return Some((parse_event(&event_text), (inner, buffer, false)));
                }

                match inner.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                    }
                    Some(Err(err)) => {
                        return Some((
                            Err(CoreError::TransientUpstream {
                                message: format!("stream read failed: {err}"),
                                status: None,
                            }),
                            (inner, buffer, true),
                        ));
                    }
                    None => {
                        // Trailing event without a final blank line.
                        if buffer.trim().is_empty() {
                            return None;
                        }
                        let event_text = std::mem::take(&mut buffer);
                        return Some((parse_event(&event_text), (inner, buffer, true)));
                    }
                }
            }
        },
    );

    // Drop the empty parses (keep errors and real chunks).
    buffered.filter_map(|item| async move {
        match item {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    })
}
