//! C5 — Stream Multiplexer.
//!
//! Bridges the lazy sequence of answer chunks from the language-model client
//! to the downstream HTTP response, interleaving rotating "thinking" heartbeat
//! frames whenever the upstream stalls past the configured window. Every
//! stream gets its own rotation cursor and its own pinned upstream — nothing
//! here is shared across concurrent requests.

use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::model::PipelineEvent;

pub const HEARTBEAT_MESSAGES: [&str; 8] = [
    "Analyzing your query deeply",
    "Exploring the knowledge graph",
    "Finding relevant connections",
    "Processing complex relationships",
    "Gathering comprehensive data",
    "Cross-referencing information",
    "Validating query results",
    "Optimizing data retrieval",
];

/// Drive `upstream` to completion, yielding `PipelineEvent::AnswerChunk` for
/// each non-empty token and `PipelineEvent::Heartbeat` whenever the stall
/// window elapses without a chunk. Yields a single `Error` frame and stops on
/// upstream failure or cancellation.
pub fn multiplex(
    mut upstream: BoxStream<'static, Result<String, AppError>>,
    stall_window: Duration,
    cancel: CancellationToken,
) -> BoxStream<'static, PipelineEvent> {
    let state = MultiplexState { cursor: 0, stall_window, cancel, done: false };

    Box::pin(futures::stream::unfold((upstream, state), |(mut upstream, mut state)| async move {
        if state.done {
            return None;
        }

        loop {
            tokio::select! {
                biased;

                _ = state.cancel.cancelled() => {
                    tracing::info!("stream cancelled by client disconnect");
                    state.done = true;
                    return None;
                }

                outcome = tokio::time::timeout(state.stall_window, upstream.next()) => {
                    match outcome {
                        Ok(Some(Ok(chunk))) => {
                            if chunk.is_empty() {
                                continue;
                            }
                            return Some((PipelineEvent::AnswerChunk(chunk), (upstream, state)));
                        }
                        Ok(Some(Err(e))) => {
                            state.done = true;
                            return Some((PipelineEvent::Error(e.to_stream_message()), (upstream, state)));
                        }
                        Ok(None) => {
                            state.done = true;
                            return None;
                        }
                        Err(_elapsed) => {
                            let message = HEARTBEAT_MESSAGES[state.cursor % HEARTBEAT_MESSAGES.len()];
                            state.cursor = state.cursor.wrapping_add(1);
                            return Some((PipelineEvent::Heartbeat(message.to_string()), (upstream, state)));
                        }
                    }
                }
            }
        }
    }))
}

struct MultiplexState {
    cursor: usize,
    stall_window: Duration,
    cancel: CancellationToken,
    done: bool,
}
