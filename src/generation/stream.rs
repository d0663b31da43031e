//! Token stream driver shared by chat and voice generation

use super::throttle::UpdateThrottle;
use crate::backend::{BackendError, GenerationRequest, InferenceBackend};
use futures::StreamExt;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Timing and throughput of one generation
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct GenerationStats {
    pub tokens_used: usize,
    /// Wall-clock time from request to stream completion
    pub latency: Duration,
    pub time_to_first_token: Option<Duration>,
    pub tokens_per_second: f32,
}

impl GenerationStats {
    fn new(tokens_used: usize, latency: Duration, time_to_first_token: Option<Duration>) -> Self {
        let secs = latency.as_secs_f32();
        let tokens_per_second = if secs > 0.0 {
            tokens_used as f32 / secs
        } else {
            0.0
        };
        Self {
            tokens_used,
            latency,
            time_to_first_token,
            tokens_per_second,
        }
    }

    pub fn latency_ms(&self) -> u64 {
        self.latency.as_millis() as u64
    }
}

/// How a driven stream ended
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEnd {
    Completed,
    Cancelled,
    Failed(BackendError),
}

/// Result of [`drive_stream`]
#[derive(Clone, Debug)]
pub struct StreamReport {
    /// Final text on completion, otherwise whatever had accumulated
    pub text: String,
    pub end: StreamEnd,
    pub stats: GenerationStats,
}

/// Consume a backend token stream until it completes, fails or is cancelled
///
/// `on_update` receives accumulated-text snapshots, at most one per
/// `update_interval`; the final snapshot is always delivered on completion.
/// Cancelling `cancel` drops the backend stream at the next suspension point.
pub async fn drive_stream<F>(
    backend: &dyn InferenceBackend,
    request: GenerationRequest,
    cancel: &CancellationToken,
    update_interval: Duration,
    mut on_update: F,
) -> StreamReport
where
    F: FnMut(&str),
{
    let start = Instant::now();
    let mut accumulated = String::new();
    let mut fragments = 0usize;
    let mut first_token = None;
    let mut throttle = UpdateThrottle::new(update_interval);
    let mut last_emitted: Option<String> = None;

    let finish =
        |text: String, end: StreamEnd, tokens: usize, ttft: Option<Duration>| StreamReport {
            text,
            end,
            stats: GenerationStats::new(tokens, start.elapsed(), ttft),
        };

    let stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return finish(accumulated, StreamEnd::Cancelled, 0, None);
        }
        stream = backend.generate_stream(request, cancel.child_token()) => stream,
    };

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Backend refused generation: {}", e);
            return finish(accumulated, StreamEnd::Failed(e), 0, None);
        }
    };
    let mut tokens = stream.tokens;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Generation cancelled after {} fragments", fragments);
                return finish(accumulated, StreamEnd::Cancelled, fragments, first_token);
            }
            next = tokens.next() => next,
        };

        match next {
            Some(Ok(fragment)) => {
                if first_token.is_none() {
                    first_token = Some(start.elapsed());
                }
                fragments += 1;
                accumulated.push_str(&fragment);
                if throttle.try_emit() {
                    on_update(&accumulated);
                    last_emitted = Some(accumulated.clone());
                }
            }
            Some(Err(e)) => {
                warn!("Token stream failed: {}", e);
                return finish(accumulated, StreamEnd::Failed(e), fragments, first_token);
            }
            None => break,
        }
    }
    drop(tokens);

    let completion = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return finish(accumulated, StreamEnd::Cancelled, fragments, first_token);
        }
        completion = stream.completion => completion,
    };

    match completion {
        Ok(completion) => {
            let text = if completion.text.is_empty() {
                accumulated
            } else {
                completion.text
            };
            let tokens_used = if completion.tokens_used > 0 {
                completion.tokens_used
            } else {
                fragments
            };
            if last_emitted.as_deref() != Some(text.as_str()) {
                on_update(&text);
            }
            finish(text, StreamEnd::Completed, tokens_used, first_token)
        }
        Err(e) => {
            warn!("Generation did not complete: {}", e);
            finish(accumulated, StreamEnd::Failed(e), fragments, first_token)
        }
    }
}
