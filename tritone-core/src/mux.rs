//! Server-side fan-out: one request, N concurrent tone variants, one
//! ordered byte stream.
//!
//! Each tone gets its own producer task pumping the provider's token events
//! into a bounded merge channel as encoded frames. Frames from one tone stay
//! in production order; tones interleave in whatever order producers win the
//! channel. The terminal sentinel is appended exactly once, only after every
//! producer finished cleanly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use futures::channel::mpsc;
use futures::SinkExt;
use futures_util::StreamExt;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::{CoreResult, TritoneError};
use crate::frame;
use crate::model::{ChatMessage, TokenKind, Tone};
use crate::provider::StreamingProvider;
use crate::sanitize;
use crate::telemetry::{self, ExchangeLog};

/// Fans a chat exchange out to one upstream stream per tone and merges the
/// tagged frames onto a single channel.
pub struct Multiplexer {
    provider: Arc<dyn StreamingProvider>,
    tones: Vec<Tone>,
    capacity: usize,
}

/// Running totals shared by the producer tasks, flushed into one
/// `ExchangeLog` when the exchange settles.
#[derive(Default)]
struct ExchangeCounters {
    frames: AtomicU64,
    reasoning_chars: AtomicU64,
    response_chars: AtomicU64,
    first_error: Mutex<Option<String>>,
}

impl ExchangeCounters {
    fn note_error(&self, kind: &str) {
        let mut slot = self.first_error.lock().expect("first_error lock");
        if slot.is_none() {
            *slot = Some(kind.to_string());
        }
    }
}

impl Multiplexer {
    pub fn new(provider: Arc<dyn StreamingProvider>, tones: Vec<Tone>, capacity: usize) -> Self {
        Self {
            provider,
            tones,
            capacity: capacity.max(1),
        }
    }

    /// All three fixed tones, with the given channel capacity.
    pub fn all_tones(provider: Arc<dyn StreamingProvider>, capacity: usize) -> Self {
        Self::new(provider, Tone::ALL.to_vec(), capacity)
    }

    /// Open one upstream stream per tone and return the merged byte stream.
    ///
    /// System entries are stripped from `history` before it is handed to the
    /// provider; each variant gets its tone instruction instead. Dropping
    /// the returned stream cancels every producer at its next suspension
    /// point and aborts the upstream requests.
    pub fn open(&self, history: Vec<ChatMessage>) -> MergedStream {
        let history = Arc::new(sanitize::prepare_history(history));
        let (tx, rx) = mpsc::channel::<CoreResult<Bytes>>(self.capacity);
        let cancel = CancellationToken::new();
        let counters = Arc::new(ExchangeCounters::default());
        let started = Instant::now();

        let mut handles = Vec::with_capacity(self.tones.len());
        for tone in self.tones.iter().copied() {
            handles.push(tokio::spawn(pump_tone(
                self.provider.clone(),
                history.clone(),
                tone,
                cancel.clone(),
                tx.clone(),
                counters.clone(),
            )));
        }

        let provider_name = self.provider.name().to_string();
        let tones = self.tones.clone();
        let closer_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut tx = tx;
            let mut clean = true;
            for handle in handles {
                clean &= matches!(handle.await, Ok(true));
            }
            if clean && !closer_cancel.is_cancelled() {
                let _ = tx.send(Ok(Bytes::from(frame::encode_terminal()))).await;
            }
            let log = ExchangeLog::new(&provider_name, &tones)
                .latency_ms(started.elapsed().as_millis() as u64)
                .frames(counters.frames.load(Ordering::Relaxed))
                .reasoning_chars(counters.reasoning_chars.load(Ordering::Relaxed))
                .response_chars(counters.response_chars.load(Ordering::Relaxed))
                .error_kind(counters.first_error.lock().expect("first_error lock").take());
            telemetry::emit_exchange(log);
        });

        MergedStream {
            rx,
            cancel: cancel.clone(),
            _guard: cancel.drop_guard(),
        }
    }
}

/// Producer task for one tone. Returns true iff its stream ended cleanly.
async fn pump_tone(
    provider: Arc<dyn StreamingProvider>,
    history: Arc<Vec<ChatMessage>>,
    tone: Tone,
    cancel: CancellationToken,
    mut tx: mpsc::Sender<CoreResult<Bytes>>,
    counters: Arc<ExchangeCounters>,
) -> bool {
    let mut stream = tokio::select! {
        _ = cancel.cancelled() => return false,
        opened = provider.open_stream(&history, tone) => match opened {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(tone = %tone, error = %e, "variant stream failed to open");
                counters.note_error(e.kind());
                let _ = tx.send(Err(e)).await;
                cancel.cancel();
                return false;
            }
        },
    };

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return false,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(event)) => {
                counters.frames.fetch_add(1, Ordering::Relaxed);
                let chars = event.text.chars().count() as u64;
                match event.kind {
                    TokenKind::Reasoning => {
                        counters.reasoning_chars.fetch_add(chars, Ordering::Relaxed)
                    }
                    TokenKind::Content => {
                        counters.response_chars.fetch_add(chars, Ordering::Relaxed)
                    }
                };
                let bytes = Bytes::from(frame::encode(&event));
                if tx.send(Ok(bytes)).await.is_err() {
                    // Consumer went away; tear the rest of the fan-out down.
                    cancel.cancel();
                    return false;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(tone = %tone, error = %e, "variant stream failed mid-flight");
                counters.note_error(e.kind());
                let _ = tx.send(Err(e)).await;
                cancel.cancel();
                return false;
            }
            None => return true,
        }
    }
}

/// The single ordered byte stream of one exchange. Yields encoded frames
/// (and at most one `Err` if a variant failed). Dropping it cancels all
/// producer tasks.
pub struct MergedStream {
    rx: mpsc::Receiver<CoreResult<Bytes>>,
    cancel: CancellationToken,
    _guard: DropGuard,
}

impl MergedStream {
    /// Token observed by every producer of this exchange; cancelling it has
    /// the same effect as dropping the stream.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl futures_util::stream::Stream for MergedStream {
    type Item = CoreResult<Bytes>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.rx).poll_next(cx)
    }
}

/// Map an exchange-level failure to the non-streamed JSON error body and a
/// coarse status, for callers that surface errors over HTTP.
pub fn failure_response(err: &TritoneError) -> (u16, String) {
    let status = match err {
        TritoneError::Configuration(_) => 500,
        TritoneError::RateLimited { .. } => 429,
        TritoneError::UpstreamUnavailable { .. } => 503,
        _ => 502,
    };
    (status, crate::error::error_body(&err.to_string()))
}
