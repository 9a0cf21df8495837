//! Telemetry primitives for exchange-level observability.
//! By default, nothing is emitted unless a sink is installed via
//! `set_telemetry_sink`.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::model::Tone;

/// One settled exchange: one request fanned out to N tone variants,
/// streamed back, and completed (or failed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExchangeLog {
    /// Provider identifier, e.g. "anthropic", "scripted".
    pub provider: Option<String>,

    /// Wire ids of the tones requested for this exchange.
    pub tones: Vec<String>,

    /// Wall time from fan-out to the last frame, in milliseconds.
    pub latency_ms: Option<u64>,

    /// Token frames written to the merge channel (sentinel excluded).
    pub frames: u64,

    pub reasoning_chars: u64,
    pub response_chars: u64,

    /// Kind label of the first error, if any variant failed.
    pub error_kind: Option<String>,
}

impl ExchangeLog {
    pub fn new(provider: impl Into<String>, tones: &[Tone]) -> Self {
        Self {
            provider: Some(provider.into()),
            tones: tones.iter().map(|t| t.id().to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.latency_ms = Some(ms);
        self
    }

    pub fn frames(mut self, frames: u64) -> Self {
        self.frames = frames;
        self
    }

    pub fn reasoning_chars(mut self, chars: u64) -> Self {
        self.reasoning_chars = chars;
        self
    }

    pub fn response_chars(mut self, chars: u64) -> Self {
        self.response_chars = chars;
        self
    }

    pub fn error_kind(mut self, kind: Option<String>) -> Self {
        self.error_kind = kind;
        self
    }

    pub fn completed(&self) -> bool {
        self.error_kind.is_none()
    }
}

/// Implement this to receive telemetry events.
///
/// Implementations must be thread-safe (`Send + Sync`) and `'static`;
/// `record_exchange` may be called from any task and should not panic.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record_exchange(&self, log: ExchangeLog);
}

static TELEMETRY_SINK: OnceCell<Arc<dyn TelemetrySink>> = OnceCell::new();

// In tests, gate emission to the calling test thread to avoid cross-test
// interference.
#[cfg(test)]
thread_local! {
    static TEST_CAPTURE: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Install a global telemetry sink. Returns `false` if a sink is already
/// installed; the global is write-once for the process lifetime.
pub fn set_telemetry_sink(sink: Arc<dyn TelemetrySink>) -> bool {
    TELEMETRY_SINK.set(sink).is_ok()
}

/// Emit an exchange record if a sink is installed.
#[inline]
pub(crate) fn emit_exchange(log: ExchangeLog) {
    #[cfg(test)]
    {
        if !TEST_CAPTURE.with(|c| c.get()) {
            return;
        }
    }
    tracing::debug!(
        provider = log.provider.as_deref().unwrap_or(""),
        frames = log.frames,
        latency_ms = log.latency_ms.unwrap_or(0),
        error_kind = log.error_kind.as_deref().unwrap_or(""),
        "exchange settled"
    );
    if let Some(sink) = TELEMETRY_SINK.get() {
        sink.record_exchange(log);
    }
}

#[cfg(test)]
/// Test-only helper: enable or disable capture for the current thread.
pub fn test_set_capture_enabled(enabled: bool) {
    TEST_CAPTURE.with(|c| c.set(enabled));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CapturingSink {
        logs: Mutex<Vec<ExchangeLog>>,
    }

    impl TelemetrySink for CapturingSink {
        fn record_exchange(&self, log: ExchangeLog) {
            self.logs.lock().unwrap().push(log);
        }
    }

    #[test]
    fn fluent_log_construction() {
        let log = ExchangeLog::new("anthropic", &Tone::ALL)
            .latency_ms(120)
            .frames(42)
            .reasoning_chars(100)
            .response_chars(900)
            .error_kind(None);
        assert_eq!(log.tones, vec!["direct", "friendly", "poetic"]);
        assert_eq!(log.frames, 42);
        assert!(log.completed());

        let failed = ExchangeLog::new("anthropic", &[Tone::Direct])
            .error_kind(Some("rate_limited".into()));
        assert!(!failed.completed());
    }

    #[test]
    fn emission_reaches_installed_sink_when_capture_enabled() {
        static SINK: OnceCell<Arc<CapturingSink>> = OnceCell::new();
        let sink = SINK
            .get_or_init(|| {
                Arc::new(CapturingSink {
                    logs: Mutex::new(Vec::new()),
                })
            })
            .clone();
        set_telemetry_sink(sink.clone());

        test_set_capture_enabled(true);
        emit_exchange(ExchangeLog::new("scripted", &[Tone::Direct]).frames(1));
        test_set_capture_enabled(false);
        emit_exchange(ExchangeLog::new("scripted", &[Tone::Direct]).frames(2));

        let logs = sink.logs.lock().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].frames, 1);
    }
}
