//! Client-side demultiplexer: reassembles frames from an arbitrarily
//! chunked byte stream, routes payloads to per-tone buffers, and drives a
//! render sink under a shared rate limit.
//!
//! Malformed payloads are logged and skipped; a broken frame never aborts
//! the exchange. The terminal sentinel makes the final render unconditional
//! so no trailing tokens are ever left unrendered.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;

use crate::frame::{self, FramePayload, DONE};
use crate::markdown;
use crate::model::Tone;

/// Accumulated text of one tone variant.
#[derive(Debug, Default, Clone)]
pub struct StreamBuffer {
    reasoning_text: String,
    response_text: String,
    thinking_visible: bool,
}

impl StreamBuffer {
    pub fn reasoning_text(&self) -> &str {
        &self.reasoning_text
    }

    pub fn response_text(&self) -> &str {
        &self.response_text
    }

    /// One-way flag: set when the first reasoning fragment arrives, never
    /// cleared for the lifetime of the exchange.
    pub fn thinking_visible(&self) -> bool {
        self.thinking_visible
    }
}

/// Where rendered HTML goes. Implementations decide what a "render" means
/// (a terminal repaint, a DOM patch, a test recording).
pub trait RenderSink {
    fn content_update(&mut self, tone: Tone, html: &str);
    fn thinking_update(&mut self, tone: Tone, html: &str);
    /// Fired once per tone, when its first reasoning fragment arrives.
    fn thinking_revealed(&mut self, tone: Tone);
}

pub struct Demultiplexer<S: RenderSink> {
    sink: S,
    buffers: HashMap<Tone, StreamBuffer>,
    carry: Vec<u8>,
    interval: Duration,
    last_render: Option<Instant>,
    dirty: HashSet<Tone>,
    done: bool,
}

impl<S: RenderSink> Demultiplexer<S> {
    pub fn new(sink: S, render_interval: Duration) -> Self {
        Self {
            sink,
            buffers: Tone::ALL.iter().map(|t| (*t, StreamBuffer::default())).collect(),
            carry: Vec::new(),
            interval: render_interval,
            last_render: None,
            dirty: HashSet::new(),
            done: false,
        }
    }

    /// Feed raw bytes as they arrive. Chunk boundaries are arbitrary: frames
    /// and even multi-byte characters may be split anywhere.
    pub fn feed(&mut self, bytes: &[u8]) {
        if self.done {
            return;
        }
        self.carry.extend_from_slice(bytes);

        // Only the valid UTF-8 prefix is decodable; a split character's
        // leading bytes stay in the carry until the rest arrives.
        let valid = match std::str::from_utf8(&self.carry) {
            Ok(s) => s.len(),
            Err(e) => e.valid_up_to(),
        };
        let text = std::str::from_utf8(&self.carry[..valid]).expect("validated prefix");
        let (payloads, rest) = frame::decode(text);
        let mut new_carry = rest.into_bytes();
        new_carry.extend_from_slice(&self.carry[valid..]);
        self.carry = new_carry;

        for payload in payloads {
            self.apply_payload(&payload);
            if self.done {
                break;
            }
        }
        self.maybe_render();
    }

    /// Signal end of the byte stream. A dangling unterminated frame is
    /// flushed as if its delimiter had arrived, then everything pending is
    /// rendered unconditionally.
    pub fn finish(&mut self) {
        if !self.done {
            self.feed(b"\n\n");
            self.done = true;
            self.carry.clear();
            self.render(true);
        }
    }

    fn apply_payload(&mut self, payload: &str) {
        if payload == DONE {
            self.done = true;
            self.carry.clear();
            self.render(true);
            return;
        }
        let parsed: FramePayload = match serde_json::from_str(payload) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "malformed frame payload; skipping");
                return;
            }
        };
        let Some(tone) = Tone::from_id(&parsed.tone) else {
            tracing::warn!(tone = %parsed.tone, "frame for unknown tone; skipping");
            return;
        };
        let buffer = self.buffers.entry(tone).or_default();
        if let Some(thinking) = &parsed.thinking
            && !thinking.is_empty()
        {
            buffer.reasoning_text.push_str(thinking);
            if !buffer.thinking_visible {
                buffer.thinking_visible = true;
                self.sink.thinking_revealed(tone);
            }
            self.dirty.insert(tone);
        }
        if let Some(response) = &parsed.response
            && !response.is_empty()
        {
            buffer.response_text.push_str(response);
            self.dirty.insert(tone);
        }
    }

    fn maybe_render(&mut self) {
        if self.done {
            return; // already force-rendered by the sentinel
        }
        let due = self
            .last_render
            .is_none_or(|t| t.elapsed() >= self.interval);
        if due {
            self.render(false);
        }
    }

    /// Re-render every dirty tone. `force` skips the throttle clock update
    /// guard used for the final render.
    fn render(&mut self, force: bool) {
        if self.dirty.is_empty() && !force {
            return;
        }
        for tone in Tone::ALL {
            if !self.dirty.remove(&tone) {
                continue;
            }
            let buffer = &self.buffers[&tone];
            if buffer.thinking_visible {
                self.sink
                    .thinking_update(tone, &markdown::render(&buffer.reasoning_text));
            }
            self.sink
                .content_update(tone, &markdown::render(&buffer.response_text));
        }
        self.last_render = Some(Instant::now());
    }

    pub fn is_complete(&self) -> bool {
        self.done
    }

    pub fn buffer(&self, tone: Tone) -> &StreamBuffer {
        &self.buffers[&tone]
    }

    pub fn response_text(&self, tone: Tone) -> &str {
        self.buffers[&tone].response_text()
    }

    pub fn reasoning_text(&self, tone: Tone) -> &str {
        self.buffers[&tone].reasoning_text()
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChatMessage, TokenEvent};
    use crate::mux::Multiplexer;
    use crate::provider::{ScriptStep, ScriptedProvider};
    use futures_util::StreamExt;
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum Call {
        Content(Tone, String),
        Thinking(Tone, String),
        Revealed(Tone),
    }

    #[derive(Default)]
    struct RecordingSink {
        calls: Vec<Call>,
    }

    impl RenderSink for RecordingSink {
        fn content_update(&mut self, tone: Tone, html: &str) {
            self.calls.push(Call::Content(tone, html.to_string()));
        }
        fn thinking_update(&mut self, tone: Tone, html: &str) {
            self.calls.push(Call::Thinking(tone, html.to_string()));
        }
        fn thinking_revealed(&mut self, tone: Tone) {
            self.calls.push(Call::Revealed(tone));
        }
    }

    fn wire(events: &[TokenEvent], done: bool) -> Vec<u8> {
        let mut out = String::new();
        for ev in events {
            out.push_str(&frame::encode(ev));
        }
        if done {
            out.push_str(&frame::encode_terminal());
        }
        out.into_bytes()
    }

    #[tokio::test]
    async fn routes_fragments_to_per_tone_buffers_in_order() {
        let mut demux = Demultiplexer::new(RecordingSink::default(), Duration::ZERO);
        let bytes = wire(
            &[
                TokenEvent::content(Tone::Direct, "Hel"),
                TokenEvent::content(Tone::Friendly, "Hey"),
                TokenEvent::content(Tone::Direct, "lo"),
                TokenEvent::reasoning(Tone::Poetic, "hmm"),
            ],
            true,
        );
        demux.feed(&bytes);

        assert!(demux.is_complete());
        assert_eq!(demux.response_text(Tone::Direct), "Hello");
        assert_eq!(demux.response_text(Tone::Friendly), "Hey");
        assert_eq!(demux.reasoning_text(Tone::Poetic), "hmm");
        assert!(demux.buffer(Tone::Poetic).thinking_visible());
        assert!(!demux.buffer(Tone::Direct).thinking_visible());
    }

    #[tokio::test]
    async fn arbitrary_chunking_including_split_utf8_is_lossless() {
        let bytes = wire(&[TokenEvent::content(Tone::Direct, "naïve ✓")], true);
        for split in 1..bytes.len() {
            let mut demux = Demultiplexer::new(RecordingSink::default(), Duration::ZERO);
            demux.feed(&bytes[..split]);
            demux.feed(&bytes[split..]);
            assert_eq!(demux.response_text(Tone::Direct), "naïve ✓", "split {split}");
            assert!(demux.is_complete());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn renders_are_rate_limited_with_unconditional_final() {
        let mut demux =
            Demultiplexer::new(RecordingSink::default(), Duration::from_millis(50));

        demux.feed(&wire(&[TokenEvent::content(Tone::Direct, "a")], false));
        demux.feed(&wire(&[TokenEvent::content(Tone::Direct, "b")], false));
        demux.feed(&wire(&[TokenEvent::content(Tone::Direct, "c")], false));

        // First feed rendered immediately; the next two were throttled.
        let renders = |sink: &RecordingSink| {
            sink.calls
                .iter()
                .filter(|c| matches!(c, Call::Content(..)))
                .count()
        };
        tokio::time::advance(Duration::from_millis(60)).await;
        demux.feed(&wire(&[TokenEvent::content(Tone::Direct, "d")], false));
        // Throttled again, then flushed by the sentinel's unconditional render.
        demux.feed(&wire(&[TokenEvent::content(Tone::Direct, "e")], false));
        demux.feed(&wire(&[], true));

        let sink = demux.into_sink();
        assert_eq!(renders(&sink), 3);
        let last = sink
            .calls
            .iter()
            .rev()
            .find_map(|c| match c {
                Call::Content(Tone::Direct, html) => Some(html.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(last, "abcde");
    }

    #[tokio::test]
    async fn thinking_revealed_fires_exactly_once_per_tone() {
        let mut demux = Demultiplexer::new(RecordingSink::default(), Duration::ZERO);
        demux.feed(&wire(
            &[
                TokenEvent::reasoning(Tone::Friendly, "one"),
                TokenEvent::reasoning(Tone::Friendly, "two"),
                TokenEvent::reasoning(Tone::Direct, "other"),
            ],
            true,
        ));
        let sink = demux.into_sink();
        let reveals: Vec<_> = sink
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Revealed(_)))
            .collect();
        assert_eq!(
            reveals,
            vec![&Call::Revealed(Tone::Friendly), &Call::Revealed(Tone::Direct)]
        );
    }

    #[tokio::test]
    async fn malformed_and_unknown_tone_payloads_are_skipped() {
        let mut demux = Demultiplexer::new(RecordingSink::default(), Duration::ZERO);
        let mut bytes = b"data: {not json\n\n".to_vec();
        bytes.extend_from_slice(b"data: {\"tone\":\"gruff\",\"response\":\"x\"}\n\n");
        bytes.extend_from_slice(&wire(&[TokenEvent::content(Tone::Direct, "kept")], true));
        demux.feed(&bytes);

        assert_eq!(demux.response_text(Tone::Direct), "kept");
        assert!(demux.is_complete());
    }

    #[tokio::test]
    async fn bytes_after_done_are_ignored() {
        let mut demux = Demultiplexer::new(RecordingSink::default(), Duration::ZERO);
        demux.feed(&wire(&[TokenEvent::content(Tone::Direct, "a")], true));
        demux.feed(&wire(&[TokenEvent::content(Tone::Direct, "b")], false));
        assert_eq!(demux.response_text(Tone::Direct), "a");
    }

    #[tokio::test]
    async fn finish_flushes_a_dangling_frame() {
        let mut demux = Demultiplexer::new(RecordingSink::default(), Duration::ZERO);
        // Stream cut off before the frame delimiter arrived.
        let complete = frame::encode(&TokenEvent::content(Tone::Poetic, "tail"));
        demux.feed(complete.trim_end().as_bytes());
        assert_eq!(demux.response_text(Tone::Poetic), "");

        demux.finish();
        assert!(demux.is_complete());
        assert_eq!(demux.response_text(Tone::Poetic), "tail");
    }

    #[tokio::test]
    async fn end_to_end_mux_to_demux_over_chopped_bytes() {
        let provider = ScriptedProvider::new()
            .with_script(
                Tone::Direct,
                vec![
                    ScriptStep::Reasoning("plan".into()),
                    ScriptStep::Content("**bold** answer".into()),
                ],
            )
            .with_script(
                Tone::Friendly,
                vec![
                    ScriptStep::Content("hey ".into()),
                    ScriptStep::Content("there".into()),
                ],
            )
            .with_script(Tone::Poetic, vec![ScriptStep::Content("ode".into())]);
        let mux = Multiplexer::all_tones(Arc::new(provider), 4);

        let mut stream = mux.open(vec![ChatMessage::user("hi")]);
        let mut all = Vec::new();
        while let Some(item) = stream.next().await {
            all.extend_from_slice(&item.unwrap());
        }

        let mut demux = Demultiplexer::new(RecordingSink::default(), Duration::ZERO);
        for chunk in all.chunks(3) {
            demux.feed(chunk);
        }
        assert!(demux.is_complete());
        assert_eq!(demux.response_text(Tone::Direct), "**bold** answer");
        assert_eq!(demux.reasoning_text(Tone::Direct), "plan");
        assert_eq!(demux.response_text(Tone::Friendly), "hey there");
        assert_eq!(demux.response_text(Tone::Poetic), "ode");

        let sink = demux.into_sink();
        let final_direct = sink
            .calls
            .iter()
            .rev()
            .find_map(|c| match c {
                Call::Content(Tone::Direct, html) => Some(html.as_str()),
                _ => None,
            })
            .unwrap();
        assert_eq!(final_direct, "<strong>bold</strong> answer");
    }
}
