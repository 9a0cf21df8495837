//! Frame codec for the text-event-stream wire protocol.
//!
//! Contract:
//! - A well-formed frame is one or more field lines terminated by a blank
//!   line. Only `data:` field lines carry payload; multiple data lines in
//!   one frame are joined with `\n`.
//! - `decode` is idempotent and resumable: feeding it `remainder` prefixed
//!   to newly arrived bytes reconstructs exactly the same payload sequence
//!   as if all bytes had arrived at once.
//! - The literal payload `[DONE]` is the terminal sentinel and is returned
//!   verbatim, never JSON-parsed.

use serde::{Deserialize, Serialize};

use crate::model::{TokenEvent, TokenKind};

/// Terminal sentinel payload marking end-of-stream.
pub const DONE: &str = "[DONE]";

const DATA_PREFIX: &str = "data:";

/// Wire-level payload of one frame. Presence of `thinking` denotes a
/// Reasoning event, presence of `response` a Content event; a payload may
/// legally carry neither (and is then ignored by the consumer).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FramePayload {
    pub tone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

impl From<&TokenEvent> for FramePayload {
    fn from(ev: &TokenEvent) -> Self {
        let (thinking, response) = match ev.kind {
            TokenKind::Reasoning => (Some(ev.text.clone()), None),
            TokenKind::Content => (None, Some(ev.text.clone())),
        };
        FramePayload {
            tone: ev.tone.id().to_string(),
            thinking,
            response,
        }
    }
}

/// Encode one token event as a single frame. JSON string escaping guarantees
/// the payload line contains no raw newlines.
pub fn encode(event: &TokenEvent) -> String {
    let payload = FramePayload::from(event);
    let json = serde_json::to_string(&payload).expect("frame payload serializes");
    format!("{DATA_PREFIX} {json}\n\n")
}

/// Encode the terminal sentinel frame.
pub fn encode_terminal() -> String {
    format!("{DATA_PREFIX} {DONE}\n\n")
}

/// Decode all complete frames from `buffer`.
///
/// Returns the ordered decoded payload strings and the unconsumed remainder
/// (the trailing partial frame, if any). Carriage returns are normalized
/// away before delimiting, so the remainder is always CR-free.
pub fn decode(buffer: &str) -> (Vec<String>, String) {
    let mut work = if buffer.contains('\r') {
        buffer.replace('\r', "")
    } else {
        buffer.to_string()
    };

    let mut payloads = Vec::new();
    while let Some(idx) = work.find("\n\n") {
        let frame: String = work.drain(..idx + 2).collect();
        if let Some(payload) = decode_frame(frame.trim_end_matches('\n')) {
            payloads.push(payload);
        }
    }
    (payloads, work)
}

/// Extract the payload of one delimited frame region. Frames with no data
/// lines (comments, bare `event:` fields, keep-alives) yield nothing.
fn decode_frame(region: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for line in region.split('\n') {
        if let Some(rest) = line.strip_prefix(DATA_PREFIX) {
            parts.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tone;

    #[test]
    fn encode_content_frame() {
        let ev = TokenEvent::content(Tone::Direct, "hello");
        let wire = encode(&ev);
        assert_eq!(wire, "data: {\"tone\":\"direct\",\"response\":\"hello\"}\n\n");
    }

    #[test]
    fn encode_reasoning_frame() {
        let ev = TokenEvent::reasoning(Tone::Friendly, "let me think");
        let wire = encode(&ev);
        assert!(wire.starts_with("data: "));
        assert!(wire.ends_with("\n\n"));
        let payload: FramePayload =
            serde_json::from_str(wire.trim_start_matches("data: ").trim_end()).unwrap();
        assert_eq!(payload.tone, "friendly");
        assert_eq!(payload.thinking.as_deref(), Some("let me think"));
        assert_eq!(payload.response, None);
    }

    #[test]
    fn newlines_in_text_stay_inside_the_json_string() {
        let ev = TokenEvent::content(Tone::Poetic, "line1\nline2");
        let wire = encode(&ev);
        // Exactly the frame delimiter, nothing mid-payload.
        assert_eq!(wire.matches('\n').count(), 2);
        assert!(wire.contains("line1\\nline2"));
    }

    #[test]
    fn terminal_sentinel_wire_form() {
        assert_eq!(encode_terminal(), "data: [DONE]\n\n");
    }

    #[test]
    fn decode_single_frame() {
        let (events, rest) = decode("data: {\"tone\":\"direct\",\"response\":\"hi\"}\n\n");
        assert_eq!(events, vec!["{\"tone\":\"direct\",\"response\":\"hi\"}"]);
        assert!(rest.is_empty());
    }

    #[test]
    fn decode_keeps_trailing_partial_frame() {
        let (events, rest) = decode("data: {\"a\":1}\n\ndata: {\"b\"");
        assert_eq!(events.len(), 1);
        assert_eq!(rest, "data: {\"b\"");
    }

    #[test]
    fn decode_is_resumable_across_arbitrary_chunks() {
        let total = format!(
            "{}{}{}",
            encode(&TokenEvent::content(Tone::Direct, "a")),
            encode(&TokenEvent::reasoning(Tone::Poetic, "b")),
            encode_terminal()
        );
        let all_at_once = decode(&total).0;

        // Every possible split into three chunks must reconstruct the same
        // payload sequence.
        let bytes: Vec<char> = total.chars().collect();
        for i in 0..bytes.len() {
            for j in i..bytes.len() {
                let chunks = [
                    bytes[..i].iter().collect::<String>(),
                    bytes[i..j].iter().collect::<String>(),
                    bytes[j..].iter().collect::<String>(),
                ];
                let mut carry = String::new();
                let mut got = Vec::new();
                for chunk in &chunks {
                    carry.push_str(chunk);
                    let (events, rest) = decode(&carry);
                    got.extend(events);
                    carry = rest;
                }
                assert_eq!(got, all_at_once, "split at ({i},{j})");
                assert!(carry.is_empty());
            }
        }
    }

    #[test]
    fn decode_normalizes_carriage_returns() {
        let (events, rest) = decode("data: {\"tone\":\"direct\"}\r\n\r\n");
        assert_eq!(events, vec!["{\"tone\":\"direct\"}"]);
        assert!(rest.is_empty());
    }

    #[test]
    fn multiple_data_lines_join_with_newline() {
        let (events, _) = decode("data: first\ndata: second\n\n");
        assert_eq!(events, vec!["first\nsecond"]);
    }

    #[test]
    fn non_data_lines_are_dropped() {
        let (events, _) = decode("event: delta\nid: 7\ndata: payload\n\n");
        assert_eq!(events, vec!["payload"]);
    }

    #[test]
    fn frames_without_data_lines_yield_nothing() {
        let (events, rest) = decode(": keep-alive\n\nevent: ping\n\n");
        assert!(events.is_empty());
        assert!(rest.is_empty());
    }

    #[test]
    fn done_sentinel_returned_verbatim() {
        let (events, _) = decode(&encode_terminal());
        assert_eq!(events, vec![DONE]);
    }

    #[test]
    fn prefix_without_space_is_tolerated() {
        let (events, _) = decode("data:tight\n\n");
        assert_eq!(events, vec!["tight"]);
    }

    #[test]
    fn decode_then_encode_roundtrips_semantics() {
        let ev = TokenEvent::content(Tone::Friendly, "round trip ✓");
        let (payloads, _) = decode(&encode(&ev));
        let parsed: FramePayload = serde_json::from_str(&payloads[0]).unwrap();
        assert_eq!(parsed, FramePayload::from(&ev));
    }
}
