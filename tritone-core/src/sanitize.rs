use crate::model::{ChatMessage, Role};
use unicode_normalization::UnicodeNormalization;

pub(crate) fn clean_text(s: &str) -> String {
    // Unicode NFC normalization + BOM strip + CRLF -> LF + trim
    let mut t = s.nfc().collect::<String>();
    if t.starts_with('\u{FEFF}') {
        // Byte Order Mark
        t.remove(0);
    }
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    t.trim().to_string()
}

/// Prepare a caller-supplied message history for an exchange.
///
/// Pre-existing system entries are stripped: the multiplexer injects its own
/// per-variant instruction when opening each upstream stream. Empty messages
/// are dropped after cleaning.
pub fn prepare_history(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    messages
        .into_iter()
        .filter(|m| m.role != Role::System)
        .map(|mut m| {
            m.content = clean_text(&m.content);
            m
        })
        .filter(|m| !m.content.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_system_entries() {
        let history = vec![
            ChatMessage {
                role: Role::System,
                content: "You are a pirate.".into(),
            },
            ChatMessage::user("ahoy"),
            ChatMessage::assistant("hello"),
        ];
        let out = prepare_history(history);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|m| m.role != Role::System));
    }

    #[test]
    fn trims_and_drops_empty() {
        let history = vec![
            ChatMessage::user("  hello   "),
            ChatMessage::user("   "),
            ChatMessage::assistant(""),
        ];
        let out = prepare_history(history);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content, "hello");
    }

    #[test]
    fn unicode_nfc_and_crlf_normalization() {
        // "e" + combining acute accent should normalize to "é"
        let out = prepare_history(vec![ChatMessage::user("e\u{301}")]);
        assert_eq!(out[0].content, "é");

        // CRLF becomes LF
        let out2 = prepare_history(vec![ChatMessage::user("line1\r\nline2")]);
        assert_eq!(out2[0].content, "line1\nline2");
    }

    #[test]
    fn bom_is_stripped() {
        let out = prepare_history(vec![ChatMessage::user("\u{FEFF}hi")]);
        assert_eq!(out[0].content, "hi");
    }
}
