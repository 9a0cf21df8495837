use crate::demux::{Demultiplexer, RenderSink};
use crate::model::{ChatMessage, Tone};
use crate::sanitize;

/// Multi-turn transcript of one conversation.
///
/// All three variants stream to the client, but only one designated tone's
/// completed response is carried forward as the assistant turn; later
/// requests therefore stay single-threaded from the model's point of view.
#[derive(Debug, Clone)]
pub struct ChatSession {
    history: Vec<ChatMessage>,
    transcript_tone: Tone,
}

impl ChatSession {
    pub fn new(transcript_tone: Tone) -> Self {
        Self {
            history: Vec::new(),
            transcript_tone,
        }
    }

    pub fn transcript_tone(&self) -> Tone {
        self.transcript_tone
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Record the user's message for this turn. Returns false (and records
    /// nothing) when the message is empty after cleaning.
    pub fn push_user(&mut self, text: &str) -> bool {
        let cleaned = sanitize::clean_text(text);
        if cleaned.is_empty() {
            return false;
        }
        self.history.push(ChatMessage::user(cleaned));
        true
    }

    /// Fold a settled exchange into the transcript: the designated tone's
    /// completed response becomes the assistant turn. Reasoning text is
    /// display-only and never enters the transcript. An empty response (a
    /// failed or cancelled exchange) records nothing.
    pub fn absorb_exchange<S: RenderSink>(&mut self, demux: &Demultiplexer<S>) {
        self.record_assistant(demux.response_text(self.transcript_tone));
    }

    pub fn record_assistant(&mut self, text: &str) {
        let cleaned = sanitize::clean_text(text);
        if !cleaned.is_empty() {
            self.history.push(ChatMessage::assistant(cleaned));
        }
    }
}
