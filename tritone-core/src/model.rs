use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One of the fixed response personas requested per exchange.
///
/// The instruction prefix is only used when opening the upstream stream;
/// the multiplexer and demultiplexer treat tones as opaque identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tone {
    Direct,
    Friendly,
    Poetic,
}

impl Tone {
    pub const ALL: [Tone; 3] = [Tone::Direct, Tone::Friendly, Tone::Poetic];

    /// Stable wire identifier, carried in every frame's `tone` field.
    pub fn id(&self) -> &'static str {
        match self {
            Tone::Direct => "direct",
            Tone::Friendly => "friendly",
            Tone::Poetic => "poetic",
        }
    }

    pub fn from_id(id: &str) -> Option<Tone> {
        Tone::ALL.iter().copied().find(|t| t.id() == id)
    }

    /// System instruction injected per variant when opening the upstream
    /// stream. Any pre-existing system entries in the history are stripped
    /// before this is applied.
    pub fn instruction(&self) -> &'static str {
        match self {
            Tone::Direct => {
                "Answer as briefly and directly as possible. No pleasantries, no hedging."
            }
            Tone::Friendly => {
                "Answer warmly and conversationally, as a helpful friend would."
            }
            Tone::Poetic => {
                "Answer with lyrical, evocative language. Favor imagery over bullet points."
            }
        }
    }
}

impl std::fmt::Display for Tone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Which sub-stream of a variant a fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Reasoning,
    Content,
}

/// One incremental fragment of reasoning or response text from the upstream
/// model. Produced by a provider stream, consumed exactly once by the codec.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenEvent {
    pub tone: Tone,
    pub kind: TokenKind,
    pub text: String,
}

impl TokenEvent {
    pub fn reasoning(tone: Tone, text: impl Into<String>) -> Self {
        Self {
            tone,
            kind: TokenKind::Reasoning,
            text: text.into(),
        }
    }

    pub fn content(tone: Tone, text: impl Into<String>) -> Self {
        Self {
            tone,
            kind: TokenKind::Content,
            text: text.into(),
        }
    }
}
