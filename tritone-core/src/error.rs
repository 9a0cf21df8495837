use thiserror::Error;

/// Core error type for tritone.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
///
/// Malformed individual frames are deliberately *not* represented here:
/// the demultiplexer logs and skips them without aborting the exchange.
#[derive(Debug, Error)]
pub enum TritoneError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("rate limited by upstream {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<u64>,
    },

    #[error("upstream unavailable: {provider}")]
    UpstreamUnavailable { provider: String },

    #[error("upstream error from {provider}: {code} {message}")]
    Upstream {
        provider: String,
        code: String,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TritoneError {
    /// Stable kind label for telemetry and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::RateLimited { .. } => "rate_limited",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::Upstream { .. } => "upstream",
            Self::Transport(_) => "transport",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, TritoneError>;

/// The single non-streamed JSON error body returned when an exchange fails
/// before any stream bytes were sent.
pub fn error_body(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}
