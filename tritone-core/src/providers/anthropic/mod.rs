use futures_util::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::{
    config::{Config, UpstreamCfg},
    error::{CoreResult, TritoneError},
    http_client::{HttpClient, SseLine},
    model::{ChatMessage, Role, TokenEvent, Tone},
    provider::{StreamingProvider, TokenEventStream},
};
use async_trait::async_trait;

/// Default Anthropic API version header required by the Messages API.
const ANTHROPIC_API_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct Anthropic {
    http: HttpClient,
    api_key: SecretString,
    base: String,
    model: String,
    max_output_tokens: u32,
    thinking_budget_tokens: u32,
    name: String,
}

impl Anthropic {
    pub fn new(http: HttpClient, api_key: SecretString, upstream: &UpstreamCfg) -> Self {
        Self {
            http,
            api_key,
            base: upstream.base.clone(),
            model: upstream.model.clone(),
            max_output_tokens: upstream.max_output_tokens,
            thinking_budget_tokens: upstream.thinking_budget_tokens,
            name: "anthropic".into(),
        }
    }

    /// Build the provider from a loaded config, resolving the credential
    /// before any stream is opened.
    pub fn from_config(cfg: &Config) -> CoreResult<Self> {
        let http = HttpClient::from_config(&cfg.http)?;
        let api_key = cfg.resolve_api_key()?;
        Ok(Self::new(http, api_key, &cfg.upstream))
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![
            (
                "x-api-key".to_string(),
                self.api_key.expose_secret().to_string(),
            ),
            (
                "anthropic-version".to_string(),
                ANTHROPIC_API_VERSION.to_string(),
            ),
        ]
    }
}

// ===== Anthropic wire types (streaming Messages API) =====

#[derive(Serialize)]
struct AMsgReq<'a> {
    model: &'a str,
    messages: Vec<AMessage<'a>>, // role/content pairs
    system: &'a str,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<AThinking>,
}

#[derive(Serialize)]
struct AMessage<'a> {
    role: &'a str,
    content: Vec<AContent<'a>>, // Anthropic requires an array of content blocks
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AContent<'a> {
    Text { text: &'a str },
}

#[derive(Serialize)]
struct AThinking {
    #[serde(rename = "type")]
    kind: &'static str,
    budget_tokens: u32,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum AStreamEvent {
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: ADelta },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "error")]
    Error { error: AApiError },
    // message_start, content_block_start/stop, message_delta, ping
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ADelta {
    #[serde(rename = "thinking_delta")]
    Thinking { thinking: String },
    #[serde(rename = "text_delta")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct AApiError {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

/// What one SSE line contributes to the token stream.
enum LineOutcome {
    Event(TokenEvent),
    Fail(TritoneError),
    Stop,
    Skip,
}

fn classify_line(item: CoreResult<SseLine>, tone: Tone, provider: &str) -> LineOutcome {
    let line = match item {
        Ok(l) => l.line,
        Err(e) => return LineOutcome::Fail(e),
    };
    let Some(data) = line.strip_prefix("data:") else {
        // event:/id: fields and keep-alive comments carry no payload.
        return LineOutcome::Skip;
    };
    let data = data.trim();
    if data.is_empty() {
        return LineOutcome::Skip;
    }
    match serde_json::from_str::<AStreamEvent>(data) {
        Ok(AStreamEvent::ContentBlockDelta { delta }) => match delta {
            ADelta::Thinking { thinking } if !thinking.is_empty() => {
                LineOutcome::Event(TokenEvent::reasoning(tone, thinking))
            }
            ADelta::Text { text } if !text.is_empty() => {
                LineOutcome::Event(TokenEvent::content(tone, text))
            }
            _ => LineOutcome::Skip,
        },
        Ok(AStreamEvent::MessageStop) => LineOutcome::Stop,
        Ok(AStreamEvent::Error { error }) => LineOutcome::Fail(TritoneError::Upstream {
            provider: provider.to_string(),
            code: error.kind,
            message: error.message,
        }),
        Ok(AStreamEvent::Other) => LineOutcome::Skip,
        Err(e) => {
            tracing::warn!(provider, error = %e, "unparseable stream event; skipping");
            LineOutcome::Skip
        }
    }
}

#[async_trait]
impl StreamingProvider for Anthropic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open_stream(
        &self,
        history: &[ChatMessage],
        tone: Tone,
    ) -> CoreResult<TokenEventStream> {
        let messages: Vec<AMessage<'_>> = history
            .iter()
            .filter_map(|m| {
                let role = match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::System => return None,
                };
                Some(AMessage {
                    role,
                    content: vec![AContent::Text { text: &m.content }],
                })
            })
            .collect();

        let body = AMsgReq {
            model: &self.model,
            messages,
            system: tone.instruction(),
            max_tokens: self.max_output_tokens,
            stream: true,
            thinking: (self.thinking_budget_tokens > 0).then(|| AThinking {
                kind: "enabled",
                budget_tokens: self.thinking_budget_tokens,
            }),
        };

        let url = format!("{}/v1/messages", self.base);
        let headers = self.headers();
        let header_refs: Vec<(&str, &str)> = headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let lines = self
            .http
            .post_sse_lines(&url, &body, &header_refs, &self.name)
            .await?;

        let provider = self.name.clone();
        let events = lines
            .map(move |item| classify_line(item, tone, &provider))
            .take_while(|outcome| {
                futures_util::future::ready(!matches!(outcome, LineOutcome::Stop))
            })
            .filter_map(|outcome| {
                futures_util::future::ready(match outcome {
                    LineOutcome::Event(ev) => Some(Ok(ev)),
                    LineOutcome::Fail(e) => Some(Err(e)),
                    LineOutcome::Stop | LineOutcome::Skip => None,
                })
            });
        Ok(Box::pin(events))
    }
}
