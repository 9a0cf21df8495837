use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::{CoreResult, TritoneError};
use crate::model::{ChatMessage, TokenEvent, Tone};

/// Ordered sequence of token events from one upstream stream. Terminates
/// with `None` on clean end, yields `Err` on upstream failure, and aborts
/// the underlying request when dropped.
pub type TokenEventStream = BoxStream<'static, CoreResult<TokenEvent>>;

/// Upstream capability: given a message history and a tone, produce an
/// ordered sequence of incremental token events.
#[async_trait]
pub trait StreamingProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn open_stream(
        &self,
        history: &[ChatMessage],
        tone: Tone,
    ) -> CoreResult<TokenEventStream>;
}

/// One step of a scripted stream.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Reasoning(String),
    Content(String),
    /// Fail the stream with an upstream error carrying this message.
    Fail(String),
    /// Park forever; only cancellation (dropping the stream) ends it.
    Stall,
}

/// A canned provider for tests and keyless smoke runs. Plays back a fixed
/// script per tone and tracks how many of its streams are currently open,
/// which makes cancellation observable.
pub struct ScriptedProvider {
    scripts: HashMap<Tone, Vec<ScriptStep>>,
    active: Arc<AtomicUsize>,
    seen_histories: Mutex<Vec<(Tone, Vec<ChatMessage>)>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            active: Arc::new(AtomicUsize::new(0)),
            seen_histories: Mutex::new(Vec::new()),
        }
    }

    pub fn with_script(mut self, tone: Tone, steps: Vec<ScriptStep>) -> Self {
        self.scripts.insert(tone, steps);
        self
    }

    /// A provider that echoes the prompt back in every tone, with a short
    /// reasoning preamble. Used by the CLI when no credential is configured.
    pub fn echoing(prompt: &str) -> Self {
        let mut p = Self::new();
        for tone in Tone::ALL {
            p.scripts.insert(
                tone,
                vec![
                    ScriptStep::Reasoning(format!("rephrasing in a {tone} voice")),
                    ScriptStep::Content(format!("[{tone}] ")),
                    ScriptStep::Content(prompt.to_string()),
                ],
            );
        }
        p
    }

    /// Number of scripted streams currently open (not yet ended or dropped).
    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Histories observed by `open_stream`, in call order.
    pub fn seen_histories(&self) -> Vec<(Tone, Vec<ChatMessage>)> {
        self.seen_histories.lock().expect("seen_histories lock").clone()
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the active-stream count when the stream is dropped, whether it
/// ran to completion or was cancelled.
struct StreamGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StreamingProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open_stream(
        &self,
        history: &[ChatMessage],
        tone: Tone,
    ) -> CoreResult<TokenEventStream> {
        self.seen_histories
            .lock()
            .expect("seen_histories lock")
            .push((tone, history.to_vec()));

        let steps = self.scripts.get(&tone).cloned().unwrap_or_default();
        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = StreamGuard {
            active: self.active.clone(),
        };

        let stream = futures::stream::unfold(
            (steps.into_iter(), guard, tone),
            |(mut steps, guard, tone)| async move {
                match steps.next() {
                    Some(ScriptStep::Reasoning(text)) => {
                        Some((Ok(TokenEvent::reasoning(tone, text)), (steps, guard, tone)))
                    }
                    Some(ScriptStep::Content(text)) => {
                        Some((Ok(TokenEvent::content(tone, text)), (steps, guard, tone)))
                    }
                    Some(ScriptStep::Fail(message)) => Some((
                        Err(TritoneError::Upstream {
                            provider: "scripted".to_string(),
                            code: "script".to_string(),
                            message,
                        }),
                        (steps, guard, tone),
                    )),
                    Some(ScriptStep::Stall) => {
                        futures::future::pending::<()>().await;
                        None
                    }
                    None => None,
                }
            },
        );
        Ok(Box::pin(stream))
    }
}
