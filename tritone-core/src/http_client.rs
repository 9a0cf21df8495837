use reqwest::{Client, StatusCode};
use serde::Serialize;

use crate::config::HttpCfg;
use crate::error::{CoreResult, TritoneError};

/// Represents a single Server-Sent-Event line (already split on `\n`).
#[derive(Debug, Clone)]
pub struct SseLine {
    pub line: String,
}

/// A boxed stream of `SseLine` results.
pub type SseStream = std::pin::Pin<
    Box<dyn futures_util::stream::Stream<Item = CoreResult<SseLine>> + Send>,
>;

/// Thin wrapper around reqwest::Client with defaults and helpers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
}

impl HttpClient {
    pub fn new_default() -> CoreResult<Self> {
        Self::from_config(&HttpCfg::default())
    }

    pub fn from_config(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(std::time::Duration::from_millis(cfg.connect_timeout_ms))
            .timeout(std::time::Duration::from_millis(cfg.request_timeout_ms));
        if let Some(cap) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(cap);
        }
        let inner = builder
            .build()
            .map_err(|e| TritoneError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: "tritone/0.1".to_string(),
        })
    }

    /// POST JSON and return an SSE (Server-Sent Events) line stream.
    /// Each yielded item is one raw line (trim not applied) from the SSE
    /// channel. Dropping the returned stream aborts the request.
    pub async fn post_sse_lines<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        provider: &str,
    ) -> CoreResult<SseStream> {
        let mut req = self
            .inner
            .post(url)
            .json(body)
            .header("User-Agent", &self.user_agent)
            .header("Accept", "text/event-stream");

        for (k, v) in headers {
            req = req.header(*k, *v);
        }

        let provider = provider.to_string();
        let resp = req
            .send()
            .await
            .map_err(|_| TritoneError::UpstreamUnavailable {
                provider: provider.clone(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let headers = resp.headers().clone();
            let ra = parse_retry_after(&headers);
            let body = resp.text().await.unwrap_or_default();
            return Err(map_http_error(&provider, status, ra, &body));
        }

        // Stream body as bytes and split on '\n'
        let byte_stream = resp.bytes_stream();
        let line_stream = LineStream::new(Box::pin(byte_stream), provider);
        Ok(Box::pin(line_stream))
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    if let Some(v) = headers.get("retry-after")
        && let Ok(s) = v.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        return Some(secs);
    }
    None
}

pub(crate) fn map_http_error(
    provider: &str,
    status: StatusCode,
    retry_after: Option<u64>,
    body: &str,
) -> TritoneError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => TritoneError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        s if s.is_server_error() => TritoneError::UpstreamUnavailable {
            provider: provider.to_string(),
        },
        s => TritoneError::Upstream {
            provider: provider.to_string(),
            code: s.as_u16().to_string(),
            message: truncate(body, 300),
        },
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    // Error bodies are arbitrary text; the cut must land on a char boundary.
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut t = s[..end].to_string();
    t.push_str("...");
    t
}

/// Internal line splitter over a bytes stream; yields `SseLine`s separated
/// by '\n'. The tail is flushed as a final line on EOF so a stream that ends
/// without a newline still delivers its last event.
struct LineStream {
    inner: std::pin::Pin<
        Box<dyn futures_util::stream::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>,
    >,
    provider: String,
    buf: String,
    flushed_tail: bool,
}

impl LineStream {
    fn new(
        inner: std::pin::Pin<
            Box<
                dyn futures_util::stream::Stream<Item = Result<bytes::Bytes, reqwest::Error>>
                    + Send,
            >,
        >,
        provider: String,
    ) -> Self {
        Self {
            inner,
            provider,
            buf: String::new(),
            flushed_tail: false,
        }
    }
}

impl futures_util::stream::Stream for LineStream {
    type Item = CoreResult<SseLine>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;
        loop {
            // If we already have a newline in the buffer, split and yield immediately.
            if let Some(idx) = self.buf.find('\n') {
                let mut line = self.buf.drain(..=idx).collect::<String>();
                if line.ends_with('\n') {
                    if line.ends_with("\r\n") {
                        line.truncate(line.len() - 2);
                    } else {
                        line.truncate(line.len() - 1);
                    }
                }
                return Poll::Ready(Some(Ok(SseLine { line })));
            }

            // Otherwise, poll the inner stream for more bytes
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let s = String::from_utf8_lossy(&chunk);
                    self.buf.push_str(&s);
                    continue;
                }
                Poll::Ready(Some(Err(_e))) => {
                    let provider = self.provider.clone();
                    return Poll::Ready(Some(Err(TritoneError::UpstreamUnavailable {
                        provider,
                    })));
                }
                Poll::Ready(None) => {
                    if !self.flushed_tail && !self.buf.is_empty() {
                        self.flushed_tail = true;
                        let line = std::mem::take(&mut self.buf);
                        return Poll::Ready(Some(Ok(SseLine { line })));
                    } else {
                        return Poll::Ready(None);
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
