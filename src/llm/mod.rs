//! Client for OpenAI-compatible chat completion endpoints.
//!
//! Two request modes share one request shape:
//! - [`LlmClient::complete`] reads the whole response and extracts the text
//! - [`LlmClient::stream`] returns a [`DeltaSource`] that yields content
//!   fragments as lines arrive
//!
//! Nothing here retries. A failed attempt is returned to the caller as-is.

pub mod extract;
pub mod stream;

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::LlmSettings;
use extract::{first_choice, COMPLETION_RULES};
use stream::{LineEvent, StreamDecoder};

/// Maximum number of body characters kept in a status error.
const ERROR_BODY_LIMIT: usize = 200;

/// Errors raised by the transport.
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to create HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Transport timeouts, tuned for slow model decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub write: Duration,
    pub read: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(300),
            write: Duration::from_secs(300),
            read: Duration::from_secs(600),
        }
    }
}

/// Pull-based source of content deltas for one streamed completion.
#[async_trait]
pub trait DeltaSource: Send {
    /// The next non-empty delta, or `None` once the stream has ended.
    async fn next_delta(&mut self) -> Result<Option<String>, LlmError>;
}

/// The two request modes the analysis pipeline needs.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Fetch one full, non-streamed completion.
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;

    /// Start a streamed completion.
    async fn stream(&self, prompt: &str) -> Result<Box<dyn DeltaSource>, LlmError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

/// Build the JSON request body for `prompt`.
pub fn request_body(model: &str, prompt: &str, stream: bool) -> serde_json::Result<String> {
    serde_json::to_string(&ChatRequest {
        model,
        messages: [ChatMessage {
            role: "user",
            content: prompt,
        }],
        stream,
    })
}

/// Extract the completion text from a full response body.
///
/// Falls back to the raw body when it is not JSON or carries no recognised
/// content field.
pub fn completion_text(body: &str) -> String {
    let parsed: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "response body is not JSON, returning it raw");
            return body.to_string();
        }
    };

    let text = first_choice(&parsed).and_then(|choice| {
        let rule = COMPLETION_RULES.iter().find(|r| r.matches(choice))?;
        rule.text(choice)
    });

    match text {
        Some(t) => t.to_string(),
        None => {
            debug!("no content field in response, returning raw body");
            body.to_string()
        }
    }
}

/// HTTP client bound to one endpoint configuration.
pub struct LlmClient {
    http: reqwest::Client,
    settings: LlmSettings,
    timeouts: Timeouts,
}

impl LlmClient {
    /// Create a client with the default timeouts.
    pub fn new(settings: LlmSettings) -> Result<Self, LlmError> {
        Self::with_timeouts(settings, Timeouts::default())
    }

    pub fn with_timeouts(settings: LlmSettings, timeouts: Timeouts) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("projlens/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(timeouts.connect)
            .build()
            .map_err(LlmError::Client)?;

        info!(url = %settings.api_url, model = %settings.model, "initialized LLM client");

        Ok(Self {
            http,
            settings,
            timeouts,
        })
    }

    pub fn settings(&self) -> &LlmSettings {
        &self.settings
    }

    /// Send the request and wait for the response headers.
    async fn post(&self, prompt: &str, stream: bool) -> Result<reqwest::Response, LlmError> {
        let body = request_body(&self.settings.model, prompt, stream)?;

        debug!(
            url = %self.settings.api_url,
            stream,
            prompt_chars = prompt.chars().count(),
            "sending completion request"
        );

        // Non-streamed responses only send headers once generation is done,
        // so the wait covers both the upload and the read window.
        let budget = self.timeouts.write + self.timeouts.read;
        let request = self
            .http
            .post(&self.settings.api_url)
            .bearer_auth(&self.settings.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send();

        let response = tokio::time::timeout(budget, request)
            .await
            .map_err(|_| LlmError::Timeout(budget))??;

        let status = response.status();
        if !status.is_success() {
            let text = tokio::time::timeout(self.timeouts.read, response.text())
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default();
            warn!(status = status.as_u16(), "completion request failed");
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: truncate_chars(&text, ERROR_BODY_LIMIT),
            });
        }

        Ok(response)
    }

    /// Fetch one full completion and extract its text.
    pub async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let response = self.post(prompt, false).await?;
        let body = tokio::time::timeout(self.timeouts.read, response.text())
            .await
            .map_err(|_| LlmError::Timeout(self.timeouts.read))??;

        debug!(body_chars = body.chars().count(), "received completion response");
        Ok(completion_text(&body))
    }

    /// Start a streamed completion.
    pub async fn stream(&self, prompt: &str) -> Result<SseDeltaStream, LlmError> {
        let response = self.post(prompt, true).await?;
        Ok(SseDeltaStream::new(response, self.timeouts.read))
    }
}

#[async_trait]
impl CompletionBackend for LlmClient {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        LlmClient::complete(self, prompt).await
    }

    async fn stream(&self, prompt: &str) -> Result<Box<dyn DeltaSource>, LlmError> {
        let source = LlmClient::stream(self, prompt).await?;
        Ok(Box::new(source))
    }
}

fn truncate_chars(s: &str, limit: usize) -> String {
    match s.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

/// Splits a byte stream into lines without decoding partial lines.
///
/// Only the current incomplete line is held; a multi-byte character split
/// across chunks is reassembled before decoding.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// The next complete line, without its terminator (`\n` or `\r\n`).
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Whatever is left after the input ended, as a final line.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Streamed completion read from an HTTP response body.
pub struct SseDeltaStream {
    response: reqwest::Response,
    decoder: StreamDecoder,
    lines: LineBuffer,
    eof: bool,
    read_timeout: Duration,
}

impl SseDeltaStream {
    fn new(response: reqwest::Response, read_timeout: Duration) -> Self {
        Self {
            response,
            decoder: StreamDecoder::new(),
            lines: LineBuffer::default(),
            eof: false,
            read_timeout,
        }
    }

    async fn next_line(&mut self) -> Result<Option<String>, LlmError> {
        loop {
            if let Some(line) = self.lines.next_line() {
                return Ok(Some(line));
            }
            if self.eof {
                return Ok(self.lines.finish());
            }

            let chunk = tokio::time::timeout(self.read_timeout, self.response.chunk())
                .await
                .map_err(|_| LlmError::Timeout(self.read_timeout))??;

            match chunk {
                Some(bytes) => self.lines.push(&bytes),
                None => self.eof = true,
            }
        }
    }
}

#[async_trait]
impl DeltaSource for SseDeltaStream {
    async fn next_delta(&mut self) -> Result<Option<String>, LlmError> {
        while !self.decoder.is_finished() {
            let Some(line) = self.next_line().await? else {
                break;
            };
            match self.decoder.decode_line(&line) {
                LineEvent::Delta(delta) => return Ok(Some(delta)),
                LineEvent::Skip => {}
                LineEvent::Done => break,
            }
        }

        debug!(
            deltas = self.decoder.delta_count(),
            malformed = self.decoder.malformed_count(),
            "stream finished"
        );
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let body = request_body("m", "say \"hi\"\\\nbye", true).unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["model"], "m");
        assert_eq!(value["stream"], true);
        assert_eq!(value["messages"][0]["role"], "user");
        assert_eq!(value["messages"][0]["content"], "say \"hi\"\\\nbye");
        assert!(body.contains(r#"say \"hi\"\\\nbye"#));
    }

    #[test]
    fn test_completion_text_message() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"answer"}}]}"#;
        assert_eq!(completion_text(body), "answer");
    }

    #[test]
    fn test_completion_text_legacy_text() {
        let body = r#"{"choices":[{"text":"legacy answer"}]}"#;
        assert_eq!(completion_text(body), "legacy answer");
    }

    #[test]
    fn test_completion_text_falls_back_to_raw() {
        assert_eq!(completion_text("plain words"), "plain words");
        let no_choices = r#"{"error":"overloaded"}"#;
        assert_eq!(completion_text(no_choices), no_choices);
        let null_content = r#"{"choices":[{"message":{"content":null}}]}"#;
        assert_eq!(completion_text(null_content), null_content);
    }

    #[test]
    fn test_completion_text_empty_content() {
        let body = r#"{"choices":[{"message":{"content":""}}]}"#;
        assert_eq!(completion_text(body), "");
    }

    #[test]
    fn test_line_buffer_split_across_chunks() {
        let mut buf = LineBuffer::default();
        buf.push(b"data: one\r\nda");
        assert_eq!(buf.next_line().as_deref(), Some("data: one"));
        assert_eq!(buf.next_line(), None);
        buf.push(b"ta: two\n\n");
        assert_eq!(buf.next_line().as_deref(), Some("data: two"));
        assert_eq!(buf.next_line().as_deref(), Some(""));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn test_line_buffer_multibyte_split() {
        let text = "data: 项目\n".as_bytes();
        let mut buf = LineBuffer::default();
        buf.push(&text[..7]);
        assert_eq!(buf.next_line(), None);
        buf.push(&text[7..]);
        assert_eq!(buf.next_line().as_deref(), Some("data: 项目"));
    }

    #[test]
    fn test_line_buffer_unterminated_tail() {
        let mut buf = LineBuffer::default();
        buf.push(b"data: [DONE]");
        assert_eq!(buf.next_line(), None);
        assert_eq!(buf.finish().as_deref(), Some("data: [DONE]"));
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("abcdef", 3), "abc...");
    }

    #[test]
    fn test_default_timeouts() {
        let t = Timeouts::default();
        assert_eq!(t.connect, Duration::from_secs(300));
        assert_eq!(t.write, Duration::from_secs(300));
        assert_eq!(t.read, Duration::from_secs(600));
    }
}
