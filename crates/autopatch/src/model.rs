//! Language-model backend.
//!
//! The workflow only needs `messages in, text out`. [`ModelBackend`] is that
//! seam; [`OpenAiCompatibleBackend`] talks to any `/chat/completions` server
//! (llama.cpp, vLLM, OpenAI, proxies) and streams tokens over SSE.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

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

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Model API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Model returned an empty response")]
    EmptyResponse,

    #[error("Stream interrupted: {0}")]
    Stream(String),
}

/// Finite, non-restartable stream of text chunks.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ModelError>> + Send>>;

#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String, ModelError>;

    /// Stream the reply. Backends without streaming yield the whole reply as
    /// a single chunk.
    async fn chat_stream(&self, messages: &[ChatMessage]) -> Result<TextStream, ModelError> {
        let text = self.chat(messages).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(text) })))
    }
}

/// Concatenate every chunk of a stream, failing on the first error.
pub async fn collect_text(mut stream: TextStream) -> Result<String, ModelError> {
    let mut out = String::new();
    while let Some(chunk) = stream.next().await {
        out.push_str(&chunk?);
    }
    Ok(out)
}

// ── OpenAI-compatible HTTP backend ─────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

pub struct OpenAiCompatibleBackend {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiCompatibleBackend {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ModelError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ModelError::Http(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            max_tokens: 4096,
            temperature: 0.2,
        })
    }

    pub fn with_sampling(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn send(&self, messages: &[ChatMessage], stream: bool) -> Result<reqwest::Response, ModelError> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream,
        };
        let mut builder = self.http.post(self.endpoint()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ModelError::Http(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api { status, body });
        }
        Ok(response)
    }
}

#[async_trait]
impl ModelBackend for OpenAiCompatibleBackend {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String, ModelError> {
        let response = self.send(messages, false).await?;
        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Parse(e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(ModelError::EmptyResponse)?;
        debug!(model = %self.model, chars = content.len(), "Model reply received");
        Ok(content)
    }

    async fn chat_stream(&self, messages: &[ChatMessage]) -> Result<TextStream, ModelError> {
        let response = self.send(messages, true).await?;
        let bytes = response.bytes_stream().map(|r| r.map(|b| b.to_vec()));
        Ok(sse_text_stream(bytes))
    }
}

/// One parsed server-sent event from a streaming completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Delta(String),
    Done,
}

/// Consume every complete line in `buffer`, returning the text deltas found.
///
/// Incomplete trailing data stays in the buffer for the next network chunk.
/// Lines are split on raw bytes so a multi-byte character spanning two
/// chunks is decoded intact.
pub fn drain_sse_events(buffer: &mut Vec<u8>) -> Result<Vec<SseEvent>, ModelError> {
    let mut events = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line);
        let line = line.trim();

        let Some(data) = line.strip_prefix("data:") else {
            // Comments (`:`), `event:` and `id:` fields carry no text.
            continue;
        };
        let data = data.trim();
        if data == "[DONE]" {
            events.push(SseEvent::Done);
            buffer.clear();
            break;
        }
        if data.is_empty() {
            continue;
        }
        let chunk: StreamChunk =
            serde_json::from_str(data).map_err(|e| ModelError::Parse(format!("{e}: {data}")))?;
        for choice in chunk.choices {
            if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                events.push(SseEvent::Delta(text));
            }
        }
    }
    Ok(events)
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send>>;

struct SseState {
    bytes: ByteStream,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    done: bool,
}

impl SseState {
    fn absorb(&mut self) -> Result<(), ModelError> {
        for event in drain_sse_events(&mut self.buffer)? {
            match event {
                SseEvent::Delta(text) => self.pending.push_back(text),
                SseEvent::Done => self.done = true,
            }
        }
        Ok(())
    }
}

fn sse_text_stream(
    bytes: impl Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send + 'static,
) -> TextStream {
    let state = SseState {
        bytes: Box::pin(bytes),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        done: false,
    };

    let stream = futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(text) = st.pending.pop_front() {
                return Some((Ok(text), st));
            }
            if st.done {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    st.buffer.extend_from_slice(&chunk);
                    if let Err(e) = st.absorb() {
                        st.done = true;
                        st.pending.clear();
                        return Some((Err(e), st));
                    }
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(ModelError::Stream(e.to_string())), st));
                }
                None => {
                    st.done = true;
                    if !st.buffer.is_empty() {
                        st.buffer.push(b'\n');
                        if let Err(e) = st.absorb() {
                            st.pending.clear();
                            return Some((Err(e), st));
                        }
                    }
                }
            }
        }
    });
    Box::pin(stream)
}
