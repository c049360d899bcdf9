//! LLM transport: the [`LlmClient`] seam, an OpenAI-compatible HTTP
//! implementation with bounded retries, and the scripted stand-in used
//! by tests and the `smoke` command.
//!
//! Completions arrive as a [`CompletionStream`] of text fragments ending
//! in a usage chunk. Dropping the stream closes its channel, which the
//! HTTP worker observes and abandons the request.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use parley_core::config::LlmConfig;
use parley_core::metrics::TokenUsage;

const CHANNEL_CAPACITY: usize = 16;
const SCRIPTED_FRAGMENT_CHARS: usize = 48;
const DETAIL_CHARS: usize = 200;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LlmError {
    #[error("llm transport error: {0}")]
    Transport(String),
    #[error("llm endpoint returned status {status}: {detail}")]
    Upstream { status: u16, detail: String },
    #[error("llm response is missing expected fields: {0}")]
    MalformedResponse(String),
    #[error("llm request failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error("completion stream ended before its final usage chunk")]
    TruncatedStream,
}

/// One prompt sent to the model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletionRequest {
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompletionChunk {
    Fragment(String),
    /// Final chunk; carries the token usage for the whole completion.
    Done(TokenUsage),
}

/// A fully buffered completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

/// Fragments of one model response. Dropping the stream cancels the
/// request feeding it.
pub struct CompletionStream {
    receiver: mpsc::Receiver<Result<CompletionChunk, LlmError>>,
}

impl CompletionStream {
    pub fn new(receiver: mpsc::Receiver<Result<CompletionChunk, LlmError>>) -> Self {
        Self { receiver }
    }

    /// Pre-filled stream delivering `completion` in fragment-sized
    /// chunks followed by the usage chunk.
    pub fn from_completion(completion: Completion) -> Self {
        let chunks = fragment_chunks(&completion.text, SCRIPTED_FRAGMENT_CHARS);
        let (sender, receiver) = mpsc::channel(chunks.len() + 1);
        for chunk in chunks {
            // Capacity covers every chunk, so try_send cannot fail.
            let _ = sender.try_send(Ok(CompletionChunk::Fragment(chunk)));
        }
        let _ = sender.try_send(Ok(CompletionChunk::Done(completion.usage)));
        Self { receiver }
    }

    pub async fn next_chunk(&mut self) -> Option<Result<CompletionChunk, LlmError>> {
        self.receiver.recv().await
    }

    /// Buffers the whole stream into one draft. Validation operates on
    /// the buffered text, never on live fragments.
    pub async fn collect(mut self) -> Result<Completion, LlmError> {
        let mut text = String::new();
        while let Some(chunk) = self.receiver.recv().await {
            match chunk? {
                CompletionChunk::Fragment(fragment) => text.push_str(&fragment),
                CompletionChunk::Done(usage) => return Ok(Completion { text, usage }),
            }
        }
        Err(LlmError::TruncatedStream)
    }
}

/// Model transport seam. Implementations must be safe to share across
/// concurrent turns.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Starts one completion. Setup failures may surface from this
    /// call or as the first stream item; both end the turn the same
    /// way.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionStream, LlmError>;
}

#[async_trait]
impl<T> LlmClient for std::sync::Arc<T>
where
    T: LlmClient + ?Sized,
{
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionStream, LlmError> {
        (**self).complete(request).await
    }
}

/// Bounded retry schedule. Delays double from `base_delay_ms` and cap
/// at `max_delay_ms`.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 2, base_delay_ms: 250, max_delay_ms: 5_000 }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.min(16);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// OpenAI-compatible chat-completions client. Each attempt is one POST;
/// the response body is forwarded as a single fragment plus usage.
#[derive(Clone)]
pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<SecretString>,
    retry: RetryPolicy,
}

impl HttpLlmClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| LlmError::Transport(error.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            retry: RetryPolicy { max_retries: config.max_retries, ..RetryPolicy::default() },
        })
    }

    async fn request_once(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let payload = ChatCompletionPayload {
            model: &request.model,
            messages: vec![
                ChatMessagePayload { role: "system", content: &request.system_prompt },
                ChatMessagePayload { role: "user", content: &request.user_prompt },
            ],
        };

        let mut builder =
            self.http.post(format!("{}/chat/completions", self.base_url)).json(&payload);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key.expose_secret());
        }

        let response =
            builder.send().await.map_err(|error| LlmError::Transport(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LlmError::Upstream {
                status: status.as_u16(),
                detail: truncate_detail(&detail),
            });
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|error| LlmError::MalformedResponse(error.to_string()))?;
        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::MalformedResponse("response carries no choices".to_string()))?;
        let text = choice.message.content;
        let usage = body
            .usage
            .map(|usage| TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            })
            .unwrap_or_else(|| TokenUsage {
                prompt_tokens: approximate_tokens(&request.system_prompt)
                    + approximate_tokens(&request.user_prompt),
                completion_tokens: approximate_tokens(&text),
            });
        Ok(Completion { text, usage })
    }

    async fn complete_with_retries(
        &self,
        request: &CompletionRequest,
        sender: &mpsc::Sender<Result<CompletionChunk, LlmError>>,
    ) -> Result<Completion, LlmError> {
        let mut last_error = LlmError::Transport("no attempts made".to_string());
        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                let delay = self.retry.backoff(attempt - 1);
                warn!(
                    event_name = "agent.llm.retry",
                    attempt,
                    max_retries = self.retry.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "retrying llm request"
                );
                tokio::select! {
                    _ = sender.closed() => {
                        return Err(LlmError::Transport("request cancelled".to_string()));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            tokio::select! {
                _ = sender.closed() => {
                    return Err(LlmError::Transport("request cancelled".to_string()));
                }
                outcome = self.request_once(request) => match outcome {
                    Ok(completion) => return Ok(completion),
                    Err(error) if error_is_retryable(&error) => last_error = error,
                    Err(error) => return Err(error),
                }
            }
        }
        Err(LlmError::RetriesExhausted {
            attempts: self.retry.max_retries + 1,
            last_error: last_error.to_string(),
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionStream, LlmError> {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let worker = self.clone();
        tokio::spawn(async move {
            match worker.complete_with_retries(&request, &sender).await {
                Ok(completion) => {
                    if sender.send(Ok(CompletionChunk::Fragment(completion.text))).await.is_err() {
                        return;
                    }
                    let _ = sender.send(Ok(CompletionChunk::Done(completion.usage))).await;
                }
                Err(error) => {
                    let _ = sender.send(Err(error)).await;
                }
            }
        });
        Ok(CompletionStream::new(receiver))
    }
}

fn error_is_retryable(error: &LlmError) -> bool {
    match error {
        LlmError::Transport(_) => true,
        LlmError::Upstream { status, .. } => *status == 429 || *status >= 500,
        _ => false,
    }
}

#[derive(Serialize)]
struct ChatCompletionPayload<'a> {
    model: &'a str,
    messages: Vec<ChatMessagePayload<'a>>,
}

#[derive(Serialize)]
struct ChatMessagePayload<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

/// Deterministic stand-in for tests and the `smoke` command. Pops one
/// scripted response per call, in order, and keeps every user prompt
/// it was shown.
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<ScriptedCompletion, LlmError>>>,
    prompts: Mutex<Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptedCompletion {
    pub text: String,
    pub usage: TokenUsage,
}

impl ScriptedCompletion {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let usage = TokenUsage { prompt_tokens: 40, completion_tokens: approximate_tokens(&text) };
        Self { text, usage }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

impl ScriptedLlmClient {
    pub fn new(script: Vec<Result<ScriptedCompletion, LlmError>>) -> Self {
        Self { script: Mutex::new(script.into_iter().collect()), prompts: Mutex::new(Vec::new()) }
    }

    /// Shorthand for an all-successful script.
    pub fn answering(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|text| Ok(ScriptedCompletion::new(*text))).collect())
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|script| script.len()).unwrap_or(0)
    }

    /// User prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|prompts| prompts.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionStream, LlmError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(request.user_prompt.clone());
        }
        let next = {
            let mut script = self
                .script
                .lock()
                .map_err(|_| LlmError::Transport("script lock poisoned".to_string()))?;
            script.pop_front()
        };
        match next {
            Some(Ok(completion)) => Ok(CompletionStream::from_completion(Completion {
                text: completion.text,
                usage: completion.usage,
            })),
            Some(Err(error)) => Err(error),
            None => Err(LlmError::Transport(format!(
                "scripted client has no response left for prompt: {}",
                truncate_detail(&request.user_prompt)
            ))),
        }
    }
}

fn fragment_chunks(text: &str, chunk_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0usize;
    for ch in text.chars() {
        current.push(ch);
        count += 1;
        if count == chunk_chars {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Rough count for endpoints that omit usage: four characters per
/// token, minimum one.
fn approximate_tokens(text: &str) -> u32 {
    (text.chars().count() as u32 / 4).max(1)
}

fn truncate_detail(detail: &str) -> String {
    let trimmed = detail.trim();
    if trimmed.chars().count() <= DETAIL_CHARS {
        return trimmed.to_string();
    }
    let mut truncated: String = trimmed.chars().take(DETAIL_CHARS).collect();
    truncated.push_str("...");
    truncated
}
