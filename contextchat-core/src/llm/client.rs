//! Backend trait and provider implementations.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::error::{Error, Result};

use super::sse::{text_stream, SseEvent};
use super::types::{
    BackendKind, ChatMessage, ChatRole, ChunkStream, CompletionRequest, CompletionResponse,
    StopReason, TokenUsage,
};

/// Conversation capability shared by every backend.
///
/// Backends are stateless: each call carries the full transcript.
#[async_trait]
pub trait ConversationBackend: Send + Sync {
    /// Which provider this backend talks to.
    fn kind(&self) -> BackendKind;

    /// Complete a request and return the whole reply.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Start a streamed reply. Resolves once the provider accepted the
    /// request; the returned stream yields text deltas.
    async fn stream(&self, request: CompletionRequest) -> Result<ChunkStream>;
}

/// Configuration for provider clients.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API key
    pub api_key: String,
    /// Base URL override
    pub base_url: Option<String>,
    /// Default model
    pub default_model: Option<String>,
    /// Timeout for non-streaming requests in seconds
    pub timeout_secs: u64,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
}

impl ClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: None,
            default_model: None,
            timeout_secs: 120,
            connect_timeout_secs: 10,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    fn model_for(&self, request: &CompletionRequest, kind: BackendKind) -> String {
        request
            .model
            .clone()
            .or_else(|| self.default_model.clone())
            .unwrap_or_else(|| kind.default_model().to_string())
    }
}

// Streams can legitimately outlive any whole-request timeout, so the client
// only bounds connecting; non-streaming requests set their own timeout.
fn build_http_client(connect_timeout_secs: u64) -> Result<Client> {
    let connect_timeout = Duration::from_secs(connect_timeout_secs);

    // Some sandboxed macOS environments can panic during proxy auto-detection
    // in reqwest's default client builder. Fall back to no-proxy in that case.
    match catch_unwind(AssertUnwindSafe(|| {
        Client::builder().connect_timeout(connect_timeout).build()
    })) {
        Ok(Ok(client)) => Ok(client),
        Ok(Err(_)) | Err(_) => Client::builder()
            .no_proxy()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}"))),
    }
}

/// Build the client for `kind`.
pub fn build_backend(
    kind: BackendKind,
    config: ClientConfig,
) -> Result<Arc<dyn ConversationBackend>> {
    Ok(match kind {
        BackendKind::Anthropic => Arc::new(AnthropicClient::new(config)?),
        BackendKind::OpenAI => Arc::new(OpenAIClient::new(config)?),
        BackendKind::Google => Arc::new(GoogleClient::new(config)?),
    })
}

/// Pick the highest-priority configured provider.
///
/// Returns `Ok(None)` when no provider has credentials.
pub fn select_backend(
    config: &BackendConfig,
    timeout_secs: u64,
) -> Result<Option<Arc<dyn ConversationBackend>>> {
    match config.preferred() {
        Some((kind, credentials)) => {
            info!(backend = %kind, "Selected LLM backend");
            build_backend(kind, credentials.client_config(timeout_secs)).map(Some)
        }
        None => {
            warn!("No LLM provider credentials found");
            Ok(None)
        }
    }
}

/// Send a request and turn non-success statuses into provider errors.
async fn send_checked<F>(
    kind: BackendKind,
    builder: RequestBuilder,
    describe_error: F,
) -> Result<Response>
where
    F: Fn(&str) -> Option<String>,
{
    let response = builder
        .send()
        .await
        .map_err(|e| Error::llm_api(kind, format!("HTTP request failed: {e}")))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .map_err(|e| Error::llm_api(kind, format!("Failed to read response: {e}")))?;
    let message = describe_error(&body).unwrap_or_else(|| format!("{status}: {body}"));
    Err(Error::llm_api(kind, message))
}

async fn read_json<T: for<'de> Deserialize<'de>>(
    kind: BackendKind,
    response: Response,
) -> Result<T> {
    let body = response
        .text()
        .await
        .map_err(|e| Error::llm_api(kind, format!("Failed to read response: {e}")))?;
    serde_json::from_str(&body)
        .map_err(|e| Error::llm_api(kind, format!("Failed to parse response: {e}")))
}

// ============================================================================
// Anthropic
// ============================================================================

/// Anthropic Claude client.
pub struct AnthropicClient {
    config: ClientConfig,
    http: Client,
}

impl AnthropicClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";
    const DEFAULT_MAX_TOKENS: u32 = 4096;

    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = build_http_client(config.connect_timeout_secs)?;
        Ok(Self { config, http })
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }

    fn request(&self, request: CompletionRequest, stream: bool) -> RequestBuilder {
        let api_request = AnthropicRequest {
            model: self.config.model_for(&request, BackendKind::Anthropic),
            messages: request
                .messages
                .iter()
                .map(|m| AnthropicMessage {
                    role: m.role.to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            max_tokens: request.max_tokens.unwrap_or(Self::DEFAULT_MAX_TOKENS),
            system: request.system,
            stream,
        };

        self.http
            .post(format!("{}/v1/messages", self.base_url()))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", Self::API_VERSION)
            .header("content-type", "application/json")
            .json(&api_request)
    }
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    model: String,
    content: Vec<AnthropicContent>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    ContentBlockDelta { delta: AnthropicDelta },
    MessageStop,
    Error { error: AnthropicErrorDetail },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicDelta {
    #[serde(default)]
    text: Option<String>,
}

fn describe_anthropic_error(body: &str) -> Option<String> {
    serde_json::from_str::<AnthropicError>(body)
        .ok()
        .map(|e| format!("{}: {}", e.error.error_type, e.error.message))
}

pub(crate) fn parse_anthropic_event(payload: &str) -> Result<SseEvent> {
    let event: AnthropicStreamEvent = serde_json::from_str(payload)?;
    Ok(match event {
        AnthropicStreamEvent::ContentBlockDelta { delta } => match delta.text {
            Some(text) => SseEvent::Text(text),
            None => SseEvent::Ignore,
        },
        AnthropicStreamEvent::MessageStop => SseEvent::Done,
        AnthropicStreamEvent::Error { error } => {
            return Err(Error::llm_api(
                BackendKind::Anthropic,
                format!("{}: {}", error.error_type, error.message),
            ))
        }
        AnthropicStreamEvent::Other => SseEvent::Ignore,
    })
}

#[async_trait]
impl ConversationBackend for AnthropicClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Anthropic
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let builder = self
            .request(request, false)
            .timeout(Duration::from_secs(self.config.timeout_secs));
        let response = send_checked(self.kind(), builder, describe_anthropic_error).await?;
        let api_response: AnthropicResponse = read_json(self.kind(), response).await?;

        let content = api_response
            .content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("");

        let stop_reason = api_response.stop_reason.as_deref().map(|r| match r {
            "max_tokens" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            _ => StopReason::EndTurn,
        });

        Ok(CompletionResponse {
            model: api_response.model,
            content,
            stop_reason,
            usage: TokenUsage {
                input_tokens: api_response.usage.input_tokens,
                output_tokens: api_response.usage.output_tokens,
            },
        })
    }

    async fn stream(&self, request: CompletionRequest) -> Result<ChunkStream> {
        let response =
            send_checked(self.kind(), self.request(request, true), describe_anthropic_error)
                .await?;
        debug!(backend = %self.kind(), "Stream accepted");
        Ok(text_stream(response.bytes_stream(), parse_anthropic_event))
    }
}

// ============================================================================
// OpenAI
// ============================================================================

/// OpenAI client.
pub struct OpenAIClient {
    config: ClientConfig,
    http: Client,
}

impl OpenAIClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.openai.com";

    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = build_http_client(config.connect_timeout_secs)?;
        Ok(Self { config, http })
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }

    fn request(&self, request: CompletionRequest, stream: bool) -> RequestBuilder {
        let mut messages: Vec<OpenAIMessage> = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(OpenAIMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.extend(request.messages.iter().map(|m| OpenAIMessage {
            role: m.role.to_string(),
            content: m.content.clone(),
        }));

        let api_request = OpenAIRequest {
            model: self.config.model_for(&request, BackendKind::OpenAI),
            messages,
            max_tokens: request.max_tokens,
            stream,
        };

        self.http
            .post(format!("{}/v1/chat/completions", self.base_url()))
            .bearer_auth(&self.config.api_key)
            .header("content-type", "application/json")
            .json(&api_request)
    }
}

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    model: String,
    choices: Vec<OpenAIChoice>,
    usage: OpenAIUsage,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    error: OpenAIErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorDetail {
    message: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    error: Option<OpenAIErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: OpenAIDelta,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAIDelta {
    #[serde(default)]
    content: Option<String>,
}

fn describe_openai_error(body: &str) -> Option<String> {
    serde_json::from_str::<OpenAIError>(body)
        .ok()
        .map(|e| e.error.message)
}

pub(crate) fn parse_openai_event(payload: &str) -> Result<SseEvent> {
    if payload.trim() == "[DONE]" {
        return Ok(SseEvent::Done);
    }
    let chunk: OpenAIStreamChunk = serde_json::from_str(payload)?;
    if let Some(error) = chunk.error {
        return Err(Error::llm_api(BackendKind::OpenAI, error.message));
    }
    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect();
    Ok(if text.is_empty() {
        SseEvent::Ignore
    } else {
        SseEvent::Text(text)
    })
}

#[async_trait]
impl ConversationBackend for OpenAIClient {
    fn kind(&self) -> BackendKind {
        BackendKind::OpenAI
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let builder = self
            .request(request, false)
            .timeout(Duration::from_secs(self.config.timeout_secs));
        let response = send_checked(self.kind(), builder, describe_openai_error).await?;
        let api_response: OpenAIResponse = read_json(self.kind(), response).await?;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::llm_api(self.kind(), "No choices in response"))?;

        let stop_reason = choice.finish_reason.as_deref().map(|r| match r {
            "length" => StopReason::MaxTokens,
            "stop" => StopReason::EndTurn,
            _ => StopReason::EndTurn,
        });

        Ok(CompletionResponse {
            model: api_response.model,
            content: choice.message.content,
            stop_reason,
            usage: TokenUsage {
                input_tokens: api_response.usage.prompt_tokens,
                output_tokens: api_response.usage.completion_tokens,
            },
        })
    }

    async fn stream(&self, request: CompletionRequest) -> Result<ChunkStream> {
        let response =
            send_checked(self.kind(), self.request(request, true), describe_openai_error).await?;
        debug!(backend = %self.kind(), "Stream accepted");
        Ok(text_stream(response.bytes_stream(), parse_openai_event))
    }
}

// ============================================================================
// Google Gemini
// ============================================================================

/// Google Gemini client.
pub struct GoogleClient {
    config: ClientConfig,
    http: Client,
}

impl GoogleClient {
    const DEFAULT_BASE_URL: &'static str = "https://generativelanguage.googleapis.com";

    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = build_http_client(config.connect_timeout_secs)?;
        Ok(Self { config, http })
    }

    fn base_url(&self) -> &str {
        self.config
            .base_url
            .as_deref()
            .unwrap_or(Self::DEFAULT_BASE_URL)
    }

    fn request(&self, request: CompletionRequest, stream: bool) -> RequestBuilder {
        let model = self.config.model_for(&request, BackendKind::Google);

        let contents: Vec<GeminiContent> = request
            .messages
            .iter()
            .map(|m| GeminiContent {
                role: Some(
                    match m.role {
                        ChatRole::User => "user",
                        ChatRole::Assistant => "model",
                    }
                    .to_string(),
                ),
                parts: vec![GeminiPart {
                    text: Some(m.content.clone()),
                }],
            })
            .collect();

        // System instruction (Gemini's equivalent of system prompt)
        let system_instruction = request.system.map(|s| GeminiContent {
            role: None,
            parts: vec![GeminiPart { text: Some(s) }],
        });

        let api_request = GeminiRequest {
            contents,
            system_instruction,
            generation_config: Some(GeminiGenerationConfig {
                max_output_tokens: request.max_tokens,
            }),
        };

        let url = if stream {
            format!(
                "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
                self.base_url(),
                model
            )
        } else {
            format!("{}/v1beta/models/{}:generateContent", self.base_url(), model)
        };

        self.http
            .post(url)
            .header("x-goog-api-key", &self.config.api_key)
            .header("content-type", "application/json")
            .json(&api_request)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsageMetadata>,
}

impl GeminiResponse {
    fn text(&self) -> String {
        self.candidates
            .first()
            .map(|c| {
                c.content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: GeminiContent,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetail {
    message: String,
}

fn describe_gemini_error(body: &str) -> Option<String> {
    serde_json::from_str::<GeminiError>(body)
        .ok()
        .map(|e| e.error.message)
}

pub(crate) fn parse_gemini_event(payload: &str) -> Result<SseEvent> {
    if let Ok(error) = serde_json::from_str::<GeminiError>(payload) {
        return Err(Error::llm_api(BackendKind::Google, error.error.message));
    }
    let response: GeminiResponse = serde_json::from_str(payload)?;
    let text = response.text();
    Ok(if text.is_empty() {
        SseEvent::Ignore
    } else {
        SseEvent::Text(text)
    })
}

#[async_trait]
impl ConversationBackend for GoogleClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Google
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let model = self.config.model_for(&request, self.kind());
        let builder = self
            .request(request, false)
            .timeout(Duration::from_secs(self.config.timeout_secs));
        let response = send_checked(self.kind(), builder, describe_gemini_error).await?;
        let api_response: GeminiResponse = read_json(self.kind(), response).await?;

        let candidate = api_response
            .candidates
            .first()
            .ok_or_else(|| Error::llm_api(self.kind(), "No candidates in response"))?;

        let stop_reason = candidate.finish_reason.as_deref().map(|r| match r {
            "MAX_TOKENS" => StopReason::MaxTokens,
            "STOP_SEQUENCE" => StopReason::StopSequence,
            _ => StopReason::EndTurn,
        });

        let usage = api_response
            .usage_metadata
            .as_ref()
            .map(|u| TokenUsage {
                input_tokens: u.prompt_token_count,
                output_tokens: u.candidates_token_count,
            })
            .unwrap_or_default();

        Ok(CompletionResponse {
            model,
            content: api_response.text(),
            stop_reason,
            usage,
        })
    }

    async fn stream(&self, request: CompletionRequest) -> Result<ChunkStream> {
        let response =
            send_checked(self.kind(), self.request(request, true), describe_gemini_error).await?;
        debug!(backend = %self.kind(), "Stream accepted");
        Ok(text_stream(response.bytes_stream(), parse_gemini_event))
    }
}

/// Convenience for building a one-message request against a transcript.
pub(crate) fn transcript_request(
    system: &str,
    transcript: &[ChatMessage],
    next: ChatMessage,
    max_tokens: u32,
) -> CompletionRequest {
    let mut messages = transcript.to_vec();
    messages.push(next);
    CompletionRequest::new()
        .with_system(system)
        .with_messages(messages)
        .with_max_tokens(max_tokens)
}
