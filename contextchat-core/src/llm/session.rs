//! Conversation lifecycle bound to a content generation.
//!
//! A [`ConversationHandle`] is created by seeding a backend with the
//! selected content's text. The seed exchange is kept in the handle's
//! transcript so later turns see the context, but it never reaches the
//! visible chat log. Streams started from a handle end silently as soon as
//! the session moves to a newer generation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::session::Generation;

use super::client::{transcript_request, ConversationBackend};
use super::types::{BackendKind, ChatMessage, ChunkStream, CompletionRequest, StopReason};

/// Instructions sent as the system prompt of every conversation.
pub const SYSTEM_PROMPT: &str = "You are a helpful assistant answering questions about a \
single published document. The document is given inside <context> tags in the first \
message. Answer only from that document, and say so plainly when it does not contain \
the answer.";

/// Fixed instruction turn that asks for the initial summary.
pub const SUMMARY_INSTRUCTION: &str = "Summarize the document in the context above. Start \
with a \"### Summary\" heading followed by a few concise points.";

/// Shown instead of a summary when none could be produced.
pub const SUMMARY_FALLBACK: &str = "Content loaded. Please ask me questions about it!";

const TRUNCATION_MARKER: &str = "\n[truncated]";

/// Wrap context text in delimiters, truncating to `max_chars` characters.
pub fn wrap_context(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("<context>\n{}{}\n</context>", &text[..cut], TRUNCATION_MARKER),
        None => format!("<context>\n{text}\n</context>"),
    }
}

/// Limits for conversation calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Context characters sent before truncation
    pub max_context_chars: usize,
    /// Timeout for reset, summary and stream start in milliseconds
    pub request_timeout_ms: u64,
    /// Longest gap between streamed chunks in milliseconds
    pub stream_idle_timeout_ms: u64,
    /// Maximum tokens per reply
    pub max_tokens: u32,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_context_chars: 100_000,
            request_timeout_ms: 120_000,
            stream_idle_timeout_ms: 60_000,
            max_tokens: 4096,
        }
    }
}

impl ConversationConfig {
    pub fn with_max_context_chars(mut self, chars: usize) -> Self {
        self.max_context_chars = chars;
        self
    }

    pub fn with_request_timeout(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }

    pub fn with_stream_idle_timeout(mut self, timeout_ms: u64) -> Self {
        self.stream_idle_timeout_ms = timeout_ms;
        self
    }
}

/// A seeded conversation bound to one generation.
#[derive(Debug, Clone)]
pub struct ConversationHandle {
    id: Uuid,
    backend: BackendKind,
    bound_generation: Generation,
    transcript: Vec<ChatMessage>,
}

impl ConversationHandle {
    pub(crate) fn new(backend: BackendKind, bound_generation: Generation) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend,
            bound_generation,
            transcript: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend
    }

    pub fn bound_generation(&self) -> Generation {
        self.bound_generation
    }

    /// Every turn sent so far, seed included.
    pub fn transcript(&self) -> &[ChatMessage] {
        &self.transcript
    }

    fn request_with(&self, next: ChatMessage, max_tokens: u32) -> CompletionRequest {
        transcript_request(SYSTEM_PROMPT, &self.transcript, next, max_tokens)
    }

    /// Append a completed user/assistant pair.
    pub fn record_exchange(&mut self, user: impl Into<String>, assistant: impl Into<String>) {
        self.transcript.push(ChatMessage::user(user));
        self.transcript.push(ChatMessage::assistant(assistant));
    }
}

/// Backend access plus a view of the session's current generation.
///
/// Cheap to clone; spawned tasks each take their own copy.
#[derive(Clone)]
pub struct ConversationClient {
    backend: Option<Arc<dyn ConversationBackend>>,
    generations: watch::Receiver<Generation>,
    config: ConversationConfig,
}

impl std::fmt::Debug for ConversationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationClient")
            .field("backend", &self.backend_kind())
            .field("config", &self.config)
            .finish()
    }
}

impl ConversationClient {
    pub fn new(
        backend: Option<Arc<dyn ConversationBackend>>,
        generations: watch::Receiver<Generation>,
        config: ConversationConfig,
    ) -> Self {
        Self {
            backend,
            generations,
            config,
        }
    }

    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.backend.as_ref().map(|b| b.kind())
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.config
    }

    /// The generation the session is currently on.
    pub fn current_generation(&self) -> Generation {
        *self.generations.borrow()
    }

    /// Whether `generation` is still the session's current generation.
    pub fn is_live(&self, generation: Generation) -> bool {
        self.current_generation() == generation
    }

    async fn within_request_timeout<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout_ms = self.config.request_timeout_ms;
        tokio::time::timeout(Duration::from_millis(timeout_ms), fut)
            .await
            .map_err(|_| Error::timeout(timeout_ms))?
    }

    /// Start a conversation seeded with `context_text`.
    ///
    /// The seed reply is kept in the transcript only.
    #[instrument(
        skip(self, generation, context_text),
        fields(generation = %generation, context_len = context_text.len())
    )]
    pub async fn reset_context(
        &self,
        generation: Generation,
        context_text: &str,
    ) -> Result<ConversationHandle> {
        let backend = self.backend.as_ref().ok_or(Error::NoBackend)?;
        let mut handle = ConversationHandle::new(backend.kind(), generation);

        let seed = wrap_context(context_text, self.config.max_context_chars);
        let request = handle.request_with(ChatMessage::user(seed.clone()), self.config.max_tokens);
        let response = self
            .within_request_timeout(backend.complete(request))
            .await
            .map_err(|e| Error::BackendUnavailable(format!("context reset failed: {e}")))?;

        info!(
            handle_id = %handle.id,
            backend = %handle.backend,
            model = %response.model,
            input_tokens = response.usage.input_tokens,
            "Conversation seeded"
        );
        handle.record_exchange(seed, response.content);
        Ok(handle)
    }

    /// Ask for the initial summary. Never fails: any error yields
    /// [`SUMMARY_FALLBACK`].
    #[instrument(skip(self, handle), fields(handle_id = %handle.id))]
    pub async fn request_summary(&self, handle: &mut ConversationHandle) -> String {
        let Some(backend) = &self.backend else {
            return SUMMARY_FALLBACK.to_string();
        };

        let request =
            handle.request_with(ChatMessage::user(SUMMARY_INSTRUCTION), self.config.max_tokens);
        match self.within_request_timeout(backend.complete(request)).await {
            Ok(response) if !response.content.trim().is_empty() => {
                if response.stop_reason == Some(StopReason::MaxTokens) {
                    warn!(max_tokens = self.config.max_tokens, "Summary hit the token limit");
                }
                info!(total_tokens = response.usage.total(), "Summary received");
                handle.record_exchange(SUMMARY_INSTRUCTION, response.content.clone());
                response.content
            }
            Ok(_) => {
                warn!("Backend returned an empty summary");
                SUMMARY_FALLBACK.to_string()
            }
            Err(e) => {
                warn!(error = %e, "Summary failed, using fallback");
                SUMMARY_FALLBACK.to_string()
            }
        }
    }

    /// Stream the reply to `user_text`.
    ///
    /// The stream ends without error once the session's generation moves
    /// past the handle's; a gap longer than the idle timeout ends it with
    /// `StreamInterrupted`.
    #[instrument(skip(self, handle, user_text), fields(handle_id = %handle.id))]
    pub async fn send_message(
        &self,
        handle: &ConversationHandle,
        user_text: &str,
    ) -> Result<ChunkStream> {
        let backend = self.backend.clone().ok_or_else(|| {
            Error::BackendUnavailable("no provider credentials configured".to_string())
        })?;

        let current = self.current_generation();
        if current != handle.bound_generation {
            return Err(Error::StaleResult {
                generation: handle.bound_generation,
                current,
            });
        }

        let request = handle.request_with(ChatMessage::user(user_text), self.config.max_tokens);
        let stream = self.within_request_timeout(backend.stream(request)).await?;
        debug!("Reply stream started");

        let stream = with_idle_timeout(
            stream,
            Duration::from_millis(self.config.stream_idle_timeout_ms),
        );
        Ok(Box::pin(stream.take_until(superseded(
            self.generations.clone(),
            handle.bound_generation,
        ))))
    }
}

/// Resolves once the published generation differs from `bound`.
async fn superseded(mut generations: watch::Receiver<Generation>, bound: Generation) {
    loop {
        let current = *generations.borrow_and_update();
        if current != bound {
            debug!(bound = %bound, current = %current, "Stream superseded");
            return;
        }
        // Sender dropped: the session is gone.
        if generations.changed().await.is_err() {
            return;
        }
    }
}

fn with_idle_timeout(stream: ChunkStream, idle: Duration) -> ChunkStream {
    Box::pin(futures::stream::unfold(Some(stream), move |state| async move {
        let mut stream = state?;
        match tokio::time::timeout(idle, stream.next()).await {
            Ok(Some(item)) => Some((item, Some(stream))),
            Ok(None) => None,
            Err(_) => {
                warn!(idle_ms = idle.as_millis() as u64, "Reply stream stalled");
                Some((
                    Err(Error::StreamInterrupted(format!(
                        "no data received for {}ms",
                        idle.as_millis()
                    ))),
                    None,
                ))
            }
        }
    }))
}

/// Owns the current conversation handle for one session.
#[derive(Debug)]
pub struct LlmSessionManager {
    client: ConversationClient,
    current: Option<ConversationHandle>,
}

impl LlmSessionManager {
    pub fn new(client: ConversationClient) -> Self {
        Self {
            client,
            current: None,
        }
    }

    pub fn client(&self) -> &ConversationClient {
        &self.client
    }

    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.client.backend_kind()
    }

    /// Make `handle` current, replacing any previous one.
    ///
    /// Handles bound to a superseded generation are rejected.
    pub fn install(&mut self, handle: ConversationHandle) -> Result<()> {
        let current = self.client.current_generation();
        if handle.bound_generation != current {
            return Err(Error::StaleResult {
                generation: handle.bound_generation,
                current,
            });
        }
        if let Some(previous) = self.current.replace(handle) {
            debug!(handle_id = %previous.id, "Conversation handle replaced");
        }
        Ok(())
    }

    pub fn current(&self) -> Option<&ConversationHandle> {
        self.current.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut ConversationHandle> {
        self.current.as_mut()
    }

    /// Whether output tagged with `id` and `generation` may be shown.
    pub fn is_current(&self, id: Uuid, generation: Generation) -> bool {
        self.current
            .as_ref()
            .is_some_and(|h| h.id == id && h.bound_generation == generation)
            && self.client.is_live(generation)
    }

    pub fn clear(&mut self) {
        self.current = None;
    }

    /// Swap the backend; the current handle belongs to the old one.
    pub fn replace_client(&mut self, client: ConversationClient) {
        self.client = client;
        self.current = None;
    }
}
