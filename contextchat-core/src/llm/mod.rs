//! LLM backends and conversation management.
//!
//! Three providers are supported (Anthropic, OpenAI, Google Gemini). At most
//! one is used per session, chosen by [`BackendKind::PRIORITY`] from the
//! credentials in a [`BackendConfig`](crate::config::BackendConfig).
//!
//! ## Example
//!
//! ```rust,ignore
//! use contextchat_core::config::BackendConfig;
//! use contextchat_core::llm::{select_backend, ChatMessage, CompletionRequest};
//!
//! let backend = select_backend(&BackendConfig::from_env(), 120)?
//!     .expect("no provider credentials");
//!
//! let request = CompletionRequest::new().with_message(ChatMessage::user("Hello"));
//! let response = backend.complete(request).await?;
//! ```

mod client;
mod session;
mod sse;
mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{
    build_backend, select_backend, AnthropicClient, ClientConfig, ConversationBackend,
    GoogleClient, OpenAIClient,
};
pub use session::{
    wrap_context, ConversationClient, ConversationConfig, ConversationHandle, LlmSessionManager,
    SUMMARY_FALLBACK, SUMMARY_INSTRUCTION, SYSTEM_PROMPT,
};
pub use sse::{text_stream, SseDecoder, SseEvent};
pub use types::{
    BackendKind, ChatMessage, ChatRole, ChunkStream, CompletionRequest, CompletionResponse,
    StopReason, TokenUsage,
};
