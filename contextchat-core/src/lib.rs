//! # contextchat-core
//!
//! Content-to-context synchronization for chatting with published content.
//!
//! A user picks a content item; its rendered markup is converted to text,
//! an LLM conversation is seeded with that text as its only context, a
//! summary is shown, and later messages stream their replies into a chat
//! log. A per-selection generation counter guarantees that results from an
//! older selection never reach the log.
//!
//! ## Core Components
//!
//! - **Catalog**: Content references and collaborator interfaces
//! - **Convert**: External converter process with normalized output
//! - **Session**: Active content, extracted text and generation
//! - **LLM**: Provider backends and generation-bound conversations
//! - **Orchestrator**: Per-session actor driving the whole flow
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use contextchat_core::{
//!     BackendConfig, BaseUrlResolver, CommandConverter, HttpMarkupSource, Orchestrator,
//!     SessionConfig,
//! };
//!
//! let resolver = Arc::new(BaseUrlResolver::new("https://connect.example.com/")?);
//! let session = Orchestrator::new(
//!     SessionConfig::default(),
//!     &BackendConfig::from_env(),
//!     Arc::new(CommandConverter::default()),
//!     Arc::new(HttpMarkupSource::new(resolver)?),
//! )?
//! .spawn();
//!
//! let mut log = session.subscribe().await?;
//! session.select(content).await?;
//! while let Some(update) = log.updates.recv().await {
//!     render(update);
//! }
//! ```

pub mod catalog;
pub mod chat_log;
pub mod config;
pub mod convert;
pub mod error;
pub mod llm;
pub mod orchestrator;
pub mod session;
pub mod viewer;

// Re-exports for convenience
pub use catalog::{
    filter_renderable, BaseUrlResolver, CatalogService, ContentKind, ContentRef, ContentResolver,
};
pub use chat_log::{ChatEntry, ChatLog, EntryKind, LogSubscription, LogUpdate};
pub use config::{BackendConfig, ProviderCredentials, SessionConfig};
pub use convert::{normalize_text, CommandConverter, ConverterConfig, MarkupConverter};
pub use error::{Error, Result};
pub use llm::{
    BackendKind, ChatMessage, ChatRole, ConversationBackend, ConversationClient,
    ConversationConfig, ConversationHandle, LlmSessionManager, SUMMARY_FALLBACK,
};
pub use orchestrator::{
    ConversionFallback, Orchestrator, SessionEvent, SessionHandle, SessionState, SessionStatus,
};
pub use session::{ContentSession, Generation, SessionSnapshot};
pub use viewer::{HttpMarkupSource, MarkupSource};
