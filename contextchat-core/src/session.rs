//! Content session state.
//!
//! Tracks which content item is active, its normalized text, and the
//! generation counter that marks which selection a piece of asynchronous
//! work belongs to. Work tagged with an older generation is discarded.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::catalog::ContentRef;

/// Monotonic selection counter.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Generation(u64);

impl Generation {
    /// The generation of a fresh session (no selection yet).
    pub const INITIAL: Self = Self(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read-only view of the session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub active_ref: Option<ContentRef>,
    pub normalized_text: String,
    pub generation: Generation,
}

/// The single active binding between a content item and its extracted text.
///
/// Only the orchestrator holds a `ContentSession`; every mutation goes
/// through `&mut self`. The current generation is also published on a
/// watch channel so streams running on other tasks can notice supersession.
#[derive(Debug)]
pub struct ContentSession {
    active_ref: Option<ContentRef>,
    normalized_text: String,
    generation: Generation,
    publisher: watch::Sender<Generation>,
}

impl ContentSession {
    pub fn new() -> Self {
        let (publisher, _) = watch::channel(Generation::INITIAL);
        Self {
            active_ref: None,
            normalized_text: String::new(),
            generation: Generation::INITIAL,
            publisher,
        }
    }

    /// Make `content` the active item and start a new generation.
    ///
    /// The previous text is cleared so it can never be read as if it
    /// belonged to the new selection.
    pub fn begin_selection(&mut self, content: ContentRef) -> Generation {
        self.generation = self.generation.next();
        debug!(
            generation = %self.generation,
            content_id = %content.id,
            "Selection started"
        );
        self.active_ref = Some(content);
        self.normalized_text.clear();
        self.publisher.send_replace(self.generation);
        self.generation
    }

    /// Apply extracted text if `generation` is still current.
    ///
    /// Returns `false` (and leaves the text untouched) for a late result.
    pub fn complete_extraction(&mut self, generation: Generation, text: impl Into<String>) -> bool {
        if generation != self.generation {
            debug!(
                generation = %generation,
                current = %self.generation,
                "Discarding stale extraction"
            );
            return false;
        }
        self.normalized_text = text.into();
        true
    }

    /// Snapshot of the active ref, text and generation.
    pub fn current(&self) -> SessionSnapshot {
        SessionSnapshot {
            active_ref: self.active_ref.clone(),
            normalized_text: self.normalized_text.clone(),
            generation: self.generation,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        generation == self.generation
    }

    pub fn active_ref(&self) -> Option<&ContentRef> {
        self.active_ref.as_ref()
    }

    pub fn normalized_text(&self) -> &str {
        &self.normalized_text
    }

    /// Subscribe to generation changes.
    pub fn watch(&self) -> watch::Receiver<Generation> {
        self.publisher.subscribe()
    }
}

impl Default for ContentSession {
    fn default() -> Self {
        Self::new()
    }
}
