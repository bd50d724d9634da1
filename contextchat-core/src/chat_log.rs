//! Append-only visible chat log.
//!
//! Every change is sent as a [`LogUpdate`] to each subscriber. A
//! [`LogSubscription`] starts from a snapshot taken at the moment it was
//! created and its update channel is unbounded, so a subscriber that applies
//! updates to the snapshot in order mirrors the log exactly, however far
//! behind it falls. Assistant replies are appended once and then grown chunk
//! by chunk until finalized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::llm::ChatRole;
use crate::session::Generation;

/// What an entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Conversation text
    Message,
    /// Informational notice (fallbacks, setup hints)
    Notice,
    /// A failed turn
    Error,
}

/// One visible log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub id: Uuid,
    pub role: ChatRole,
    pub kind: EntryKind,
    pub content: String,
    /// Generation the entry was produced under
    pub generation: Generation,
    /// False while an assistant reply is still streaming
    pub finalized: bool,
    pub timestamp: DateTime<Utc>,
}

impl ChatEntry {
    fn new(role: ChatRole, kind: EntryKind, content: String, generation: Generation) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            kind,
            content,
            generation,
            finalized: true,
            timestamp: Utc::now(),
        }
    }

    pub fn is_assistant_message(&self) -> bool {
        self.role == ChatRole::Assistant && self.kind == EntryKind::Message
    }
}

/// A change to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogUpdate {
    Appended { entry: ChatEntry },
    Chunk { id: Uuid, text: String },
    Finalized { id: Uuid },
}

/// A snapshot of the log plus every change made after it.
#[derive(Debug)]
pub struct LogSubscription {
    pub entries: Vec<ChatEntry>,
    pub updates: mpsc::UnboundedReceiver<LogUpdate>,
}

/// The log itself. Owned by the session actor.
#[derive(Debug, Default)]
pub struct ChatLog {
    entries: Vec<ChatEntry>,
    subscribers: Vec<mpsc::UnboundedSender<LogUpdate>>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Updates made after this call are never dropped.
    pub fn subscribe(&mut self) -> LogSubscription {
        let (tx, updates) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        LogSubscription {
            entries: self.entries.clone(),
            updates,
        }
    }

    fn publish(&mut self, update: LogUpdate) {
        self.subscribers.retain(|tx| tx.send(update.clone()).is_ok());
    }

    /// Append a finished entry and return its id.
    pub fn append(
        &mut self,
        role: ChatRole,
        kind: EntryKind,
        content: impl Into<String>,
        generation: Generation,
    ) -> Uuid {
        let entry = ChatEntry::new(role, kind, content.into(), generation);
        let id = entry.id;
        trace!(entry_id = %id, role = %role, kind = ?kind, "Log entry appended");
        self.entries.push(entry.clone());
        self.publish(LogUpdate::Appended { entry });
        id
    }

    /// Start a streamed assistant entry with its first chunk.
    pub fn begin_stream(&mut self, first_chunk: impl Into<String>, generation: Generation) -> Uuid {
        let mut entry = ChatEntry::new(
            ChatRole::Assistant,
            EntryKind::Message,
            first_chunk.into(),
            generation,
        );
        entry.finalized = false;
        let id = entry.id;
        self.entries.push(entry.clone());
        self.publish(LogUpdate::Appended { entry });
        id
    }

    /// Extend an open entry. Returns false for unknown or finalized entries.
    pub fn append_chunk(&mut self, id: Uuid, text: &str) -> bool {
        let Some(entry) = self.open_entry(id) else {
            return false;
        };
        entry.content.push_str(text);
        self.publish(LogUpdate::Chunk {
            id,
            text: text.to_string(),
        });
        true
    }

    /// Close an open entry. Returns false for unknown or finalized entries.
    pub fn finalize(&mut self, id: Uuid) -> bool {
        let Some(entry) = self.open_entry(id) else {
            return false;
        };
        entry.finalized = true;
        self.publish(LogUpdate::Finalized { id });
        true
    }

    fn open_entry(&mut self, id: Uuid) -> Option<&mut ChatEntry> {
        self.entries
            .iter_mut()
            .rev()
            .find(|e| e.id == id)
            .filter(|e| !e.finalized)
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_append_and_stream() {
        let mut log = ChatLog::new();
        let generation = Generation::new(1);

        log.append(ChatRole::User, EntryKind::Message, "What changed?", generation);
        let id = log.begin_stream("Sales ", generation);
        assert!(log.append_chunk(id, "rose."));
        assert!(!log.entries()[1].finalized);
        assert!(log.finalize(id));

        assert_eq!(log.len(), 2);
        assert_eq!(log.entries()[1].content, "Sales rose.");
        assert!(log.entries()[1].finalized);
        assert!(log.entries()[1].is_assistant_message());
    }

    #[test]
    fn test_finalized_entries_are_closed() {
        let mut log = ChatLog::new();
        let id = log.begin_stream("a", Generation::new(1));
        log.finalize(id);

        assert!(!log.append_chunk(id, "b"));
        assert!(!log.finalize(id));
        assert!(!log.append_chunk(Uuid::new_v4(), "c"));
        assert_eq!(log.entries()[0].content, "a");
    }

    #[tokio::test]
    async fn test_updates_arrive_in_order() {
        let mut log = ChatLog::new();
        let mut sub = log.subscribe();
        assert!(sub.entries.is_empty());

        let id = log.begin_stream("x", Generation::new(3));
        log.append_chunk(id, "y");
        log.finalize(id);

        match sub.updates.recv().await.unwrap() {
            LogUpdate::Appended { entry } => {
                assert_eq!(entry.id, id);
                assert_eq!(entry.content, "x");
            }
            other => panic!("unexpected update: {other:?}"),
        }
        assert_eq!(
            sub.updates.recv().await.unwrap(),
            LogUpdate::Chunk {
                id,
                text: "y".to_string()
            }
        );
        assert_eq!(sub.updates.recv().await.unwrap(), LogUpdate::Finalized { id });
    }

    #[test]
    fn test_slow_subscriber_mirrors_long_reply() {
        let mut log = ChatLog::new();
        let generation = Generation::new(1);
        log.append(ChatRole::User, EntryKind::Message, "Tell me everything", generation);
        let mut sub = log.subscribe();

        let id = log.begin_stream("c0 ", generation);
        for i in 1..1000 {
            log.append_chunk(id, &format!("c{i} "));
        }
        log.finalize(id);

        let mut mirror = sub.entries.clone();
        while let Ok(update) = sub.updates.try_recv() {
            match update {
                LogUpdate::Appended { entry } => mirror.push(entry),
                LogUpdate::Chunk { id, text } => {
                    let entry = mirror.iter_mut().find(|e| e.id == id).unwrap();
                    entry.content.push_str(&text);
                }
                LogUpdate::Finalized { id } => {
                    mirror.iter_mut().find(|e| e.id == id).unwrap().finalized = true;
                }
            }
        }

        assert_eq!(mirror, log.entries());
        assert!(mirror[1].content.starts_with("c0 c1 "));
        assert!(mirror[1].content.ends_with("c999 "));
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let mut log = ChatLog::new();
        let sub = log.subscribe();
        drop(sub);

        log.append(ChatRole::User, EntryKind::Message, "hi", Generation::new(1));
        assert!(log.subscribers.is_empty());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_update_serialization_is_tagged() {
        let update = LogUpdate::Finalized { id: Uuid::nil() };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["type"], "finalized");
    }
}
