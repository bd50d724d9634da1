//! Session orchestrator.
//!
//! One actor task per session owns the content session, the conversation
//! manager and the chat log, and is the only place they are mutated. The
//! pipeline runs as follows:
//!
//! 1. SELECT: start a new generation and fetch the rendered markup
//! 2. CONVERT: turn markup into normalized text
//! 3. SEED: reset the conversation with the text as context
//! 4. SUMMARIZE: append the summary as the first visible assistant entry
//! 5. CHAT: stream replies to user messages into the log
//!
//! Every suspending step runs in a spawned task that reports back with the
//! generation it was started under. Reports for an older generation are
//! dropped on arrival; nothing else cancels in-flight work.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, info_span, instrument, trace, warn, Instrument};
use uuid::Uuid;

use crate::catalog::ContentRef;
use crate::chat_log::{ChatEntry, ChatLog, EntryKind, LogSubscription};
use crate::config::{BackendConfig, SessionConfig};
use crate::convert::MarkupConverter;
use crate::error::{Error, Result};
use crate::llm::{
    select_backend, BackendKind, ChatRole, ConversationBackend, ConversationClient,
    ConversationHandle, LlmSessionManager, SUMMARY_FALLBACK,
};
use crate::session::{ContentSession, Generation};
use crate::viewer::MarkupSource;

/// Shown when the selected content could not be retrieved or converted.
pub const CONTENT_ERROR_MESSAGE: &str = "Could not process the selected content.";

/// Shown when the conversation could not be seeded with the content.
pub const CONTEXT_ERROR_MESSAGE: &str =
    "Could not start a conversation about the selected content. Please select it again.";

/// Terminal entry for a reply that failed part way.
pub const STREAM_ERROR_MESSAGE: &str = "Error generating a response. Please retry.";

/// Where the session is in the selection and chat cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No provider credentials; chat is unavailable
    NoBackend,
    /// Backend available, nothing loaded
    Idle,
    /// Fetching, converting and seeding the selected content
    Extracting,
    /// Summary delivered, accepting messages
    ContextLoaded,
    /// A reply is streaming
    Streaming,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoBackend => write!(f, "no_backend"),
            Self::Idle => write!(f, "idle"),
            Self::Extracting => write!(f, "extracting"),
            Self::ContextLoaded => write!(f, "context_loaded"),
            Self::Streaming => write!(f, "streaming"),
        }
    }
}

/// What to do when markup conversion fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionFallback {
    /// Use the raw markup as context and show the fixed fallback instead of
    /// a summary
    #[default]
    RawMarkup,
    /// Show an error notice and return to idle
    Notice,
}

/// Input to a session.
#[derive(Debug)]
pub enum SessionEvent {
    /// Make a content item the active one
    Select(ContentRef),
    /// Send a chat message; the reply reports acceptance or rejection
    UserMessage {
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Re-probe backend credentials
    Reconfigure(BackendConfig),
    /// Report the current status
    Status(oneshot::Sender<SessionStatus>),
    /// Report a snapshot of the chat log
    Entries(oneshot::Sender<Vec<ChatEntry>>),
    /// Follow the chat log from a snapshot onwards
    Subscribe(oneshot::Sender<LogSubscription>),
}

/// Snapshot of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub generation: Generation,
    pub active: Option<ContentRef>,
    pub backend: Option<BackendKind>,
}

/// Results reported back by spawned work.
#[derive(Debug)]
enum TaskEvent {
    MarkupReady {
        generation: Generation,
        result: Result<String>,
    },
    Extracted {
        generation: Generation,
        raw: String,
        converted: Result<String>,
    },
    ContextReady {
        generation: Generation,
        result: Result<(ConversationHandle, String)>,
    },
    Chunk {
        generation: Generation,
        handle_id: Uuid,
        text: String,
    },
    StreamEnded {
        generation: Generation,
        handle_id: Uuid,
        result: Result<String>,
    },
}

/// The reply currently streaming into the log.
#[derive(Debug)]
struct StreamTurn {
    generation: Generation,
    handle_id: Uuid,
    user_text: String,
    entry: Option<Uuid>,
}

/// A session ready to run.
pub struct Orchestrator {
    actor: SessionActor,
    task_events: mpsc::UnboundedReceiver<TaskEvent>,
}

impl Orchestrator {
    /// Create a session, selecting the backend from `backends`.
    pub fn new(
        config: SessionConfig,
        backends: &BackendConfig,
        converter: Arc<dyn MarkupConverter>,
        markup: Arc<dyn MarkupSource>,
    ) -> Result<Self> {
        let backend = select_backend(backends, request_timeout_secs(&config))?;
        Ok(Self::with_backend(config, backend, converter, markup))
    }

    /// Create a session around an already built backend.
    pub fn with_backend(
        config: SessionConfig,
        backend: Option<Arc<dyn ConversationBackend>>,
        converter: Arc<dyn MarkupConverter>,
        markup: Arc<dyn MarkupSource>,
    ) -> Self {
        let session = ContentSession::new();
        let client = ConversationClient::new(backend, session.watch(), config.conversation.clone());
        let state = if client.has_backend() {
            SessionState::Idle
        } else {
            SessionState::NoBackend
        };
        let log = ChatLog::new();
        let (tasks, task_events) = mpsc::unbounded_channel();

        Self {
            actor: SessionActor {
                config,
                state,
                session,
                llm: LlmSessionManager::new(client),
                log,
                converter,
                markup,
                turn: None,
                tasks,
            },
            task_events,
        }
    }

    pub fn state(&self) -> SessionState {
        self.actor.state
    }

    pub fn subscribe(&mut self) -> LogSubscription {
        self.actor.log.subscribe()
    }

    /// Run the session on a new task and return a handle to it.
    pub fn spawn(self) -> SessionHandle {
        let (events, receiver) = mpsc::channel(self.actor.config.event_capacity.max(1));
        let handle = SessionHandle { events };
        tokio::spawn(self.run(receiver));
        handle
    }

    /// Process events until every sender of `events` is dropped.
    pub async fn run(self, mut events: mpsc::Receiver<SessionEvent>) {
        let Self {
            mut actor,
            mut task_events,
        } = self;
        info!(state = %actor.state, backend = ?actor.llm.backend_kind(), "Session started");

        loop {
            tokio::select! {
                biased;
                Some(task) = task_events.recv() => actor.on_task(task),
                event = events.recv() => match event {
                    Some(event) => actor.on_event(event),
                    None => break,
                },
            }
        }

        debug!(generation = %actor.session.generation(), "Session ended");
    }
}

/// Whole seconds for the HTTP client, never zero.
fn request_timeout_secs(config: &SessionConfig) -> u64 {
    config.conversation.request_timeout_ms.div_ceil(1000).max(1)
}

struct SessionActor {
    config: SessionConfig,
    state: SessionState,
    session: ContentSession,
    llm: LlmSessionManager,
    log: ChatLog,
    converter: Arc<dyn MarkupConverter>,
    markup: Arc<dyn MarkupSource>,
    turn: Option<StreamTurn>,
    tasks: mpsc::UnboundedSender<TaskEvent>,
}

impl SessionActor {
    fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Select(content) => self.select(content),
            SessionEvent::UserMessage { text, reply } => {
                let result = self.start_turn(text);
                if let Err(e) = &result {
                    debug!(error = %e, state = %self.state, "Message rejected");
                }
                let _ = reply.send(result);
            }
            SessionEvent::Reconfigure(backends) => self.reconfigure(&backends),
            SessionEvent::Status(reply) => {
                let _ = reply.send(self.status());
            }
            SessionEvent::Entries(reply) => {
                let _ = reply.send(self.log.entries().to_vec());
            }
            SessionEvent::Subscribe(reply) => {
                let _ = reply.send(self.log.subscribe());
            }
        }
    }

    fn on_task(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::MarkupReady { generation, result } => self.markup_ready(generation, result),
            TaskEvent::Extracted {
                generation,
                raw,
                converted,
            } => self.extracted(generation, raw, converted),
            TaskEvent::ContextReady { generation, result } => {
                self.context_ready(generation, result)
            }
            TaskEvent::Chunk {
                generation,
                handle_id,
                text,
            } => self.chunk(generation, handle_id, text),
            TaskEvent::StreamEnded {
                generation,
                handle_id,
                result,
            } => self.stream_ended(generation, handle_id, result),
        }
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            generation: self.session.generation(),
            active: self.session.active_ref().cloned(),
            backend: self.llm.backend_kind(),
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "State transition");
            self.state = next;
        }
    }

    fn resting_state(&self) -> SessionState {
        if self.llm.client().has_backend() {
            SessionState::Idle
        } else {
            SessionState::NoBackend
        }
    }

    fn is_stale(&self, generation: Generation, what: &str) -> bool {
        if self.session.is_current(generation) {
            return false;
        }
        debug!(
            generation = %generation,
            current = %self.session.generation(),
            "Discarding stale {what}"
        );
        true
    }

    #[instrument(skip(self, content), fields(content_id = %content.id))]
    fn select(&mut self, content: ContentRef) {
        self.abandon_turn();
        self.llm.clear();

        let generation = self.session.begin_selection(content.clone());
        info!(generation = %generation, title = %content.title, "Content selected");
        self.transition(if self.llm.client().has_backend() {
            SessionState::Extracting
        } else {
            SessionState::NoBackend
        });

        let markup = Arc::clone(&self.markup);
        let tasks = self.tasks.clone();
        let timeout_ms = self.config.markup_timeout_ms;
        tokio::spawn(
            async move {
                let fetch = markup.fetch_markup(&content);
                let result = tokio::time::timeout(Duration::from_millis(timeout_ms), fetch)
                    .await
                    .unwrap_or_else(|_| Err(Error::timeout(timeout_ms)));
                let _ = tasks.send(TaskEvent::MarkupReady { generation, result });
            }
            .instrument(info_span!("fetch_markup", generation = %generation)),
        );
    }

    fn abandon_turn(&mut self) {
        if let Some(turn) = self.turn.take() {
            if let Some(id) = turn.entry {
                self.log.finalize(id);
            }
            debug!(handle_id = %turn.handle_id, "Streaming reply abandoned");
        }
    }

    fn fail_selection(&mut self, generation: Generation, kind: EntryKind, message: &str) {
        if self.llm.client().has_backend() {
            self.log.append(ChatRole::Assistant, kind, message, generation);
        }
        self.transition(self.resting_state());
    }

    fn markup_ready(&mut self, generation: Generation, result: Result<String>) {
        if self.is_stale(generation, "markup") {
            return;
        }

        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Markup retrieval failed");
                self.fail_selection(generation, EntryKind::Error, CONTENT_ERROR_MESSAGE);
                return;
            }
        };

        let converter = Arc::clone(&self.converter);
        let tasks = self.tasks.clone();
        tokio::spawn(
            async move {
                let converted = converter.convert(&raw).await;
                let _ = tasks.send(TaskEvent::Extracted {
                    generation,
                    raw,
                    converted,
                });
            }
            .instrument(info_span!("convert", generation = %generation)),
        );
    }

    fn extracted(&mut self, generation: Generation, raw: String, converted: Result<String>) {
        if self.is_stale(generation, "extraction") {
            return;
        }

        let (text, summarize) = match converted {
            Ok(text) => (text, true),
            Err(e) => {
                warn!(error = %e, fallback = ?self.config.conversion_fallback, "Conversion failed");
                match self.config.conversion_fallback {
                    ConversionFallback::RawMarkup => (raw, false),
                    ConversionFallback::Notice => {
                        self.fail_selection(generation, EntryKind::Notice, CONTENT_ERROR_MESSAGE);
                        return;
                    }
                }
            }
        };

        if !self.session.complete_extraction(generation, text) {
            return;
        }
        if !self.llm.client().has_backend() {
            self.transition(SessionState::NoBackend);
            return;
        }

        let client = self.llm.client().clone();
        let context = self.session.normalized_text().to_string();
        let tasks = self.tasks.clone();
        tokio::spawn(
            async move {
                let result = load_context(&client, generation, &context, summarize).await;
                let _ = tasks.send(TaskEvent::ContextReady { generation, result });
            }
            .instrument(info_span!("load_context", generation = %generation)),
        );
    }

    fn context_ready(
        &mut self,
        generation: Generation,
        result: Result<(ConversationHandle, String)>,
    ) {
        if self.is_stale(generation, "conversation") {
            return;
        }

        match result {
            Ok((handle, summary)) => {
                if let Err(e) = self.llm.install(handle) {
                    debug!(error = %e, "Discarding stale conversation");
                    return;
                }
                self.log
                    .append(ChatRole::Assistant, EntryKind::Message, summary, generation);
                self.transition(SessionState::ContextLoaded);
            }
            Err(Error::StaleResult { .. }) => {
                debug!("Conversation superseded before summary");
            }
            Err(Error::NoBackend) => self.transition(SessionState::NoBackend),
            Err(e) => {
                warn!(error = %e, "Context reset failed");
                self.fail_selection(generation, EntryKind::Error, CONTEXT_ERROR_MESSAGE);
            }
        }
    }

    fn start_turn(&mut self, text: String) -> Result<()> {
        match self.state {
            SessionState::NoBackend => {
                return Err(Error::BackendUnavailable(
                    "no provider credentials configured".to_string(),
                ))
            }
            SessionState::Streaming => return Err(Error::Busy),
            SessionState::Idle | SessionState::Extracting => {
                return Err(Error::not_ready(self.state))
            }
            SessionState::ContextLoaded => {}
        }

        let handle = self
            .llm
            .current()
            .cloned()
            .ok_or_else(|| Error::not_ready(self.state))?;
        let generation = self.session.generation();

        self.log
            .append(ChatRole::User, EntryKind::Message, text.clone(), generation);
        self.turn = Some(StreamTurn {
            generation,
            handle_id: handle.id(),
            user_text: text.clone(),
            entry: None,
        });
        self.transition(SessionState::Streaming);

        let client = self.llm.client().clone();
        let tasks = self.tasks.clone();
        let span = info_span!("reply", generation = %generation, handle_id = %handle.id());
        tokio::spawn(relay_reply(client, handle, text, tasks).instrument(span));
        Ok(())
    }

    fn turn_matches(&self, generation: Generation, handle_id: Uuid) -> bool {
        self.turn
            .as_ref()
            .is_some_and(|t| t.generation == generation && t.handle_id == handle_id)
            && self.llm.is_current(handle_id, generation)
    }

    fn chunk(&mut self, generation: Generation, handle_id: Uuid, text: String) {
        if !self.turn_matches(generation, handle_id) {
            trace!(generation = %generation, "Discarding stale chunk");
            return;
        }
        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        match turn.entry {
            Some(id) => {
                self.log.append_chunk(id, &text);
            }
            None => turn.entry = Some(self.log.begin_stream(text, generation)),
        }
    }

    fn stream_ended(&mut self, generation: Generation, handle_id: Uuid, result: Result<String>) {
        if !self.turn_matches(generation, handle_id) {
            debug!(generation = %generation, "Discarding end of stale reply");
            return;
        }
        let Some(turn) = self.turn.take() else {
            return;
        };
        if let Some(id) = turn.entry {
            self.log.finalize(id);
        }

        match result {
            Ok(reply) if !reply.is_empty() => {
                if let Some(handle) = self.llm.current_mut() {
                    handle.record_exchange(turn.user_text, reply);
                }
            }
            Ok(_) => warn!("Backend returned an empty reply"),
            Err(e) => {
                warn!(error = %e, "Reply failed");
                self.log.append(
                    ChatRole::Assistant,
                    EntryKind::Error,
                    STREAM_ERROR_MESSAGE,
                    generation,
                );
            }
        }
        self.transition(SessionState::ContextLoaded);
    }

    fn reconfigure(&mut self, backends: &BackendConfig) {
        let backend = select_backend(backends, request_timeout_secs(&self.config))
            .unwrap_or_else(|e| {
                warn!(error = %e, "Backend could not be built");
                None
            });

        self.abandon_turn();
        let client = ConversationClient::new(
            backend,
            self.session.watch(),
            self.config.conversation.clone(),
        );
        self.llm.replace_client(client);
        info!(backend = ?self.llm.backend_kind(), "Backend reconfigured");

        // Results for the active content were produced with the old backend.
        match self.session.active_ref().cloned() {
            Some(content) => self.select(content),
            None => self.transition(self.resting_state()),
        }
    }
}

async fn load_context(
    client: &ConversationClient,
    generation: Generation,
    context: &str,
    summarize: bool,
) -> Result<(ConversationHandle, String)> {
    let mut handle = client.reset_context(generation, context).await?;
    let current = client.current_generation();
    if current != generation {
        return Err(Error::StaleResult {
            generation,
            current,
        });
    }
    let summary = if summarize {
        client.request_summary(&mut handle).await
    } else {
        SUMMARY_FALLBACK.to_string()
    };
    Ok((handle, summary))
}

async fn relay_reply(
    client: ConversationClient,
    handle: ConversationHandle,
    text: String,
    tasks: mpsc::UnboundedSender<TaskEvent>,
) {
    let generation = handle.bound_generation();
    let handle_id = handle.id();

    let result = match client.send_message(&handle, &text).await {
        Ok(mut stream) => {
            let mut reply = String::new();
            loop {
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        reply.push_str(&chunk);
                        let event = TaskEvent::Chunk {
                            generation,
                            handle_id,
                            text: chunk,
                        };
                        if tasks.send(event).is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Ok(reply),
                }
            }
        }
        Err(e) => Err(e),
    };

    let _ = tasks.send(TaskEvent::StreamEnded {
        generation,
        handle_id,
        result,
    });
}

/// Cloneable handle for driving a spawned session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    events: mpsc::Sender<SessionEvent>,
}

impl SessionHandle {
    async fn send(&self, event: SessionEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| Error::SessionClosed)
    }

    pub async fn select(&self, content: ContentRef) -> Result<()> {
        self.send(SessionEvent::Select(content)).await
    }

    /// Send a chat message.
    ///
    /// Resolves once the message is accepted; the reply itself arrives
    /// through the log.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.send(SessionEvent::UserMessage {
            text: text.into(),
            reply,
        })
        .await?;
        response.await.map_err(|_| Error::SessionClosed)?
    }

    pub async fn reconfigure(&self, backends: BackendConfig) -> Result<()> {
        self.send(SessionEvent::Reconfigure(backends)).await
    }

    pub async fn status(&self) -> Result<SessionStatus> {
        let (reply, response) = oneshot::channel();
        self.send(SessionEvent::Status(reply)).await?;
        response.await.map_err(|_| Error::SessionClosed)
    }

    pub async fn entries(&self) -> Result<Vec<ChatEntry>> {
        let (reply, response) = oneshot::channel();
        self.send(SessionEvent::Entries(reply)).await?;
        response.await.map_err(|_| Error::SessionClosed)
    }

    /// Follow the chat log.
    ///
    /// The snapshot and the update stream line up exactly: every change
    /// after the snapshot arrives on the stream, none before it.
    pub async fn subscribe(&self) -> Result<LogSubscription> {
        let (reply, response) = oneshot::channel();
        self.send(SessionEvent::Subscribe(reply)).await?;
        response.await.map_err(|_| Error::SessionClosed)
    }
}
