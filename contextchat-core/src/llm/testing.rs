//! Scripted backend for exercising the session pipeline without a network.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::channel::mpsc;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

use super::client::ConversationBackend;
use super::types::{BackendKind, ChunkStream, CompletionRequest, CompletionResponse, TokenUsage};

type CompleteFn = dyn Fn(&CompletionRequest) -> Result<String> + Send + Sync;

enum StreamScript {
    Channel(mpsc::UnboundedReceiver<Result<String>>),
    Fail(String),
}

/// Backend whose replies are set up by the test.
///
/// `complete` answers through a closure (a summary heading for summary
/// requests, "Ready." otherwise, by default). `stream` hands out scripted
/// channels in the order they were registered.
pub(crate) struct ScriptedBackend {
    kind: BackendKind,
    complete_fn: Box<CompleteFn>,
    requests: Mutex<Vec<CompletionRequest>>,
    holds: Mutex<Vec<(String, oneshot::Receiver<()>)>>,
    streams: Mutex<VecDeque<StreamScript>>,
}

impl ScriptedBackend {
    pub(crate) fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            complete_fn: Box::new(|request| {
                let last = request.last_content().unwrap_or_default();
                if last.contains("### Summary") {
                    Ok("### Summary\nScripted summary.".to_string())
                } else {
                    Ok("Ready.".to_string())
                }
            }),
            requests: Mutex::new(Vec::new()),
            holds: Mutex::new(Vec::new()),
            streams: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn with_complete<F>(mut self, f: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<String> + Send + Sync + 'static,
    {
        self.complete_fn = Box::new(f);
        self
    }

    /// Park the next `complete` whose last message contains `needle` until
    /// the returned sender fires or is dropped.
    pub(crate) fn hold_when(&self, needle: impl Into<String>) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.holds.lock().unwrap().push((needle.into(), rx));
        tx
    }

    /// Script the next stream; chunks are fed through the returned sender.
    pub(crate) fn script_stream(&self) -> mpsc::UnboundedSender<Result<String>> {
        let (tx, rx) = mpsc::unbounded();
        self.streams
            .lock()
            .unwrap()
            .push_back(StreamScript::Channel(rx));
        tx
    }

    /// Script the next stream as a fixed sequence of chunks.
    pub(crate) fn script_chunks(&self, chunks: &[&str]) {
        let tx = self.script_stream();
        for chunk in chunks {
            tx.unbounded_send(Ok(chunk.to_string())).unwrap();
        }
    }

    /// Script the next stream to be refused by the provider.
    pub(crate) fn fail_next_stream(&self, message: impl Into<String>) {
        self.streams
            .lock()
            .unwrap()
            .push_back(StreamScript::Fail(message.into()));
    }

    pub(crate) fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConversationBackend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        self.requests.lock().unwrap().push(request.clone());

        let gate = {
            let mut holds = self.holds.lock().unwrap();
            let last = request.last_content().unwrap_or_default();
            holds
                .iter()
                .position(|(needle, _)| last.contains(needle.as_str()))
                .map(|i| holds.remove(i).1)
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        let content = (self.complete_fn)(&request)?;
        Ok(CompletionResponse {
            model: "scripted".to_string(),
            content,
            stop_reason: None,
            usage: TokenUsage::default(),
        })
    }

    async fn stream(&self, request: CompletionRequest) -> Result<ChunkStream> {
        self.requests.lock().unwrap().push(request);

        let script = self.streams.lock().unwrap().pop_front();
        match script {
            Some(StreamScript::Channel(rx)) => Ok(Box::pin(rx)),
            Some(StreamScript::Fail(message)) => Err(Error::llm_api(self.kind, message)),
            None => Ok(Box::pin(futures::stream::iter(vec![Ok(
                "Scripted reply.".to_string(),
            )]))),
        }
    }
}
