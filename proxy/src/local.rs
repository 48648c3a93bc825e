//! In-process bus transport
//!
//! Each registered actor gets its own serving task fed by an mpsc queue, so
//! an actor handles one command at a time in arrival order, the way a
//! hardware controller process would. Replies travel back on a oneshot
//! channel per command.

use crate::bus::{BusClient, ReplyCallback};
use crate::command::CommandRequest;
use crate::error::{ProxyError, ProxyResult, RemoteError};
use crate::reply::{Body, Reply};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;

const QUEUE_DEPTH: usize = 64;

/// Server side of an actor on a [`LocalBus`]
#[async_trait]
pub trait ActorHandler: Send + Sync {
    /// Handle one command. The returned body becomes the final reply; an
    /// error becomes a failure reply carrying its wire string.
    async fn handle(&self, request: &CommandRequest, replies: &ReplySink) -> Result<Body, RemoteError>;
}

/// Collects intermediate replies emitted while a command is handled
pub struct ReplySink {
    callback: Option<ReplyCallback>,
    emitted: Mutex<Vec<Body>>,
}

impl ReplySink {
    fn new(callback: Option<ReplyCallback>) -> Self {
        Self {
            callback,
            emitted: Mutex::new(Vec::new()),
        }
    }

    /// Send an intermediate reply to the caller
    pub fn emit(&self, body: Body) {
        if let Some(cb) = &self.callback {
            cb(&body);
        }
        if let Ok(mut emitted) = self.emitted.lock() {
            emitted.push(body);
        }
    }

    fn into_bodies(self) -> Vec<Body> {
        self.emitted.into_inner().unwrap_or_default()
    }
}

struct Envelope {
    request: CommandRequest,
    callback: Option<ReplyCallback>,
    respond: oneshot::Sender<Reply>,
}

struct ActorSlot {
    sender: mpsc::Sender<Envelope>,
    task: JoinHandle<()>,
}

/// Bus whose actors live in the same process
#[derive(Default)]
pub struct LocalBus {
    actors: RwLock<HashMap<String, ActorSlot>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any actor already there
    pub async fn register(&self, name: impl Into<String>, handler: Arc<dyn ActorHandler>) {
        let name = name.into();
        let (sender, receiver) = mpsc::channel(QUEUE_DEPTH);
        let task = tokio::spawn(serve(name.clone(), handler, receiver));

        let mut actors = self.actors.write().await;
        if let Some(old) = actors.insert(name.clone(), ActorSlot { sender, task }) {
            old.task.abort();
        }
        tracing::debug!("Local actor registered: {}", name);
    }

    /// Remove an actor; pending commands to it fail as unreachable
    pub async fn unregister(&self, name: &str) -> bool {
        match self.actors.write().await.remove(name) {
            Some(slot) => {
                slot.task.abort();
                tracing::debug!("Local actor removed: {}", name);
                true
            }
            None => false,
        }
    }

    pub async fn actors(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actors.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

async fn serve(name: String, handler: Arc<dyn ActorHandler>, mut receiver: mpsc::Receiver<Envelope>) {
    while let Some(envelope) = receiver.recv().await {
        let sink = ReplySink::new(envelope.callback);
        let result = handler.handle(&envelope.request, &sink).await;
        let bodies = sink.into_bodies();

        let reply = match result {
            Ok(body) => Reply::success_with(bodies, body),
            Err(e) => {
                tracing::debug!("{} {} failed: {}", name, envelope.request.command, e);
                Reply::failure_with(bodies, &e)
            }
        };
        // The caller may have given up on its deadline
        let _ = envelope.respond.send(reply);
    }
}

#[async_trait]
impl BusClient for LocalBus {
    async fn send_command(
        &self,
        request: CommandRequest,
        callback: Option<ReplyCallback>,
    ) -> ProxyResult<Reply> {
        let sender = self
            .actors
            .read()
            .await
            .get(&request.actor)
            .map(|slot| slot.sender.clone())
            .ok_or_else(|| ProxyError::ActorUnreachable(request.actor.clone()))?;

        let actor = request.actor.clone();
        let (respond, response) = oneshot::channel();
        sender
            .send(Envelope {
                request,
                callback,
                respond,
            })
            .await
            .map_err(|_| ProxyError::ActorUnreachable(actor.clone()))?;

        response.await.map_err(|_| ProxyError::ActorUnreachable(actor))
    }
}
