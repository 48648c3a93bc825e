//! Message bus abstraction

use crate::command::CommandRequest;
use crate::error::ProxyResult;
use crate::reply::{Body, Reply};
use async_trait::async_trait;
use std::sync::Arc;

/// Sink for intermediate reply bodies
pub type ReplyCallback = Arc<dyn Fn(&Body) + Send + Sync>;

/// Client side of an RPC-style message bus.
///
/// Implementations deliver a command to the named actor and resolve with its
/// final reply. Intermediate replies are forwarded to `callback` as they
/// arrive. Deadlines are enforced by the caller, so an implementation may
/// wait indefinitely.
#[async_trait]
pub trait BusClient: Send + Sync {
    async fn send_command(
        &self,
        request: CommandRequest,
        callback: Option<ReplyCallback>,
    ) -> ProxyResult<Reply>;
}

pub type SharedBus = Arc<dyn BusClient>;
