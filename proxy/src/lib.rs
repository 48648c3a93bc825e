//! Remote actor invocation over an RPC-style message bus
//!
//! A [`RemoteTarget`] names an actor on a [`BusClient`]. Commands are built
//! with [`CommandBuilder`], issued as [`PendingCall`]s and collected with
//! [`invoke`] or [`unpack`]. Failure replies are turned back into structured
//! errors through an [`ErrorRegistry`].

pub mod bus;
pub mod command;
pub mod config;
pub mod error;
pub mod invoke;
pub mod local;
pub mod reply;

pub use bus::{BusClient, ReplyCallback, SharedBus};
pub use command::{deadline, CommandBuilder, CommandRequest, PendingCall, RemoteTarget, DEFAULT_CALL_TIMEOUT};
pub use config::ProxyConfig;
pub use error::{ErrorRegistry, ProxyError, ProxyResult, RemoteError, RemoteErrorKind};
pub use invoke::{invoke, invoke_raw, invoke_with, unpack, unpack_as, Unpacked};
pub use local::{ActorHandler, LocalBus, ReplySink};
pub use reply::{Body, Record, Reply, ERROR_KEY};
