//! Remote targets, command building and pending calls

use crate::bus::{ReplyCallback, SharedBus};
use crate::error::{ProxyError, ProxyResult};
use crate::reply::Reply;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::IntoFuture;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Default deadline for a remote call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_micros(1_414_200);

/// Deadline of `secs` seconds; negative, non-finite or overflowing values are rejected
pub fn deadline(secs: f64) -> ProxyResult<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|_| ProxyError::InvalidDeadline(secs))
}

/// A command as delivered to an actor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Correlation id for logs
    pub id: Uuid,
    pub actor: String,
    /// Lowercased, dot-joined command path
    pub command: String,
    /// Positional values followed by `--key value` pairs
    pub args: Vec<String>,
}

impl CommandRequest {
    pub fn new(actor: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor: actor.into(),
            command: command.into(),
            args,
        }
    }

    /// Command string as sent over the bus
    pub fn command_line(&self) -> String {
        let mut line = self.command.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Value following `--key`
    pub fn option(&self, key: &str) -> Option<&str> {
        let flag = format!("--{}", key);
        self.args
            .iter()
            .position(|a| *a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }

    /// Arguments that are neither a `--key` flag nor its value
    pub fn positional(&self) -> Vec<&str> {
        let mut out = Vec::new();
        let mut args = self.args.iter();
        while let Some(arg) = args.next() {
            if arg.starts_with("--") {
                args.next();
            } else {
                out.push(arg.as_str());
            }
        }
        out
    }

    /// Positional argument `index` parsed as a number
    pub fn positional_f64(&self, index: usize) -> Option<f64> {
        self.positional().get(index).and_then(|s| s.parse().ok())
    }
}

/// A named remote actor reachable over a bus
#[derive(Clone)]
pub struct RemoteTarget {
    name: String,
    bus: SharedBus,
    default_timeout: Duration,
}

impl RemoteTarget {
    pub fn new(name: impl Into<String>, bus: SharedBus) -> Self {
        Self {
            name: name.into(),
            bus,
            default_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Override the deadline used by commands built from this target
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Start building a command; `segment` may itself be dotted
    pub fn command(&self, segment: &str) -> CommandBuilder {
        CommandBuilder {
            target: self.clone(),
            path: vec![segment.to_string()],
            args: Vec::new(),
            timeout: self.default_timeout,
            callback: None,
        }
    }
}

impl fmt::Debug for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTarget")
            .field("name", &self.name)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

/// Builder for a single remote call
pub struct CommandBuilder {
    target: RemoteTarget,
    path: Vec<String>,
    args: Vec<String>,
    timeout: Duration,
    callback: Option<ReplyCallback>,
}

impl CommandBuilder {
    /// Append a sub-command segment
    pub fn path(mut self, segment: &str) -> Self {
        self.path.push(segment.to_string());
        self
    }

    /// Append a positional argument
    pub fn arg(mut self, value: impl ToString) -> Self {
        self.args.push(value.to_string());
        self
    }

    /// Append a `--key value` pair
    pub fn kwarg(mut self, key: &str, value: impl ToString) -> Self {
        self.args.push(format!("--{}", key));
        self.args.push(value.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Receive intermediate reply bodies
    pub fn callback(mut self, callback: ReplyCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Command path as sent
    pub fn command_name(&self) -> String {
        self.path.join(".").to_lowercase()
    }

    /// Send without waiting; the returned handle resolves to the reply
    pub fn issue(self) -> PendingCall {
        let command = self.command_name();
        let actor = self.target.name.clone();
        let request = CommandRequest::new(actor.clone(), command.clone(), self.args);
        let bus = self.target.bus.clone();
        let timeout = self.timeout;
        let callback = self.callback;

        tracing::debug!(
            "[{}] -> {} {} (timeout {:?})",
            request.id,
            actor,
            request.command_line(),
            timeout
        );

        let handle = tokio::spawn(async move {
            let id = request.id;
            let (actor, command) = (request.actor.clone(), request.command.clone());
            match tokio::time::timeout(timeout, bus.send_command(request, callback)).await {
                Ok(Ok(reply)) => {
                    tracing::debug!("[{}] <- {} {} did_fail={}", id, actor, command, reply.did_fail());
                    Ok(reply)
                }
                Ok(Err(e)) => {
                    tracing::warn!("[{}] {} {} transport failure: {}", id, actor, command, e);
                    Err(e)
                }
                Err(_) => {
                    tracing::warn!("[{}] {} {} timed out after {:?}", id, actor, command, timeout);
                    Err(ProxyError::timeout(actor, command, timeout))
                }
            }
        });

        PendingCall {
            actor: self.target.name,
            command,
            handle,
        }
    }

    /// Send and wait for the final reply
    pub async fn send(self) -> ProxyResult<Reply> {
        self.issue().wait().await
    }
}

/// An issued command whose reply has not been collected yet.
///
/// The call runs on its own task, so dropping the handle or cancelling the
/// task that awaits it does not interrupt the command on the bus.
pub struct PendingCall {
    actor: String,
    command: String,
    handle: JoinHandle<ProxyResult<Reply>>,
}

impl PendingCall {
    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the reply or the call's deadline
    pub async fn wait(self) -> ProxyResult<Reply> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(ProxyError::Transport(format!(
                "{}.{} task failed: {}",
                self.actor, self.command, e
            ))),
        }
    }
}

impl IntoFuture for PendingCall {
    type Output = ProxyResult<Reply>;
    type IntoFuture = BoxFuture<'static, ProxyResult<Reply>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("actor", &self.actor)
            .field("command", &self.command)
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeout() {
        assert_eq!(DEFAULT_CALL_TIMEOUT.as_micros(), 1_414_200);
    }

    #[test]
    fn test_request_args() {
        let request = CommandRequest::new(
            "lvm.sci.foc",
            "moverelative",
            vec![
                "120".to_string(),
                "--unit".to_string(),
                "STEPS".to_string(),
                "fast".to_string(),
            ],
        );
        assert_eq!(request.command_line(), "moverelative 120 --unit STEPS fast");
        assert_eq!(request.option("unit"), Some("STEPS"));
        assert_eq!(request.option("speed"), None);
        assert_eq!(request.positional(), vec!["120", "fast"]);
        assert_eq!(request.positional_f64(0), Some(120.0));
    }

    #[test]
    fn test_negative_values_are_positional() {
        let request = CommandRequest::new(
            "mount",
            "offset",
            vec![
                "--ra_add_arcsec".to_string(),
                "-1.5".to_string(),
                "-2".to_string(),
            ],
        );
        assert_eq!(request.option("ra_add_arcsec"), Some("-1.5"));
        assert_eq!(request.positional(), vec!["-2"]);
    }
}
