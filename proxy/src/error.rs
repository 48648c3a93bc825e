//! Proxy error types
//!
//! Failure replies carry their error as a string on the wire. The
//! [`ErrorRegistry`] turns that string back into a structured [`RemoteError`]
//! by looking the kind name up in a table of registered constructors. Strings
//! that do not name a registered kind are kept verbatim under
//! [`RemoteErrorKind::PlainMessage`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;

/// Kinds of error a remote actor can report in a failure reply
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    /// A lower-level actor the remote depends on is not running
    ActorMissing,
    /// The remote refused because it is busy with another operation
    NotIdle,
    /// The remote is in a state that does not allow the command
    InvalidState,
    /// Command arguments were rejected
    InvalidArgument,
    /// The hardware behind the actor reported a fault
    HardwareFault,
    /// The remote itself timed out talking to its hardware
    Timeout,
    /// The command exists but is not implemented by this actor
    NotImplemented,
    /// A kind registered at runtime through [`ErrorRegistry::register_kind`]
    Custom(String),
    /// The error string did not name a registered kind
    PlainMessage,
}

impl RemoteErrorKind {
    /// Wire name of the kind
    pub fn name(&self) -> &str {
        match self {
            RemoteErrorKind::ActorMissing => "ActorMissing",
            RemoteErrorKind::NotIdle => "NotIdle",
            RemoteErrorKind::InvalidState => "InvalidState",
            RemoteErrorKind::InvalidArgument => "InvalidArgument",
            RemoteErrorKind::HardwareFault => "HardwareFault",
            RemoteErrorKind::Timeout => "Timeout",
            RemoteErrorKind::NotImplemented => "NotImplemented",
            RemoteErrorKind::Custom(name) => name,
            RemoteErrorKind::PlainMessage => "PlainMessage",
        }
    }

    const BUILTIN: [RemoteErrorKind; 7] = [
        RemoteErrorKind::ActorMissing,
        RemoteErrorKind::NotIdle,
        RemoteErrorKind::InvalidState,
        RemoteErrorKind::InvalidArgument,
        RemoteErrorKind::HardwareFault,
        RemoteErrorKind::Timeout,
        RemoteErrorKind::NotImplemented,
    ];
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Structured error reported by a remote actor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Wrap an unparseable error string without losing any of it
    pub fn plain(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::PlainMessage, message)
    }

    /// Serialize for the `error` field of a failure reply
    pub fn to_wire(&self) -> String {
        self.to_string()
    }
}

impl std::error::Error for RemoteError {}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, self.message.is_empty()) {
            (RemoteErrorKind::PlainMessage, _) => f.write_str(&self.message),
            (kind, true) => write!(f, "{}", kind),
            (kind, false) => write!(f, "{}: {}", kind, self.message),
        }
    }
}

type ErrorConstructor = Arc<dyn Fn(String) -> RemoteError + Send + Sync>;

/// Lookup table from error-kind names to constructors
#[derive(Clone)]
pub struct ErrorRegistry {
    constructors: HashMap<String, ErrorConstructor>,
}

impl ErrorRegistry {
    /// Registry without any kinds; everything reconstitutes as a plain message
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Shared registry holding the builtin kinds
    pub fn builtin() -> &'static ErrorRegistry {
        static BUILTIN: OnceLock<ErrorRegistry> = OnceLock::new();
        BUILTIN.get_or_init(ErrorRegistry::default)
    }

    /// Register a constructor for `name`, replacing any previous one
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(String) -> RemoteError + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Arc::new(constructor));
    }

    /// Register `name` as a [`RemoteErrorKind::Custom`] kind
    pub fn register_kind(&mut self, name: impl Into<String>) {
        let name = name.into();
        let kind_name = name.clone();
        self.register(name, move |message| {
            RemoteError::new(RemoteErrorKind::Custom(kind_name.clone()), message)
        });
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Rebuild a structured error from its wire string.
    ///
    /// Accepts `Kind` and `Kind: message`. Anything else, including a
    /// well-formed string naming an unregistered kind, is returned as a
    /// plain message holding the raw string.
    pub fn reconstitute(&self, raw: &str) -> RemoteError {
        let (name, message) = match raw.split_once(": ") {
            Some((name, message)) => (name, message),
            None => (raw, ""),
        };

        if !is_kind_name(name) {
            return RemoteError::plain(raw);
        }

        match self.constructors.get(name) {
            Some(constructor) => constructor(message.to_string()),
            None => RemoteError::plain(raw),
        }
    }
}

impl Default for ErrorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        for kind in RemoteErrorKind::BUILTIN {
            let name = kind.name().to_string();
            registry.register(name, move |message| RemoteError::new(kind.clone(), message));
        }
        registry
    }
}

impl fmt::Debug for ErrorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.constructors.keys().collect();
        names.sort();
        f.debug_struct("ErrorRegistry").field("kinds", &names).finish()
    }
}

fn is_kind_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
        _ => false,
    }
}

/// Errors raised by the remote proxy layer
#[derive(Debug, Clone, Error)]
pub enum ProxyError {
    #[error("{actor}.{command} failed: {error}")]
    RemoteCallFailed {
        actor: String,
        command: String,
        error: RemoteError,
    },

    #[error("{actor}.{command} timed out after {duration:?}")]
    Timeout {
        actor: String,
        command: String,
        duration: Duration,
    },

    #[error("Actor not reachable: {0}")]
    ActorUnreachable(String),

    #[error("{} of {} invoked calls failed", count_failed(.0), .0.len())]
    AggregateInvocationFailed(Vec<Option<ProxyError>>),

    #[error("Reply from {actor} is missing key '{key}'")]
    MissingKey { actor: String, key: String },

    #[error("Malformed reply from {actor}: {message}")]
    MalformedReply { actor: String, message: String },

    #[error("Reply violates invariant: {0}")]
    InvalidReply(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid call deadline: {0} s")]
    InvalidDeadline(f64),
}

fn count_failed(errors: &[Option<ProxyError>]) -> usize {
    errors.iter().filter(|e| e.is_some()).count()
}

impl ProxyError {
    pub fn timeout(actor: impl Into<String>, command: impl Into<String>, duration: Duration) -> Self {
        ProxyError::Timeout {
            actor: actor.into(),
            command: command.into(),
            duration,
        }
    }

    pub fn malformed(actor: impl Into<String>, message: impl Into<String>) -> Self {
        ProxyError::MalformedReply {
            actor: actor.into(),
            message: message.into(),
        }
    }

    /// The remote's own error, for a failed single call
    pub fn remote_error(&self) -> Option<&RemoteError> {
        match self {
            ProxyError::RemoteCallFailed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Per-call outcomes of a failed fan-out, `None` where the call succeeded
    pub fn failures(&self) -> Option<&[Option<ProxyError>]> {
        match self {
            ProxyError::AggregateInvocationFailed(errors) => Some(errors),
            _ => None,
        }
    }

    /// True when the error means the remote command surface is not usable
    pub fn is_command_surface_failure(&self) -> bool {
        match self {
            ProxyError::RemoteCallFailed { .. }
            | ProxyError::Timeout { .. }
            | ProxyError::ActorUnreachable(_)
            | ProxyError::Transport(_) => true,
            ProxyError::AggregateInvocationFailed(errors) => errors
                .iter()
                .flatten()
                .any(ProxyError::is_command_surface_failure),
            ProxyError::MissingKey { .. }
            | ProxyError::MalformedReply { .. }
            | ProxyError::InvalidReply(_)
            | ProxyError::InvalidDeadline(_) => false,
        }
    }
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;
