//! Command replies and attribute-accessible records

use crate::error::{ErrorRegistry, ProxyError, ProxyResult, RemoteError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One reply message body
pub type Body = Map<String, Value>;

/// Key under which failure replies carry the serialized error
pub const ERROR_KEY: &str = "error";

/// Final reply to a remote command.
///
/// Bodies are in arrival order and the last one is authoritative. A failed
/// reply always carries a non-empty error string in its last body, and a
/// successful reply always has at least one body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    did_fail: bool,
    bodies: Vec<Body>,
}

impl Reply {
    /// Build a reply, checking the success/failure invariants
    pub fn new(did_fail: bool, bodies: Vec<Body>) -> ProxyResult<Self> {
        if did_fail {
            let has_error = bodies
                .last()
                .and_then(|b| b.get(ERROR_KEY))
                .and_then(Value::as_str)
                .map(|s| !s.is_empty())
                .unwrap_or(false);
            if !has_error {
                return Err(ProxyError::InvalidReply(
                    "failed reply without an error payload".to_string(),
                ));
            }
        } else if bodies.is_empty() {
            return Err(ProxyError::InvalidReply(
                "successful reply without a body".to_string(),
            ));
        }
        Ok(Self { did_fail, bodies })
    }

    pub fn success(body: Body) -> Self {
        Self {
            did_fail: false,
            bodies: vec![body],
        }
    }

    /// Successful reply preceded by intermediate bodies
    pub fn success_with(mut intermediate: Vec<Body>, body: Body) -> Self {
        intermediate.push(body);
        Self {
            did_fail: false,
            bodies: intermediate,
        }
    }

    pub fn failure(error: &RemoteError) -> Self {
        Self::failure_with(Vec::new(), error)
    }

    /// Failed reply preceded by intermediate bodies
    pub fn failure_with(mut intermediate: Vec<Body>, error: &RemoteError) -> Self {
        let mut wire = error.to_wire();
        if wire.is_empty() {
            wire = error.kind.name().to_string();
        }
        let mut body = Body::new();
        body.insert(ERROR_KEY.to_string(), Value::String(wire));
        intermediate.push(body);
        Self {
            did_fail: true,
            bodies: intermediate,
        }
    }

    pub fn did_fail(&self) -> bool {
        self.did_fail
    }

    pub fn bodies(&self) -> &[Body] {
        &self.bodies
    }

    /// Authoritative body
    pub fn last_body(&self) -> Option<&Body> {
        self.bodies.last()
    }

    pub fn into_last_body(mut self) -> Body {
        self.bodies.pop().unwrap_or_default()
    }

    /// Raw error string of a failed reply
    pub fn error_string(&self) -> Option<&str> {
        if !self.did_fail {
            return None;
        }
        self.last_body()
            .and_then(|b| b.get(ERROR_KEY))
            .and_then(Value::as_str)
    }

    /// Reconstituted error of a failed reply
    pub fn error(&self, registry: &ErrorRegistry) -> Option<RemoteError> {
        self.error_string().map(|raw| registry.reconstitute(raw))
    }
}

/// Reply body with typed, attribute-style access
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    actor: String,
    body: Body,
}

impl Record {
    pub fn new(actor: impl Into<String>, body: Body) -> Self {
        Self {
            actor: actor.into(),
            body,
        }
    }

    /// Actor that produced this record
    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.body.keys().map(String::as_str)
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// Typed value under `key`, `None` if missing or of the wrong type
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.body
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Typed value under `key`, failing if missing or of the wrong type
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> ProxyResult<T> {
        let value = self.body.get(key).ok_or_else(|| ProxyError::MissingKey {
            actor: self.actor.clone(),
            key: key.to_string(),
        })?;
        serde_json::from_value(value.clone())
            .map_err(|e| ProxyError::malformed(&self.actor, format!("key '{}': {}", key, e)))
    }

    /// Walk a dotted path through nested maps
    pub fn path(&self, dotted: &str) -> Option<&Value> {
        let mut segments = dotted.split('.');
        let first = segments.next()?;
        let mut current = self.body.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Nested map under `key` as its own record
    pub fn record(&self, key: &str) -> Option<Record> {
        self.body
            .get(key)
            .and_then(Value::as_object)
            .map(|body| Record::new(self.actor.clone(), body.clone()))
    }

    /// Deserialize the whole body into a typed struct
    pub fn deserialize<T: DeserializeOwned>(&self) -> ProxyResult<T> {
        serde_json::from_value(Value::Object(self.body.clone()))
            .map_err(|e| ProxyError::malformed(&self.actor, e.to_string()))
    }

    pub fn as_body(&self) -> &Body {
        &self.body
    }

    pub fn into_body(self) -> Body {
        self.body
    }
}
