//! Concurrent fan-out over pending calls, and reply unpacking

use crate::command::PendingCall;
use crate::error::{ErrorRegistry, ProxyError, ProxyResult};
use crate::reply::{Body, Record, Reply};
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Await all `calls` and return their final bodies as records, in call order.
///
/// Every call is allowed to finish. With more than one call, any failure
/// yields [`ProxyError::AggregateInvocationFailed`] holding one entry per call
/// (`None` where the call succeeded). With exactly one call its own error is
/// returned unwrapped.
pub async fn invoke<I>(calls: I) -> ProxyResult<Vec<Record>>
where
    I: IntoIterator<Item = PendingCall>,
{
    invoke_with(calls, ErrorRegistry::builtin()).await
}

/// [`invoke`] returning plain key/value maps
pub async fn invoke_raw<I>(calls: I) -> ProxyResult<Vec<Body>>
where
    I: IntoIterator<Item = PendingCall>,
{
    let replies = gather(calls.into_iter().collect(), ErrorRegistry::builtin()).await?;
    Ok(replies
        .into_iter()
        .map(|(_, reply)| reply.into_last_body())
        .collect())
}

/// [`invoke`] with a caller-supplied error registry
pub async fn invoke_with<I>(calls: I, registry: &ErrorRegistry) -> ProxyResult<Vec<Record>>
where
    I: IntoIterator<Item = PendingCall>,
{
    let replies = gather(calls.into_iter().collect(), registry).await?;
    Ok(replies
        .into_iter()
        .map(|(actor, reply)| Record::new(actor, reply.into_last_body()))
        .collect())
}

async fn gather(mut calls: Vec<PendingCall>, registry: &ErrorRegistry) -> ProxyResult<Vec<(String, Reply)>> {
    if calls.len() == 1 {
        if let Some(call) = calls.pop() {
            let actor = call.actor().to_string();
            let command = call.command().to_string();
            let reply = call.wait().await?;
            let reply = check_reply(&actor, &command, reply, registry)?;
            return Ok(vec![(actor, reply)]);
        }
    }

    let outcomes = join_all(calls.into_iter().map(|call| async move {
        let actor = call.actor().to_string();
        let command = call.command().to_string();
        let outcome = call.wait().await;
        (actor, command, outcome)
    }))
    .await;

    let mut errors = Vec::with_capacity(outcomes.len());
    let mut replies = Vec::with_capacity(outcomes.len());
    let mut failed = false;

    for (actor, command, outcome) in outcomes {
        match outcome.and_then(|reply| check_reply(&actor, &command, reply, registry)) {
            Ok(reply) => {
                errors.push(None);
                replies.push((actor, reply));
            }
            Err(e) => {
                failed = true;
                errors.push(Some(e));
            }
        }
    }

    if failed {
        tracing::warn!(
            "Invocation of {} calls failed: {}",
            errors.len(),
            errors
                .iter()
                .flatten()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ")
        );
        return Err(ProxyError::AggregateInvocationFailed(errors));
    }
    Ok(replies)
}

fn check_reply(actor: &str, command: &str, reply: Reply, registry: &ErrorRegistry) -> ProxyResult<Reply> {
    if !reply.did_fail() {
        return Ok(reply);
    }
    let error = registry.reconstitute(reply.error_string().unwrap_or_default());
    Err(ProxyError::RemoteCallFailed {
        actor: actor.to_string(),
        command: command.to_string(),
        error,
    })
}

/// Values extracted from a reply body by [`unpack`]
#[derive(Debug, Clone, PartialEq)]
pub enum Unpacked {
    Empty,
    Single(Value),
    Many(Vec<Value>),
}

impl Unpacked {
    pub fn into_vec(self) -> Vec<Value> {
        match self {
            Unpacked::Empty => Vec::new(),
            Unpacked::Single(v) => vec![v],
            Unpacked::Many(vs) => vs,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Unpacked::Empty => Value::Null,
            Unpacked::Single(v) => v,
            Unpacked::Many(vs) => Value::Array(vs),
        }
    }
}

/// Await one call and pull values out of its final body.
///
/// Empty body gives [`Unpacked::Empty`]. A single-key body gives that value.
/// Otherwise the values for `keys` are returned in the order asked, or all
/// values in body order when `keys` is empty. A requested key missing from
/// the body is an error.
pub async fn unpack(call: PendingCall, keys: &[&str]) -> ProxyResult<Unpacked> {
    let mut records = invoke(std::iter::once(call)).await?;
    let record = records
        .pop()
        .ok_or_else(|| ProxyError::InvalidReply("no reply to unpack".to_string()))?;
    unpack_record(&record, keys)
}

/// [`unpack`] deserialized into `T`, e.g. a tuple for several keys
pub async fn unpack_as<T: DeserializeOwned>(call: PendingCall, keys: &[&str]) -> ProxyResult<T> {
    let actor = call.actor().to_string();
    let value = unpack(call, keys).await?.into_value();
    serde_json::from_value(value).map_err(|e| ProxyError::malformed(actor, e.to_string()))
}

pub(crate) fn unpack_record(record: &Record, keys: &[&str]) -> ProxyResult<Unpacked> {
    let body = record.as_body();
    if body.is_empty() {
        return Ok(Unpacked::Empty);
    }
    if body.len() == 1 {
        if let Some(value) = body.values().next() {
            return Ok(Unpacked::Single(value.clone()));
        }
    }
    if keys.is_empty() {
        return Ok(Unpacked::Many(body.values().cloned().collect()));
    }

    let values = keys
        .iter()
        .map(|key| {
            body.get(*key).cloned().ok_or_else(|| ProxyError::MissingKey {
                actor: record.actor().to_string(),
                key: key.to_string(),
            })
        })
        .collect::<ProxyResult<Vec<_>>>()?;

    match <[Value; 1]>::try_from(values) {
        Ok([single]) => Ok(Unpacked::Single(single)),
        Err(values) => Ok(Unpacked::Many(values)),
    }
}
