//! Transport capabilities required by the value core.
//!
//! The core never talks to a socket. It needs exactly four things from
//! whatever carries its messages: register a procedure, call a procedure,
//! publish on a named broadcast event and subscribe to one. The server and
//! client halves are split into two traits so an authority can only be
//! built on a server handle and a mirror only on a client handle.
//!
//! For a value named `X` the get-procedure is `get-X`, the set-procedure is
//! `set-X` (taking `{"value": v}`) and the broadcast event is `X`.

pub mod local;

use std::sync::Arc;

use crate::error::Result;

/// Already-deserialized message body
pub type Payload = serde_json::Value;

/// A remotely callable procedure: params in, result out
pub type Procedure = Arc<dyn Fn(Option<Payload>) -> Result<Payload> + Send + Sync>;

/// Receives every broadcast published on a subscribed event. Returns
/// `false` once its receiver is gone; the transport then drops it.
pub type NotificationHandler = Arc<dyn Fn(Payload) -> bool + Send + Sync>;

/// Completion of a remote call, invoked later by the transport. Replies
/// and broadcasts from one peer run in the order they arrived.
pub type Reply = Box<dyn FnOnce(Result<Payload>) + Send + Sync>;

/// Name of the single field carried by set-procedure params
pub const VALUE_PARAM: &str = "value";

/// Server-side half: owns procedures and outbound broadcast events
pub trait ServerTransport: Send + Sync {
    /// Create an outbound fan-out event
    fn declare_event(&self, event: &str);

    /// Expose a callable under `method`, replacing any previous one
    fn register(&self, method: &str, procedure: Procedure);

    /// Send `payload` to every current subscriber of `event`
    fn emit(&self, event: &str, payload: Payload);
}

/// Client-side half: calls procedures and receives broadcasts
pub trait ClientTransport: Send + Sync {
    /// Receive every broadcast published on `event`
    fn subscribe(&self, event: &str, handler: NotificationHandler);

    /// Invoke `method`; `reply` runs once the result (or failure) is known
    fn call(&self, method: &str, params: Option<Payload>, reply: Reply);
}

impl<S: ServerTransport + ?Sized> ServerTransport for Arc<S> {
    fn declare_event(&self, event: &str) {
        (**self).declare_event(event)
    }

    fn register(&self, method: &str, procedure: Procedure) {
        (**self).register(method, procedure)
    }

    fn emit(&self, event: &str, payload: Payload) {
        (**self).emit(event, payload)
    }
}

impl<C: ClientTransport + ?Sized> ClientTransport for Arc<C> {
    fn subscribe(&self, event: &str, handler: NotificationHandler) {
        (**self).subscribe(event, handler)
    }

    fn call(&self, method: &str, params: Option<Payload>, reply: Reply) {
        (**self).call(method, params, reply)
    }
}

/// Procedure returning the current value of `name`
pub fn get_method(name: &str) -> String {
    format!("get-{name}")
}

/// Procedure requesting a change of `name`
pub fn set_method(name: &str) -> String {
    format!("set-{name}")
}

/// Params for the set-procedure
pub fn set_params(value: Payload) -> Payload {
    let mut params = serde_json::Map::new();
    params.insert(VALUE_PARAM.to_string(), value);
    Payload::Object(params)
}

/// Extract the value carried by set-procedure params.
///
/// A missing field, missing params and an explicit `null` all mean "absent".
pub fn value_param(params: Option<Payload>) -> Result<Payload> {
    match params {
        None | Some(Payload::Null) => Ok(Payload::Null),
        Some(Payload::Object(mut map)) => Ok(map.remove(VALUE_PARAM).unwrap_or(Payload::Null)),
        Some(other) => Err(crate::Error::InvalidParams(format!(
            "expected an object with a `{VALUE_PARAM}` field, got {other}"
        ))),
    }
}
