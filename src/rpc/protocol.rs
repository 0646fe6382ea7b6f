//! JSON-RPC 2.0 frames as exchanged over the WebSocket.
//!
//! Requests and responses are plain JSON-RPC 2.0. Broadcasts use the
//! `{"notification": event, "params": [value]}` shape, and subscriptions are
//! managed with the reserved `rpc.on` / `rpc.off` methods, whose result maps
//! every requested event to `"ok"` or to [`EVENT_INVALID`].

use serde::{Deserialize, Serialize};

use crate::error::{codes, Error};
use crate::transport::Payload;

pub const VERSION: &str = "2.0";

/// Reserved method subscribing the caller to events
pub const SUBSCRIBE: &str = "rpc.on";

/// Reserved method unsubscribing the caller from events
pub const UNSUBSCRIBE: &str = "rpc.off";

pub const EVENT_OK: &str = "ok";

/// Subscription answer for an event the server never declared
pub const EVENT_INVALID: &str = "provided event invalid";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Payload>,
    /// Absent for fire-and-forget requests, which get no response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl Request {
    pub fn call(id: u64, method: impl Into<String>, params: Option<Payload>) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            method: method.into(),
            params,
            id: Some(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
}

impl From<&Error> for ErrorObject {
    fn from(e: &Error) -> Self {
        Self {
            code: e.rpc_code(),
            message: e.to_string(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    /// `Some(Null)` serializes as `"result": null`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    pub id: Option<u64>,
}

impl Response {
    pub fn success(id: u64, result: Payload) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            result: Some(result),
            error: None,
            id: Some(id),
        }
    }

    pub fn failure(id: Option<u64>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: VERSION.to_string(),
            result: None,
            error: Some(ErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }

    pub fn from_result(id: u64, result: crate::Result<Payload>) -> Self {
        match result {
            Ok(result) => Self::success(id, result),
            Err(e) => {
                let error = ErrorObject::from(&e);
                Self::failure(Some(id), error.code, error.message)
            }
        }
    }

    pub fn parse_error() -> Self {
        Self::failure(None, codes::PARSE_ERROR, "Parse error")
    }

    /// The outcome as seen by the caller. A missing `result` reads as `null`.
    pub fn into_result(self) -> crate::Result<Payload> {
        match self.error {
            Some(error) => Err(Error::Remote {
                code: error.code,
                message: error.message,
            }),
            None => Ok(self.result.unwrap_or(Payload::Null)),
        }
    }
}

/// Server-to-client broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub notification: String,
    #[serde(default)]
    pub params: Payload,
}

impl Notification {
    pub fn new(event: impl Into<String>, value: Payload) -> Self {
        Self {
            notification: event.into(),
            params: Payload::Array(vec![value]),
        }
    }

    /// The broadcast value: the first positional param, or the params
    /// themselves when they are not positional.
    pub fn into_value(self) -> Payload {
        match self.params {
            Payload::Array(mut values) if !values.is_empty() => values.swap_remove(0),
            Payload::Array(_) => Payload::Null,
            other => other,
        }
    }
}

/// Anything the client can receive
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Incoming {
    Notification(Notification),
    Response(Response),
}

/// Event names carried by `rpc.on` / `rpc.off` params
pub fn event_names(params: Option<Payload>) -> crate::Result<Vec<String>> {
    match params {
        Some(Payload::Array(names)) => names
            .into_iter()
            .map(|name| match name {
                Payload::String(name) => Ok(name),
                other => Err(Error::InvalidParams(format!("event name must be a string, got {other}"))),
            })
            .collect(),
        Some(Payload::String(name)) => Ok(vec![name]),
        _ => Err(Error::InvalidParams("expected a list of event names".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_shape() {
        let request = Request::call(1, "set-foo", Some(json!({ "value": 777 })));
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({ "jsonrpc": "2.0", "method": "set-foo", "params": { "value": 777 }, "id": 1 })
        );

        let bare = Request::call(2, "get-foo", None);
        assert_eq!(
            serde_json::to_value(&bare).unwrap(),
            json!({ "jsonrpc": "2.0", "method": "get-foo", "id": 2 })
        );
    }

    #[test]
    fn test_null_result_is_kept() {
        let response = Response::success(3, Payload::Null);
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({ "jsonrpc": "2.0", "result": null, "id": 3 })
        );
    }

    #[test]
    fn test_error_response() {
        let response = Response::from_result(4, Err(Error::MethodNotFound("get-bar".into())));
        let wire = serde_json::to_value(&response).unwrap();
        assert_eq!(wire["error"]["code"], json!(codes::METHOD_NOT_FOUND));
        assert!(wire.get("result").is_none());

        match response.into_result() {
            Err(Error::Remote { code, .. }) => assert_eq!(code, codes::METHOD_NOT_FOUND),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_incoming_discrimination() {
        let note: Incoming =
            serde_json::from_str(r#"{"notification":"foo","params":[666]}"#).unwrap();
        match note {
            Incoming::Notification(n) => {
                assert_eq!(n.notification, "foo");
                assert_eq!(n.into_value(), json!(666));
            }
            other => panic!("unexpected {other:?}"),
        }

        let response: Incoming =
            serde_json::from_str(r#"{"jsonrpc":"2.0","result":null,"id":7}"#).unwrap();
        match response {
            Incoming::Response(r) => {
                assert_eq!(r.id, Some(7));
                assert_eq!(r.into_result().unwrap(), Payload::Null);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_notification_values() {
        assert_eq!(Notification::new("foo", json!(1)).into_value(), json!(1));
        let reset = Notification::new("foo", Payload::Null);
        assert_eq!(
            serde_json::to_value(&reset).unwrap(),
            json!({ "notification": "foo", "params": [null] })
        );
        let keyed = Notification {
            notification: "foo".into(),
            params: json!({ "a": 1 }),
        };
        assert_eq!(keyed.into_value(), json!({ "a": 1 }));
    }

    #[test]
    fn test_event_names() {
        assert_eq!(event_names(Some(json!(["a", "b"]))).unwrap(), vec!["a", "b"]);
        assert_eq!(event_names(Some(json!("a"))).unwrap(), vec!["a"]);
        assert!(event_names(Some(json!([1]))).is_err());
        assert!(event_names(None).is_err());
    }
}
