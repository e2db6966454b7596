//! Wire types for the chat socket.
//!
//! Client → server: `{ "id", "type", "data" }`.
//! Server → requester: `{ "type": "response", "meta": { "requestId", "error" }, "data"? }`.
//! Server → everyone else: `{ "type", "data" }`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RESPONSE_TYPE: &str = "response";
pub const MESSAGE_ADDED: &str = "message.added";
pub const CONVERSATION_UPDATED: &str = "conversation.updated";

/// An inbound request frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: Value,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// A frame that could not be turned into a [`Request`]. Carries whatever
/// request id could still be recovered so the error can be correlated.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{reason}")]
pub struct FrameError {
    pub request_id: Option<Value>,
    pub reason: String,
}

impl Request {
    pub fn parse(raw: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(raw).map_err(|e| FrameError {
            request_id: None,
            reason: format!("Malformed request: {e}"),
        })?;

        let Value::Object(mut obj) = value else {
            return Err(FrameError {
                request_id: None,
                reason: "Malformed request: expected a JSON object".into(),
            });
        };

        let id = obj.remove("id").filter(|v| !v.is_null());
        let kind = obj.remove("type");
        let data = obj.remove("data").unwrap_or(Value::Null);

        let Some(id) = id else {
            return Err(FrameError {
                request_id: None,
                reason: "Malformed request: missing id".into(),
            });
        };
        match kind {
            Some(Value::String(kind)) => Ok(Self { id, kind, data }),
            _ => Err(FrameError {
                request_id: Some(id),
                reason: "Malformed request: missing type".into(),
            }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMeta {
    pub request_id: Option<Value>,
    pub error: Option<String>,
}

/// Reply sent only to the connection that issued the request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: String,
    pub meta: ResponseMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    pub fn ok(request_id: Value, data: Value) -> Self {
        Self {
            kind: RESPONSE_TYPE.into(),
            meta: ResponseMeta {
                request_id: Some(request_id),
                error: None,
            },
            data: Some(data),
        }
    }

    pub fn error(request_id: Option<Value>, message: impl Into<String>) -> Self {
        Self {
            kind: RESPONSE_TYPE.into(),
            meta: ResponseMeta {
                request_id,
                error: Some(message.into()),
            },
            data: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.meta.error.is_some()
    }
}

/// Event fanned out to every other live connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

impl Event {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_full_request() {
        let req = Request::parse(r#"{"id":"r1","type":"user.get","data":{"id":1}}"#).unwrap();
        assert_eq!(req.id, json!("r1"));
        assert_eq!(req.kind, "user.get");
        assert_eq!(req.data["id"], 1);
    }

    #[test]
    fn parse_request_without_data() {
        let req = Request::parse(r#"{"id":7,"type":"attachments.new"}"#).unwrap();
        assert_eq!(req.id, json!(7));
        assert!(req.data.is_null());
    }

    #[test]
    fn parse_invalid_json_has_no_request_id() {
        let err = Request::parse("{not json").unwrap_err();
        assert_eq!(err.request_id, None);
        assert!(err.reason.starts_with("Malformed request"));
    }

    #[test]
    fn parse_missing_type_keeps_request_id() {
        let err = Request::parse(r#"{"id":"abc","data":{}}"#).unwrap_err();
        assert_eq!(err.request_id, Some(json!("abc")));
    }

    #[test]
    fn parse_non_object_rejected() {
        assert!(Request::parse("[1,2]").is_err());
        assert!(Request::parse(r#"{"type":"x"}"#).is_err());
    }

    #[test]
    fn ok_response_shape() {
        let resp = Response::ok(json!("x"), json!({"a": 1}));
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v, json!({"type": "response", "meta": {"requestId": "x", "error": null}, "data": {"a": 1}}));
    }

    #[test]
    fn error_response_omits_data() {
        let resp = Response::error(Some(json!("x")), "Unknown request type: 'bogus'");
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            v,
            json!({"type": "response", "meta": {"requestId": "x", "error": "Unknown request type: 'bogus'"}})
        );
        assert!(resp.is_error());
    }

    #[test]
    fn event_shape() {
        let v = serde_json::to_value(Event::new(MESSAGE_ADDED, json!({"id": 1}))).unwrap();
        assert_eq!(v, json!({"type": "message.added", "data": {"id": 1}}));
    }
}
