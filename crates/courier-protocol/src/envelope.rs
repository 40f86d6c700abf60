//! Envelope types shared by all three transports.
//!
//! Requests arrive as JSON text frames (or HTTP bodies for the polling
//! surface) and are deliberately loose: every field except `type` is
//! optional and typed as a raw [`serde_json::Value`] so that validation
//! errors become response envelopes instead of decode failures.

use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Extra metadata attached to a message envelope.
pub type Meta = serde_json::Map<String, Value>;

/// A channel key: a string or an integer, equal only by exact value and
/// type. Length and wildcard rules are enforced by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelKey {
    /// Named channel.
    Name(String),
    /// Numeric channel.
    Num(i64),
}

impl ChannelKey {
    /// The key as a JSON value (string or number).
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            ChannelKey::Name(s) => Value::String(s.clone()),
            ChannelKey::Num(n) => Value::from(*n),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKey::Name(s) => f.write_str(s),
            ChannelKey::Num(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for ChannelKey {
    fn from(s: &str) -> Self {
        ChannelKey::Name(s.to_string())
    }
}

impl From<i64> for ChannelKey {
    fn from(n: i64) -> Self {
        ChannelKey::Num(n)
    }
}

/// An inbound request, identical across transports.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Request {
    /// Operation name: `send`, `open`, `close`, `auth` or `ping`.
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    /// Caller-chosen correlation id, echoed back in the response.
    #[serde(default)]
    pub id: Option<Value>,
    /// Target channel for `send`/`open`/`close`.
    #[serde(default)]
    pub channel: Option<Value>,
    /// Opaque payload for `send`.
    #[serde(default)]
    pub message: Option<Value>,
    /// Caller-supplied extra meta fields for `send`.
    #[serde(default)]
    pub meta: Option<Value>,
    /// Authentication token for `auth`.
    #[serde(default)]
    pub token: Option<Value>,
}

impl Request {
    /// The normalized correlation id: the numeric `id` field, or `1` when
    /// missing or non-numeric.
    #[must_use]
    pub fn request_id(&self) -> i64 {
        self.id.as_ref().and_then(Value::as_i64).unwrap_or(1)
    }
}

/// The synchronous response to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Whether the operation succeeded.
    pub ok: bool,
    /// Echo of the request's correlation id.
    pub id: i64,
    /// The client's current public identity.
    pub uuid: String,
    /// Error code when `ok` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Drained outbound queue; only present on polling `update` responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<Vec<Outbound>>,
}

impl Response {
    /// A success response.
    #[must_use]
    pub fn ok(id: i64, uuid: impl Into<String>) -> Self {
        Self {
            ok: true,
            id,
            uuid: uuid.into(),
            error: None,
            queue: None,
        }
    }

    /// A failure response carrying the error code.
    #[must_use]
    pub fn err(id: i64, uuid: impl Into<String>, error: RelayError) -> Self {
        Self {
            ok: false,
            id,
            uuid: uuid.into(),
            error: Some(error.to_string()),
            queue: None,
        }
    }
}

/// Server-initiated envelopes pushed outside the request/response cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Push {
    /// A relayed message fanned out to channel subscribers.
    Message {
        /// The channel the recipient sees (rewritten to the wildcard key
        /// on the wildcard fan-out).
        channel: ChannelKey,
        /// Opaque sender payload.
        message: Value,
        /// Sender metadata plus caller-supplied extras.
        meta: Meta,
    },
    /// Periodic liveness push on persistent connections.
    Ping {
        /// The client's current identity.
        uuid: String,
    },
    /// One-time welcome pushed on connect.
    Motd {
        /// Configured greeting string.
        motd: String,
        /// The client's identity.
        uuid: String,
    },
}

/// Anything the server can hand to a client's deliver capability.
///
/// Persistent transports write these straight to the socket; the polling
/// transport buffers them in the session queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Outbound {
    /// A server push (`message`, `ping`, `motd`).
    Push(Push),
    /// A request response.
    Response(Response),
}

/// Response to the polling `GET /connect` handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectResponse {
    /// Always true.
    pub ok: bool,
    /// Configured greeting string.
    pub motd: String,
    /// The session's public identity.
    pub uuid: String,
    /// Opaque per-session polling credential.
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_decodes_with_missing_fields() {
        let req: Request = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(req.kind.as_deref(), Some("ping"));
        assert!(req.channel.is_none());
        assert_eq!(req.request_id(), 1);
    }

    #[test]
    fn test_request_id_normalization() {
        let req: Request = serde_json::from_str(r#"{"type":"send","id":7}"#).unwrap();
        assert_eq!(req.request_id(), 7);

        let req: Request = serde_json::from_str(r#"{"type":"send","id":"nope"}"#).unwrap();
        assert_eq!(req.request_id(), 1);
    }

    #[test]
    fn test_channel_key_untagged() {
        let key: ChannelKey = serde_json::from_value(json!("room1")).unwrap();
        assert_eq!(key, ChannelKey::from("room1"));

        let key: ChannelKey = serde_json::from_value(json!(42)).unwrap();
        assert_eq!(key, ChannelKey::from(42));

        assert_eq!(serde_json::to_value(ChannelKey::from(42)).unwrap(), json!(42));
    }

    #[test]
    fn test_response_omits_empty_fields() {
        let value = serde_json::to_value(Response::ok(3, "aXYZ")).unwrap();
        assert_eq!(value, json!({"ok": true, "id": 3, "uuid": "aXYZ"}));

        let value =
            serde_json::to_value(Response::err(1, "aXYZ", RelayError::InvalidChannelKey)).unwrap();
        assert_eq!(
            value,
            json!({"ok": false, "id": 1, "uuid": "aXYZ", "error": "InvalidChannelKey"})
        );
    }

    #[test]
    fn test_push_message_shape() {
        let push = Push::Message {
            channel: ChannelKey::from("room1"),
            message: json!("hi"),
            meta: Meta::new(),
        };
        let value = serde_json::to_value(&push).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["channel"], "room1");
    }

    #[test]
    fn test_outbound_roundtrip() {
        let entries = vec![
            Outbound::Response(Response::ok(1, "gABC")),
            Outbound::Push(Push::Ping {
                uuid: "gABC".into(),
            }),
        ];
        let text = serde_json::to_string(&entries).unwrap();
        let back: Vec<Outbound> = serde_json::from_str(&text).unwrap();
        assert_eq!(back, entries);
    }
}
