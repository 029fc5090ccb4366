//! Wire-format envelope and message bodies.
//!
//! One envelope per frame, JSON on the wire: `{"id": <int>, "msg": <body>}`.
//! Bodies are tagged with a `"type"` discriminator. The envelope is the sole
//! unit of transmission; transports never look inside `msg`.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::status;

/// A per-connection message identifier.
///
/// Non-negative IDs are allocated monotonically from 0 by the originating
/// side. [`MsgId::FORGET`] (`-1`) marks a send-and-forget envelope: no
/// acknowledgement is expected and the peer does not dedup-track it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgId(i64);

impl MsgId {
    /// The send-and-forget sentinel.
    pub const FORGET: MsgId = MsgId(-1);

    /// Wrap a raw wire value.
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Whether this is the send-and-forget sentinel.
    #[must_use]
    pub fn is_forget(self) -> bool {
        self.0 == -1
    }

    /// The raw wire value.
    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request verb carried by a `route` body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    /// Matches any verb-specific intent; used for generic updates.
    Any,
    Get,
    Post,
    Delete,
    /// Subscription-intent marker.
    Listen,
    /// Response-intent marker.
    Response,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verb::Any => "ANY",
            Verb::Get => "GET",
            Verb::Post => "POST",
            Verb::Delete => "DELETE",
            Verb::Listen => "LISTEN",
            Verb::Response => "RESPONSE",
        };
        f.write_str(s)
    }
}

/// A message body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// Set a header entry on the peer (used to install the reconnect secret).
    Set {
        /// Header key.
        key: String,
        /// Header value.
        value: Value,
    },
    /// Liveness probe.
    Ping,
    /// Subscribe the sender to an outbound route pattern.
    On {
        /// Concrete route path.
        route: String,
    },
    /// Unsubscribe the sender from an outbound route.
    Off {
        /// Concrete route path.
        route: String,
    },
    /// Application request targeting a route.
    Route {
        /// Request verb.
        verb: Verb,
        /// Concrete route path.
        route: String,
        /// Request payload.
        data: Value,
        /// Optional per-request headers.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
    },
    /// Acknowledgement / response to the envelope with id `target`.
    Res {
        /// The acknowledged envelope's id.
        target: MsgId,
        /// Wire status code.
        status: u16,
        /// Response payload.
        data: Value,
    },
    /// A body whose `type` discriminator was not recognized.
    ///
    /// Never serialized; produced only by [`Envelope`] deserialization so the
    /// engine can answer with a generic 500 instead of dropping the frame.
    #[serde(skip)]
    Unknown,
}

impl Message {
    /// Short name of the body kind, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Set { .. } => "set",
            Message::Ping => "ping",
            Message::On { .. } => "on",
            Message::Off { .. } => "off",
            Message::Route { .. } => "route",
            Message::Res { .. } => "res",
            Message::Unknown => "unknown",
        }
    }
}

/// The wire unit: a message id paired with a body.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Envelope {
    /// Message id (`-1` for send-and-forget).
    pub id: MsgId,
    /// Message body.
    pub msg: Message,
}

impl Envelope {
    /// An envelope carrying a tracked (id-bearing) message.
    #[must_use]
    pub fn new(id: MsgId, msg: Message) -> Self {
        Self { id, msg }
    }

    /// A send-and-forget envelope.
    #[must_use]
    pub fn forget(msg: Message) -> Self {
        Self {
            id: MsgId::FORGET,
            msg,
        }
    }

    /// Whether the peer owes a response for this envelope.
    ///
    /// `res` bodies are never made to expect a response: an acknowledgement
    /// of an acknowledgement would recurse forever.
    #[must_use]
    pub fn requires_response(&self) -> bool {
        !self.id.is_forget() && !matches!(self.msg, Message::Res { .. })
    }
}

// Hand-rolled so an unrecognized body tag degrades to `Message::Unknown`
// instead of failing the whole frame: the id must survive for the 500 reply.
impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        let raw = Value::deserialize(deserializer)?;
        let id = raw
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| D::Error::custom("envelope is missing an integer 'id'"))?;
        let msg = match raw.get("msg") {
            Some(body) => {
                serde_json::from_value::<Message>(body.clone()).unwrap_or(Message::Unknown)
            }
            None => return Err(D::Error::custom("envelope is missing 'msg'")),
        };
        Ok(Envelope {
            id: MsgId::new(id),
            msg,
        })
    }
}

/// The public shape a tracked send resolves to.
///
/// A wire `res` with status 200 becomes `{data}`; any other terminal status
/// becomes `{error, data: ""}`. Status 202 never surfaces here — the engine
/// treats it as "still processing" and keeps waiting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteReply {
    /// Response payload (empty string on error).
    pub data: Value,
    /// Error message, present when the peer reported a non-200 status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RouteReply {
    /// A successful reply.
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self { data, error: None }
    }

    /// A failed reply.
    #[must_use]
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            data: Value::String(String::new()),
            error: Some(message.into()),
        }
    }

    /// Whether the peer reported an error status.
    #[must_use]
    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }

    /// Translate a terminal wire `res` into the public reply shape.
    #[must_use]
    pub fn from_res(status_code: u16, data: Value) -> Self {
        if status_code == status::OK {
            Self::ok(data)
        } else {
            let message = match data {
                Value::String(s) => s,
                other => other.to_string(),
            };
            Self::err(message)
        }
    }
}
