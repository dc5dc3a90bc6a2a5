//! Sync protocol message types
//!
//! Outgoing operations are sent as one JSON array per flush, each operation a
//! positional record led by a numeric tag. The tags and field order are shared
//! with the server and must not change.

use serde::ser::{Serialize, Serializer};
use serde::Deserialize;
use serde_json::Value;

/// Wire tags of outgoing operations
pub mod tag {
    pub const SUBSCRIBE: u8 = 1;
    pub const UNSUBSCRIBE: u8 = 2;
    pub const GET: u8 = 3;
    pub const RESEND: u8 = 4;
    pub const CALL: u8 = 5;
    pub const AUTH: u8 = 6;
    pub const TRACK: u8 = 7;
}

/// One queued outgoing operation
#[derive(Debug, Clone, PartialEq)]
pub enum ClientOp {
    /// Start (or refresh) a live subscription
    Subscribe {
        id: u64,
        query: Value,
        name: Option<String>,
        /// Checksum of the cached value; the server skips the payload if unchanged
        checksum: Option<u64>,
        /// Ask for a reply even when the checksum is still current
        reply_unchanged: bool,
    },
    /// Stop a live subscription
    Unsubscribe { id: u64 },
    /// One-shot fetch
    Get {
        id: u64,
        query: Value,
        name: Option<String>,
        checksum: Option<u64>,
    },
    /// Ask for the full value after a diff could not be applied
    Resend { id: u64 },
    /// Function call awaiting a correlated response
    Call {
        request_id: u32,
        name: String,
        payload: Value,
    },
    /// Token change (`None` logs out)
    Auth {
        token: Option<String>,
        options: Option<Value>,
    },
    /// Fire-and-forget analytics event
    Track {
        event: String,
        payload: Option<Value>,
    },
}

impl ClientOp {
    /// Subscription id this operation refers to, if any
    pub fn subscription_id(&self) -> Option<u64> {
        match self {
            ClientOp::Subscribe { id, .. }
            | ClientOp::Unsubscribe { id }
            | ClientOp::Get { id, .. }
            | ClientOp::Resend { id } => Some(*id),
            _ => None,
        }
    }

    /// Whether the operation belongs in the subscription-control queue
    pub fn is_subscription_control(&self) -> bool {
        self.subscription_id().is_some()
    }

    /// Decode a batch produced by [`encode_batch`]
    pub fn decode_batch(bytes: &[u8]) -> Result<Vec<ClientOp>, serde_json::Error> {
        let records: Vec<Vec<Value>> = serde_json::from_slice(bytes)?;
        records.into_iter().map(Self::from_record).collect()
    }

    fn from_record(record: Vec<Value>) -> Result<Self, serde_json::Error> {
        use serde::de::Error;

        let field = |i: usize| record.get(i).cloned().unwrap_or(Value::Null);
        let kind: u8 = serde_json::from_value(field(0))?;

        let op = match kind {
            tag::SUBSCRIBE => ClientOp::Subscribe {
                id: serde_json::from_value(field(1))?,
                query: field(2),
                name: serde_json::from_value(field(3))?,
                checksum: serde_json::from_value(field(4))?,
                reply_unchanged: serde_json::from_value(field(5))?,
            },
            tag::UNSUBSCRIBE => ClientOp::Unsubscribe {
                id: serde_json::from_value(field(1))?,
            },
            tag::GET => ClientOp::Get {
                id: serde_json::from_value(field(1))?,
                query: field(2),
                name: serde_json::from_value(field(3))?,
                checksum: serde_json::from_value(field(4))?,
            },
            tag::RESEND => ClientOp::Resend {
                id: serde_json::from_value(field(1))?,
            },
            tag::CALL => ClientOp::Call {
                request_id: serde_json::from_value(field(1))?,
                name: serde_json::from_value(field(2))?,
                payload: field(3),
            },
            tag::AUTH => ClientOp::Auth {
                token: serde_json::from_value(field(1))?,
                options: serde_json::from_value(field(2))?,
            },
            tag::TRACK => ClientOp::Track {
                event: serde_json::from_value(field(1))?,
                payload: serde_json::from_value(field(2))?,
            },
            other => {
                return Err(serde_json::Error::custom(format!(
                    "unknown operation tag {}",
                    other
                )))
            }
        };
        Ok(op)
    }
}

impl Serialize for ClientOp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ClientOp::Subscribe {
                id,
                query,
                name,
                checksum,
                reply_unchanged,
            } => (tag::SUBSCRIBE, id, query, name, checksum, reply_unchanged).serialize(serializer),
            ClientOp::Unsubscribe { id } => (tag::UNSUBSCRIBE, id).serialize(serializer),
            ClientOp::Get {
                id,
                query,
                name,
                checksum,
            } => (tag::GET, id, query, name, checksum).serialize(serializer),
            ClientOp::Resend { id } => (tag::RESEND, id).serialize(serializer),
            ClientOp::Call {
                request_id,
                name,
                payload,
            } => (tag::CALL, request_id, name, payload).serialize(serializer),
            ClientOp::Auth { token, options } => (tag::AUTH, token, options).serialize(serializer),
            ClientOp::Track { event, payload } => (tag::TRACK, event, payload).serialize(serializer),
        }
    }
}

/// Encode a batch of operations as one outgoing message
pub fn encode_batch(ops: &[ClientOp]) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(ops)
}

/// Body of an error frame
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ErrorPayload {
    pub request_id: Option<u32>,
    pub observable_id: Option<u64>,
    pub auth: bool,
    pub code: Option<i64>,
    pub message: String,
}

impl ErrorPayload {
    /// Parse an error frame body; anything unparseable becomes a plain message
    pub fn from_value(payload: Option<Value>) -> Self {
        match payload {
            None => Self {
                message: "Unknown server error".to_string(),
                ..Self::default()
            },
            Some(Value::String(message)) => Self {
                message,
                ..Self::default()
            },
            Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|_| Self {
                message: value.to_string(),
                ..Self::default()
            }),
        }
    }
}

/// Interpretation of an auth frame body
#[derive(Debug, Clone, PartialEq)]
pub enum AuthUpdate {
    /// The token we sent was accepted
    Confirmed,
    /// Server dropped our auth state
    Cleared,
    /// The token we sent was refused
    Rejected(String),
    /// Server installed a different token (e.g. after a refresh)
    Replaced { token: String, options: Option<Value> },
    /// Server revoked access to specific subscriptions
    Invalidate(Vec<u64>),
}

impl AuthUpdate {
    pub fn from_payload(payload: Option<&Value>) -> Self {
        let Some(payload) = payload else {
            return AuthUpdate::Cleared;
        };
        match payload {
            Value::Bool(true) => AuthUpdate::Confirmed,
            Value::Object(map) => {
                if let Some(ids) = map.get("invalidate").and_then(Value::as_array) {
                    return AuthUpdate::Invalidate(ids.iter().filter_map(Value::as_u64).collect());
                }
                if let Some(error) = map.get("error") {
                    let message = error
                        .as_str()
                        .map(str::to_string)
                        .or_else(|| error.get("message").and_then(Value::as_str).map(str::to_string))
                        .unwrap_or_else(|| error.to_string());
                    return AuthUpdate::Rejected(message);
                }
                match map.get("token").and_then(Value::as_str) {
                    Some(token) => AuthUpdate::Replaced {
                        token: token.to_string(),
                        options: map.get("options").cloned(),
                    },
                    None => AuthUpdate::Cleared,
                }
            }
            _ => AuthUpdate::Cleared,
        }
    }
}
