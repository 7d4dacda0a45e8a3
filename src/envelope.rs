//! Wire envelope and reply codec.
//!
//! Requests travel as a CBOR map `{method, key, ...args}`. The named arguments
//! are flattened next to `method` and `key` so the payload stays a plain map on
//! the wire. A `null`/missing `key` marks a broadcast.
//!
//! Replies travel as `{"ok": value}` or `{"error": {"kind", "message"}}`.

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Argument names that collide with envelope fields.
pub const RESERVED_ARGS: [&str; 2] = ["method", "key"];

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Errors that can occur while encoding or decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Decode failed: {0}")]
    Decode(String),
}

/// Single-use identifier pairing a unicast request with its reply slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationKey(String);

impl CorrelationKey {
    /// Generate a fresh, globally unique key.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Unit exchanged over the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Capability name on the worker's handler.
    pub method: String,
    /// Present for unicast calls, absent for broadcasts.
    #[serde(default)]
    pub key: Option<CorrelationKey>,
    /// Named arguments forwarded to the handler.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Build a unicast request expecting exactly one reply under `key`.
    pub fn call(method: impl Into<String>, key: CorrelationKey, payload: Map<String, Value>) -> Self {
        Self {
            method: method.into(),
            key: Some(key),
            payload,
        }
    }

    /// Build a broadcast notification. Receivers never reply.
    pub fn broadcast(method: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            method: method.into(),
            key: None,
            payload,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.key.is_none()
    }

    /// First argument name that would shadow an envelope field, if any.
    pub fn reserved_argument(payload: &Map<String, Value>) -> Option<&'static str> {
        RESERVED_ARGS
            .into_iter()
            .find(|name| payload.contains_key(*name))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

/// Error carried back to the caller when the handler fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Stable machine-readable category (e.g. `version_not_found`).
    pub kind: String,
    pub message: String,
}

/// Reply written to a correlation key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Ok(Value),
    Error(RemoteError),
}

impl Reply {
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
    Ok(buf)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}
