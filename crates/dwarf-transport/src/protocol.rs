//! Wire protocol between the controller and a device bridge.
//!
//! One JSON object per line. Binary payloads travel base64 encoded.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Transport error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Bridge connection closed")]
    Closed,
    #[error("{0}")]
    Remote(String),
    #[error("Unexpected bridge response: {0}")]
    UnexpectedResponse(String),
}

/// Request from controller to bridge. Every request carries an id echoed by
/// exactly one response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeRequest {
    /// Attach to a pid or package name.
    Attach { id: u64, target: String },
    /// Spawn a package suspended.
    Spawn { id: u64, package: String },
    /// Resume a spawned pid.
    Resume { id: u64, pid: u32 },
    /// Kill any running instance of a package.
    Kill { id: u64, package: String },
    /// Create a script in an attached session.
    CreateScript {
        id: u64,
        session: u64,
        source: String,
    },
    /// Load a created script.
    Load { id: u64, script: u64 },
    /// Call the script's exported API.
    Call {
        id: u64,
        script: u64,
        tid: u64,
        api: String,
        args: Vec<Value>,
    },
    /// Unload a script.
    Unload { id: u64, script: u64 },
    /// Detach a session.
    Detach { id: u64, session: u64 },
}

impl BridgeRequest {
    /// Id of the request.
    #[must_use]
    pub const fn id(&self) -> u64 {
        match self {
            Self::Attach { id, .. }
            | Self::Spawn { id, .. }
            | Self::Resume { id, .. }
            | Self::Kill { id, .. }
            | Self::CreateScript { id, .. }
            | Self::Load { id, .. }
            | Self::Call { id, .. }
            | Self::Unload { id, .. }
            | Self::Detach { id, .. } => *id,
        }
    }
}

/// Outcome of one request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Base64 binary result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BridgeResponse {
    /// Successful response with a JSON result.
    #[must_use]
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            data: None,
            error: None,
        }
    }

    /// Successful response with binary data.
    #[must_use]
    pub fn binary(id: u64, data: &[u8]) -> Self {
        Self {
            id,
            result: None,
            data: Some(encode_data(data)),
            error: None,
        }
    }

    /// Failed response.
    #[must_use]
    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            data: None,
            error: Some(message.into()),
        }
    }

    /// Decode the binary result, if any.
    ///
    /// # Errors
    /// Returns error if the payload is not valid base64.
    pub fn decode_data(&self) -> Result<Option<Bytes>, ProtocolError> {
        self.data.as_deref().map(decode_data).transpose()
    }

    /// Numeric field of an object result.
    ///
    /// # Errors
    /// Returns error if the field is missing or not an unsigned integer.
    pub fn field_u64(&self, field: &str) -> Result<u64, ProtocolError> {
        self.result
            .as_ref()
            .and_then(|r| r.get(field))
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                ProtocolError::UnexpectedResponse(format!("request {} lacks {field}", self.id))
            })
    }
}

/// Event from bridge to controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// Answer to a request.
    Response(BridgeResponse),
    /// Message posted by a loaded script.
    Message {
        script: u64,
        message: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
    /// A script was destroyed.
    Destroyed { script: u64 },
}

/// Encode binary data for the wire.
#[must_use]
pub fn encode_data(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Decode binary data from the wire.
///
/// # Errors
/// Returns error if `data` is not valid base64.
pub fn decode_data(data: &str) -> Result<Bytes, ProtocolError> {
    Ok(Bytes::from(BASE64.decode(data)?))
}
