//! Error taxonomy for the call session core.
//!
//! Transport and codec failures are handled inside the protocol core; only
//! [`CallError`] crosses the boundary to the caller.

use crate::model::CallStatus;
use std::time::Duration;

/// The signaling channel could not be opened or was lost.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("endpoint {endpoint} is unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },
    #[error("handshake with {endpoint} failed: {reason}")]
    Handshake { endpoint: String, reason: String },
    #[error("connection lost: {0}")]
    Lost(String),
    #[error("connecting timed out after {0:?}")]
    Timeout(Duration),
    #[error("channel is closed")]
    Closed,
}

/// An inbound frame that does not describe a known signaling message.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("frame has no string `type` discriminant")]
    MissingType,
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("invalid fields for `{kind}`: {source}")]
    InvalidFields {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Serialization failure for an outbound message.
#[derive(Debug, thiserror::Error)]
#[error("failed to encode `{kind}` message: {source}")]
pub struct EncodeError {
    pub kind: &'static str,
    #[source]
    pub source: serde_json::Error,
}

/// Failure reported by, or while talking to, the REST collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("server responded with {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected response body: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::InvalidResponse(err.to_string())
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

/// Errors surfaced to callers of the session manager.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("a call is already in progress (status: {status})")]
    AlreadyInCall { status: CallStatus },
    #[error("a turn is still awaiting its response")]
    TurnInProgress,
    #[error("no connected call (status: {status})")]
    NotConnected { status: CallStatus },
    #[error("no call is ringing (status: {status})")]
    NotRinging { status: CallStatus },
    #[error("session `{0}` is not the active call")]
    UnknownSession(String),
    #[error("counselor calls require a callee id")]
    MissingCallee,
    #[error("only offer, answer and ice_candidate can be sent as negotiation")]
    NotNegotiation,
    #[error("creating the call failed: {0}")]
    CreateFailed(#[source] ApiError),
    #[error("creating the call timed out after {0:?}")]
    CreateTimedOut(Duration),
    #[error("the call was terminated locally before it was established (status: {status})")]
    Aborted { status: CallStatus },
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Api(#[from] ApiError),
}
