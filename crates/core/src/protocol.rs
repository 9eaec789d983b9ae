//! Signaling message protocol and its JSON codec.
//!
//! Every frame on the signaling channel is a JSON object with a `type`
//! discriminant. All frames except `error` carry the `call_id` of the session
//! they belong to.

use crate::error::{DecodeError, EncodeError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The closed set of messages exchanged over the signaling channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// Connection negotiation. The body is passed through untouched.
    Offer {
        #[serde(rename = "offer")]
        body: Value,
    },
    Answer {
        #[serde(rename = "answer")]
        body: Value,
    },
    IceCandidate {
        #[serde(rename = "candidate")]
        payload: Value,
    },
    /// A user turn carrying recorded audio.
    #[serde(rename = "voice_message")]
    VoiceTurnRequest {
        #[serde(with = "base64_bytes")]
        audio: Bytes,
    },
    /// A user turn carrying typed text.
    #[serde(rename = "text_message")]
    TextTurnRequest { text: String },
    /// The peer's reply to the outstanding turn.
    #[serde(rename = "bot_response")]
    TurnResponse {
        #[serde(rename = "text")]
        response_text: String,
        #[serde(
            rename = "audio",
            default,
            with = "base64_bytes_opt",
            skip_serializing_if = "Option::is_none"
        )]
        response_audio: Option<Bytes>,
        #[serde(rename = "user_text", default, skip_serializing_if = "Option::is_none")]
        echoed_user_text: Option<String>,
    },
    Error { message: String },
    CallEnded,
    CallRejected,
}

/// Wire discriminants of every known message, in declaration order.
pub const MESSAGE_TYPES: [&str; 9] = [
    "offer",
    "answer",
    "ice_candidate",
    "voice_message",
    "text_message",
    "bot_response",
    "error",
    "call_ended",
    "call_rejected",
];

impl SignalingMessage {
    /// The wire discriminant of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice_candidate",
            SignalingMessage::VoiceTurnRequest { .. } => "voice_message",
            SignalingMessage::TextTurnRequest { .. } => "text_message",
            SignalingMessage::TurnResponse { .. } => "bot_response",
            SignalingMessage::Error { .. } => "error",
            SignalingMessage::CallEnded => "call_ended",
            SignalingMessage::CallRejected => "call_rejected",
        }
    }

    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            SignalingMessage::Offer { .. }
                | SignalingMessage::Answer { .. }
                | SignalingMessage::IceCandidate { .. }
        )
    }
}

/// A message together with the session it is addressed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(flatten)]
    pub message: SignalingMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

impl Frame {
    /// Addresses `message` to `call_id`. `error` frames never carry one.
    pub fn new(message: SignalingMessage, call_id: &str) -> Self {
        let call_id = match message {
            SignalingMessage::Error { .. } => None,
            _ => Some(call_id.to_owned()),
        };
        Self { message, call_id }
    }

    /// Whether this frame may be processed by the session `call_id`.
    /// Frames without a `call_id` are attributed to the active session.
    pub fn is_for(&self, call_id: &str) -> bool {
        self.call_id.as_deref().is_none_or(|id| id == call_id)
    }
}

/// Serializes a frame to its JSON wire form.
pub fn encode(frame: &Frame) -> Result<String, EncodeError> {
    serde_json::to_string(frame).map_err(|source| EncodeError {
        kind: frame.message.kind(),
        source,
    })
}

/// Parses a JSON wire frame, rejecting unknown discriminants and frames that
/// lack the fields their discriminant requires.
pub fn decode(raw: &str) -> Result<Frame, DecodeError> {
    let value: Value = serde_json::from_str(raw).map_err(DecodeError::Malformed)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?
        .to_owned();
    if !MESSAGE_TYPES.contains(&kind.as_str()) {
        return Err(DecodeError::UnknownType(kind));
    }
    serde_json::from_value(value).map_err(|source| DecodeError::InvalidFields { kind, source })
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(D::Error::custom)
    }
}

mod base64_bytes_opt {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Bytes>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Bytes>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|encoded| {
                STANDARD
                    .decode(encoded.as_bytes())
                    .map(Bytes::from)
                    .map_err(D::Error::custom)
            })
            .transpose()
    }
}
