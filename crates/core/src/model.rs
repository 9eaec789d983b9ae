//! Call and turn data model, including the call lifecycle state machine.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of peer a call connects to. Fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Counselor,
    AiPractice,
    Emergency,
}

impl CallKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CallKind::Counselor => "counselor",
            CallKind::AiPractice => "ai_practice",
            CallKind::Emergency => "emergency",
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a call.
///
/// `Idle` is the only initial state. `Ended`, `Rejected`, `Missed`,
/// `Cancelled` and `Failed` are terminal: the only way out of them is a new
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Idle,
    Initiating,
    Ringing,
    Connected,
    Ended,
    Rejected,
    Missed,
    Cancelled,
    Failed,
}

/// Something that may move a call from one status to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A local `create_call`.
    CreateRequested,
    /// An inbound call was offered to us.
    IncomingRing,
    /// The REST collaborator returned a session for an outgoing call.
    Created(CallKind),
    CreateFailed,
    CreateTimedOut,
    /// Inbound `answer` from the remote peer.
    AnswerReceived,
    /// The local user accepted an incoming call.
    AcceptedLocally,
    /// Inbound `call_rejected`.
    RejectedRemotely,
    /// Local `reject_call`.
    RejectedLocally,
    CancelRequested,
    /// Inbound `call_ended`.
    EndedRemotely,
    /// Local `end_call`.
    EndRequested,
    RingExpired,
    /// The channel could not be opened or was lost, or the remote kept failing.
    ChannelFailed,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallStatus::Ended
                | CallStatus::Rejected
                | CallStatus::Missed
                | CallStatus::Cancelled
                | CallStatus::Failed
        )
    }

    /// True while a session exists and has not yet terminated.
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != CallStatus::Idle
    }

    /// Returns the status `trigger` leads to, or `None` if the trigger does not
    /// apply in this status.
    pub fn next(self, trigger: Trigger) -> Option<CallStatus> {
        use CallStatus::*;
        let fresh = self == Idle || self.is_terminal();
        match (self, trigger) {
            (_, Trigger::CreateRequested) if fresh => Some(Initiating),
            (_, Trigger::IncomingRing) if fresh => Some(Ringing),
            (Initiating, Trigger::Created(CallKind::AiPractice)) => Some(Connected),
            (Initiating, Trigger::Created(_)) => Some(Ringing),
            (Initiating, Trigger::CreateFailed) => Some(Ended),
            (Initiating, Trigger::CreateTimedOut) => Some(Failed),
            (Ringing, Trigger::AnswerReceived | Trigger::AcceptedLocally) => Some(Connected),
            (Ringing, Trigger::RejectedRemotely) => Some(Rejected),
            (Initiating | Ringing, Trigger::RejectedLocally) => Some(Rejected),
            (Ringing, Trigger::CancelRequested) => Some(Cancelled),
            (Ringing, Trigger::RingExpired) => Some(Missed),
            (Ringing | Connected, Trigger::EndedRemotely) => Some(Ended),
            (_, Trigger::EndRequested) if self.is_active() => Some(Ended),
            (_, Trigger::ChannelFailed) if self.is_active() => Some(Failed),
            _ => None,
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallStatus::Idle => "idle",
            CallStatus::Initiating => "initiating",
            CallStatus::Ringing => "ringing",
            CallStatus::Connected => "connected",
            CallStatus::Ended => "ended",
            CallStatus::Rejected => "rejected",
            CallStatus::Missed => "missed",
            CallStatus::Cancelled => "cancelled",
            CallStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One logical call, as assigned by the REST collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSession {
    pub session_id: String,
    pub kind: CallKind,
    pub language: String,
}

/// What the local user sent for a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnInput {
    Voice(Bytes),
    Text(String),
}

/// The remote peer's reply to a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnReply {
    pub text: String,
    pub audio: Option<Bytes>,
    /// The peer's transcription of the user's input, when it echoes one.
    pub user_text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Pending,
    Completed,
    /// The session terminated while the turn was pending.
    Abandoned,
    /// The peer reported an error for the turn, or never answered it.
    Failed,
}

/// One request/response exchange within a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    /// Position in the session's turn sequence, starting at 0.
    pub index: usize,
    pub input: TurnInput,
    pub state: TurnState,
    pub reply: Option<TurnReply>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
