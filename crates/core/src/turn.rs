//! Turn-taking between the local user and the remote peer.
//!
//! A session has at most one outstanding turn. The turn sequence is
//! append-only: a response always completes the single pending turn, so turns
//! are never reordered.

use crate::error::CallError;
use crate::model::{Turn, TurnInput, TurnReply, TurnState};
use crate::protocol::SignalingMessage;
use chrono::Utc;
use tracing::warn;

/// Owns the ordered turn sequence of one session.
#[derive(Debug, Default)]
pub struct VoiceTurnCoordinator {
    turns: Vec<Turn>,
    pending: Option<usize>,
}

impl VoiceTurnCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails with [`CallError::TurnInProgress`] while a turn awaits its response.
    pub fn ensure_idle(&self) -> Result<(), CallError> {
        match self.pending {
            Some(_) => Err(CallError::TurnInProgress),
            None => Ok(()),
        }
    }

    pub fn pending(&self) -> Option<&Turn> {
        self.pending.map(|index| &self.turns[index])
    }

    /// Sends the request for `input` through `send` and, once it is queued,
    /// appends the turn as pending. Nothing is appended if sending fails.
    pub fn submit<F>(&mut self, input: TurnInput, send: F) -> Result<usize, CallError>
    where
        F: FnOnce(SignalingMessage) -> Result<(), CallError>,
    {
        self.ensure_idle()?;
        send(request_for(&input))?;
        let index = self.turns.len();
        self.turns.push(Turn {
            index,
            input,
            state: TurnState::Pending,
            reply: None,
            started_at: Utc::now(),
            finished_at: None,
        });
        self.pending = Some(index);
        Ok(index)
    }

    /// Completes the pending turn with `reply`. A reply with no pending turn
    /// is a protocol anomaly: it is dropped and `None` is returned.
    pub fn complete(&mut self, reply: TurnReply) -> Option<Turn> {
        let Some(index) = self.pending.take() else {
            warn!(text = %reply.text, "Dropping turn response with no pending turn.");
            return None;
        };
        let turn = &mut self.turns[index];
        turn.state = TurnState::Completed;
        turn.reply = Some(reply);
        turn.finished_at = Some(Utc::now());
        Some(turn.clone())
    }

    /// Marks the pending turn failed. With `only_index`, the turn is failed
    /// only if it is still the pending one (used by turn timers).
    pub fn fail_pending(&mut self, only_index: Option<usize>) -> Option<Turn> {
        if only_index.is_some() && only_index != self.pending {
            return None;
        }
        self.close_pending(TurnState::Failed)
    }

    /// Marks the pending turn abandoned because the session terminated.
    pub fn abandon_pending(&mut self) -> Option<Turn> {
        self.close_pending(TurnState::Abandoned)
    }

    /// A copy of the turn sequence for observers.
    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns.clone()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    fn close_pending(&mut self, state: TurnState) -> Option<Turn> {
        let index = self.pending.take()?;
        let turn = &mut self.turns[index];
        turn.state = state;
        turn.finished_at = Some(Utc::now());
        Some(turn.clone())
    }
}

fn request_for(input: &TurnInput) -> SignalingMessage {
    match input {
        TurnInput::Voice(audio) => SignalingMessage::VoiceTurnRequest {
            audio: audio.clone(),
        },
        TurnInput::Text(text) => SignalingMessage::TextTurnRequest { text: text.clone() },
    }
}
