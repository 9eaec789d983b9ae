//! Call session lifecycle.
//!
//! [`CallSessionManager`] owns the state machine of one call at a time. It
//! asks the REST collaborator to create, end or reject calls, opens the
//! signaling channel for the session, routes inbound messages to the turn
//! coordinator, and publishes every change through the observer hub while
//! holding its state lock.

use crate::api::{CallApi, CallRecord, Counselor, CreateCallRequest};
use crate::channel::{InboundHandler, SignalingChannel, Transport};
use crate::error::{CallError, ConnectionError};
use crate::model::{CallKind, CallSession, CallStatus, Trigger, Turn, TurnInput, TurnReply};
use crate::observer::{EventFilter, SessionEvent, SessionObserverHub, Subscription, SubscriptionId};
use crate::protocol::{Frame, SignalingMessage};
use crate::turn::VoiceTurnCoordinator;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::{
    sync::{Mutex, watch},
    task::AbortHandle,
};
use tracing::{Instrument, debug, error, info, instrument, warn};

/// Timeouts and policies of a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base URL of the signaling endpoint; the session id is appended to it.
    pub signaling_url: String,
    pub create_timeout: Duration,
    pub connect_timeout: Duration,
    /// Upper bound on the best-effort end/reject request.
    pub end_timeout: Duration,
    pub ring_timeout: Duration,
    pub turn_timeout: Duration,
    pub close_timeout: Duration,
    /// Consecutive remote errors tolerated before the session fails.
    pub max_remote_errors: u32,
    /// Attempts to reopen a lost channel of a connected call before failing it.
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl SessionConfig {
    pub fn new(signaling_url: impl Into<String>) -> Self {
        Self {
            signaling_url: signaling_url.into(),
            ..Self::default()
        }
    }

    /// The signaling endpoint of `session_id`.
    pub fn endpoint_for(&self, session_id: &str) -> String {
        format!("{}/{}", self.signaling_url.trim_end_matches('/'), session_id)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:8000/api/calls/ws".to_string(),
            create_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(10),
            end_timeout: Duration::from_secs(5),
            ring_timeout: Duration::from_secs(45),
            turn_timeout: Duration::from_secs(60),
            close_timeout: Duration::from_secs(2),
            max_remote_errors: 3,
            reconnect_attempts: 0,
            reconnect_delay: Duration::from_millis(500),
        }
    }
}

/// Remote bookkeeping performed after a local teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Remote {
    None,
    End,
    Reject,
}

struct State {
    status: CallStatus,
    session: Option<CallSession>,
    channel: Option<Arc<SignalingChannel>>,
    turns: VoiceTurnCoordinator,
    /// Incremented for every new session; events carrying an older epoch are stale.
    epoch: u64,
    remote_errors: u32,
    timers: Vec<AbortHandle>,
    /// Carries the epoch of the most recently terminated session.
    terminated: watch::Sender<u64>,
}

/// Resources released once the state lock is dropped.
struct Teardown {
    channel: Option<Arc<SignalingChannel>>,
    session_id: Option<String>,
}

impl State {
    fn session_id(&self) -> Option<String> {
        self.session.as_ref().map(|s| s.session_id.clone())
    }

    fn begin_session(&mut self) -> u64 {
        self.epoch += 1;
        self.session = None;
        self.turns = VoiceTurnCoordinator::new();
        self.remote_errors = 0;
        self.epoch
    }

    /// Applies `trigger` and publishes the change. Reaching a terminal status
    /// abandons the pending turn.
    fn transition(&mut self, trigger: Trigger, hub: &SessionObserverHub) -> Option<CallStatus> {
        let next = self.status.next(trigger)?;
        let previous = std::mem::replace(&mut self.status, next);
        info!(%previous, current = %next, ?trigger, "Call status changed.");
        hub.publish(SessionEvent::StatusChanged {
            previous,
            current: next,
            session_id: self.session_id(),
        });
        if next.is_terminal() {
            if let Some(turn) = self.turns.abandon_pending() {
                hub.publish(SessionEvent::TurnClosed(turn));
            }
        }
        Some(next)
    }

    /// Applies a terminal `trigger` and detaches everything the session owns.
    fn terminate(&mut self, trigger: Trigger, hub: &SessionObserverHub) -> Option<Teardown> {
        self.transition(trigger, hub)?;
        // A timer that fires the termination must survive it to finish the teardown.
        let current = tokio::task::try_id();
        for timer in self.timers.drain(..) {
            if Some(timer.id()) != current {
                timer.abort();
            }
        }
        self.terminated.send_replace(self.epoch);
        Some(Teardown {
            channel: self.channel.take(),
            session_id: self.session.take().map(|s| s.session_id),
        })
    }
}

struct Shared {
    state: Mutex<State>,
    hub: SessionObserverHub,
    api: Arc<dyn CallApi>,
    transport: Arc<dyn Transport>,
    config: SessionConfig,
}

/// Drives one call at a time. Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct CallSessionManager {
    shared: Arc<Shared>,
}

impl CallSessionManager {
    pub fn new(api: Arc<dyn CallApi>, transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    status: CallStatus::Idle,
                    session: None,
                    channel: None,
                    turns: VoiceTurnCoordinator::new(),
                    epoch: 0,
                    remote_errors: 0,
                    timers: Vec::new(),
                    terminated: watch::Sender::new(0),
                }),
                hub: SessionObserverHub::new(),
                api,
                transport,
                config,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub async fn status(&self) -> CallStatus {
        self.shared.state.lock().await.status
    }

    pub async fn session(&self) -> Option<CallSession> {
        self.shared.state.lock().await.session.clone()
    }

    /// A snapshot of the current (or last) session's turns.
    pub async fn turns(&self) -> Vec<Turn> {
        self.shared.state.lock().await.turns.snapshot()
    }

    pub fn subscribe(&self) -> Subscription {
        self.shared.hub.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> Subscription {
        self.shared.hub.subscribe_filtered(filter)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.hub.unsubscribe(id)
    }

    /// Creates an outgoing call and opens its signaling channel.
    ///
    /// Only callable when no call is active. An `ai_practice` call is
    /// connected as soon as the server creates it; other kinds ring until
    /// the peer answers.
    #[instrument(skip_all, fields(%kind, %language))]
    pub async fn create_call(
        &self,
        kind: CallKind,
        callee_id: Option<String>,
        language: &str,
    ) -> Result<String, CallError> {
        if kind == CallKind::Counselor && callee_id.is_none() {
            return Err(CallError::MissingCallee);
        }
        let epoch = {
            let mut state = self.shared.state.lock().await;
            if state.status.is_active() {
                return Err(CallError::AlreadyInCall {
                    status: state.status,
                });
            }
            let epoch = state.begin_session();
            state.transition(Trigger::CreateRequested, &self.shared.hub);
            epoch
        };

        let request = CreateCallRequest {
            kind,
            callee_id,
            language: language.to_owned(),
        };
        let limit = self.shared.config.create_timeout;
        let record = match tokio::time::timeout(limit, self.shared.api.create_call(&request)).await
        {
            Ok(Ok(record)) => record,
            Ok(Err(e)) => {
                error!(error = %e, "Create-call request failed.");
                self.fail_creation(epoch, Trigger::CreateFailed).await;
                return Err(CallError::CreateFailed(e));
            }
            Err(_) => {
                error!(?limit, "Create-call request timed out.");
                self.fail_creation(epoch, Trigger::CreateTimedOut).await;
                return Err(CallError::CreateTimedOut(limit));
            }
        };

        let session = CallSession {
            session_id: record.call_id,
            kind,
            language: language.to_owned(),
        };
        {
            let mut state = self.shared.state.lock().await;
            if state.epoch != epoch || state.status != CallStatus::Initiating {
                let status = state.status;
                drop(state);
                warn!(session_id = %session.session_id, %status, "Call ended locally while it was being created.");
                self.remote_cleanup(&session.session_id, Remote::End).await;
                return Err(CallError::Aborted { status });
            }
            state.session = Some(session.clone());
            if state.transition(Trigger::Created(kind), &self.shared.hub) == Some(CallStatus::Ringing) {
                self.arm_ring_timer(&mut state, epoch);
            }
        }

        self.attach_channel(epoch, &session.session_id).await?;
        Ok(session.session_id)
    }

    /// Takes an incoming call offered by the server and rings locally.
    #[instrument(skip(self))]
    pub async fn incoming_call(
        &self,
        session_id: &str,
        kind: CallKind,
        language: &str,
    ) -> Result<(), CallError> {
        let epoch = {
            let mut state = self.shared.state.lock().await;
            if state.status.is_active() {
                return Err(CallError::AlreadyInCall {
                    status: state.status,
                });
            }
            let epoch = state.begin_session();
            state.session = Some(CallSession {
                session_id: session_id.to_owned(),
                kind,
                language: language.to_owned(),
            });
            state.transition(Trigger::IncomingRing, &self.shared.hub);
            self.arm_ring_timer(&mut state, epoch);
            epoch
        };
        self.attach_channel(epoch, session_id).await
    }

    /// Accepts the ringing incoming call, answering with `answer`.
    pub async fn accept_call(&self, answer: Value) -> Result<(), CallError> {
        let mut state = self.shared.state.lock().await;
        if state.status != CallStatus::Ringing {
            return Err(CallError::NotRinging {
                status: state.status,
            });
        }
        let channel = state.channel.clone().ok_or(ConnectionError::Closed)?;
        channel.send(SignalingMessage::Answer { body: answer })?;
        state.transition(Trigger::AcceptedLocally, &self.shared.hub);
        Ok(())
    }

    /// Ends the call. A no-op once the call is terminal; otherwise local state
    /// becomes `Ended` and the channel is closed before the server is told,
    /// so a slow or failing end-call request cannot keep the call alive.
    #[instrument(skip(self))]
    pub async fn end_call(&self) -> CallStatus {
        if !self.finish(None, Trigger::EndRequested, Remote::End).await {
            debug!("end_call: no active call.");
        }
        self.status().await
    }

    /// Rejects the call `session_id` before it is accepted locally.
    #[instrument(skip(self))]
    pub async fn reject_call(&self, session_id: &str) -> Result<(), CallError> {
        let teardown = {
            let mut state = self.shared.state.lock().await;
            if state.status.is_terminal() {
                return Ok(());
            }
            if state.session_id().as_deref() != Some(session_id) {
                return Err(CallError::UnknownSession(session_id.to_owned()));
            }
            match state.terminate(Trigger::RejectedLocally, &self.shared.hub) {
                Some(teardown) => teardown,
                None => {
                    return Err(CallError::NotRinging {
                        status: state.status,
                    });
                }
            }
        };
        self.release(teardown, Remote::Reject).await;
        Ok(())
    }

    /// Cancels an outgoing call that is still ringing.
    pub async fn cancel_call(&self) -> Result<(), CallError> {
        let teardown = {
            let mut state = self.shared.state.lock().await;
            if !state.status.is_active() {
                return Ok(());
            }
            match state.terminate(Trigger::CancelRequested, &self.shared.hub) {
                Some(teardown) => teardown,
                None => {
                    return Err(CallError::NotRinging {
                        status: state.status,
                    });
                }
            }
        };
        self.release(teardown, Remote::End).await;
        Ok(())
    }

    /// Sends a recorded voice turn. Returns the turn's index.
    pub async fn submit_voice_turn(&self, audio: impl Into<Bytes>) -> Result<usize, CallError> {
        self.submit(TurnInput::Voice(audio.into())).await
    }

    /// Sends a text turn. Returns the turn's index.
    pub async fn submit_text_turn(&self, text: impl Into<String>) -> Result<usize, CallError> {
        self.submit(TurnInput::Text(text.into())).await
    }

    /// Sends an offer, answer or ICE candidate to the peer.
    pub async fn send_negotiation(&self, message: SignalingMessage) -> Result<(), CallError> {
        if !message.is_negotiation() {
            return Err(CallError::NotNegotiation);
        }
        let state = self.shared.state.lock().await;
        if !matches!(state.status, CallStatus::Ringing | CallStatus::Connected) {
            return Err(CallError::NotConnected {
                status: state.status,
            });
        }
        let channel = state.channel.as_ref().ok_or(ConnectionError::Closed)?;
        channel.send(message)
    }

    pub async fn call_history(&self, kind: Option<CallKind>) -> Result<Vec<CallRecord>, CallError> {
        Ok(self.shared.api.call_history(kind).await?)
    }

    pub async fn available_counselors(&self, language: &str) -> Result<Vec<Counselor>, CallError> {
        Ok(self.shared.api.available_counselors(language).await?)
    }

    async fn submit(&self, input: TurnInput) -> Result<usize, CallError> {
        let mut state = self.shared.state.lock().await;
        if state.status != CallStatus::Connected {
            return Err(CallError::NotConnected {
                status: state.status,
            });
        }
        let channel = state.channel.clone().ok_or(ConnectionError::Closed)?;
        let index = state
            .turns
            .submit(input, |message| channel.send(message))?;
        debug!(index, "Turn submitted.");
        let epoch = state.epoch;
        self.arm_turn_timer(&mut state, epoch, index);
        Ok(index)
    }

    async fn fail_creation(&self, epoch: u64, trigger: Trigger) {
        let mut state = self.shared.state.lock().await;
        if state.epoch == epoch {
            state.terminate(trigger, &self.shared.hub);
        }
    }

    /// Applies a terminal `trigger` (if it applies) and releases the session's
    /// resources. With `epoch`, nothing happens unless that session is still
    /// the current one. Returns whether a transition happened.
    async fn finish(&self, epoch: Option<u64>, trigger: Trigger, remote: Remote) -> bool {
        let teardown = {
            let mut state = self.shared.state.lock().await;
            if epoch.is_some_and(|e| e != state.epoch) {
                return false;
            }
            match state.terminate(trigger, &self.shared.hub) {
                Some(teardown) => teardown,
                None => return false,
            }
        };
        self.release(teardown, remote).await;
        true
    }

    async fn release(&self, teardown: Teardown, remote: Remote) {
        if let Some(channel) = teardown.channel {
            channel.close().await;
        }
        if let Some(session_id) = teardown.session_id {
            self.remote_cleanup(&session_id, remote).await;
        }
    }

    /// Best-effort notification of the server. Failures are logged; local
    /// state is already final.
    async fn remote_cleanup(&self, session_id: &str, remote: Remote) {
        let api = &self.shared.api;
        let request = match remote {
            Remote::None => return,
            Remote::End => api.end_call(session_id),
            Remote::Reject => api.reject_call(session_id),
        };
        let limit = self.shared.config.end_timeout;
        match tokio::time::timeout(limit, request).await {
            Ok(Ok(())) => debug!(%session_id, ?remote, "Server acknowledged call teardown."),
            Ok(Err(e)) => warn!(%session_id, ?remote, error = %e, "Server teardown request failed; local state stands."),
            Err(_) => warn!(%session_id, ?remote, ?limit, "Server teardown request timed out; local state stands."),
        }
    }

    async fn open_channel(&self, epoch: u64, session_id: &str) -> Result<SignalingChannel, ConnectionError> {
        let config = &self.shared.config;
        let endpoint = config.endpoint_for(session_id);
        let handler: Arc<dyn InboundHandler> = Arc::new(SessionInbound {
            shared: Arc::downgrade(&self.shared),
            epoch,
        });
        let open = SignalingChannel::open(
            self.shared.transport.as_ref(),
            &endpoint,
            session_id,
            handler,
            config.close_timeout,
        );
        match tokio::time::timeout(config.connect_timeout, open).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(config.connect_timeout)),
        }
    }

    /// Opens the channel of session `epoch` and installs it, unless the
    /// session terminated meanwhile, in which case the new channel is closed.
    async fn attach_channel(&self, epoch: u64, session_id: &str) -> Result<(), CallError> {
        let terminated = self.shared.state.lock().await.terminated.subscribe();
        let opened = tokio::select! {
            result = self.open_channel(epoch, session_id) => Some(result),
            _ = session_terminated(terminated, epoch) => None,
        };
        let channel = match opened {
            None => {
                let status = self.status().await;
                debug!(%status, "Call terminated while its channel was connecting.");
                return Err(CallError::Aborted { status });
            }
            Some(Ok(channel)) => Arc::new(channel),
            Some(Err(e)) => {
                error!(error = %e, "Could not open the signaling channel.");
                self.finish(Some(epoch), Trigger::ChannelFailed, Remote::End)
                    .await;
                return Err(e.into());
            }
        };
        self.install_channel(epoch, channel).await
    }

    async fn install_channel(&self, epoch: u64, channel: Arc<SignalingChannel>) -> Result<(), CallError> {
        let mut state = self.shared.state.lock().await;
        if state.epoch != epoch || !state.status.is_active() {
            let status = state.status;
            drop(state);
            channel.close().await;
            return Err(CallError::Aborted { status });
        }
        state.channel = Some(channel);
        Ok(())
    }

    fn arm_ring_timer(&self, state: &mut State, epoch: u64) {
        let manager = Arc::downgrade(&self.shared);
        let delay = self.shared.config.ring_timeout;
        let handle = tokio::spawn(
            async move {
                tokio::time::sleep(delay).await;
                if let Some(shared) = manager.upgrade() {
                    let manager = CallSessionManager { shared };
                    if manager
                        .finish(Some(epoch), Trigger::RingExpired, Remote::End)
                        .await
                    {
                        info!(?delay, "Call was not answered in time.");
                    }
                }
            }
            .in_current_span(),
        );
        state.timers.push(handle.abort_handle());
    }

    fn arm_turn_timer(&self, state: &mut State, epoch: u64, index: usize) {
        let manager = Arc::downgrade(&self.shared);
        let delay = self.shared.config.turn_timeout;
        let handle = tokio::spawn(
            async move {
                tokio::time::sleep(delay).await;
                let Some(shared) = manager.upgrade() else {
                    return;
                };
                let mut state = shared.state.lock().await;
                if state.epoch != epoch {
                    return;
                }
                if let Some(turn) = state.turns.fail_pending(Some(index)) {
                    warn!(index, ?delay, "Turn got no response in time.");
                    shared.hub.publish(SessionEvent::TurnClosed(turn));
                }
            }
            .in_current_span(),
        );
        state.timers.retain(|timer| !timer.is_finished());
        state.timers.push(handle.abort_handle());
    }

    async fn handle_frame(&self, epoch: u64, frame: Frame) {
        let hub = &self.shared.hub;
        let teardown = {
            let mut state = self.shared.state.lock().await;
            if state.epoch != epoch || !state.status.is_active() {
                debug!(kind = frame.message.kind(), "Ignoring frame for a finished session.");
                return;
            }
            let Some(session_id) = state.session_id() else {
                return;
            };
            if !frame.is_for(&session_id) {
                warn!(call_id = ?frame.call_id, "Ignoring frame addressed to another call.");
                return;
            }

            let terminal = match frame.message {
                message @ (SignalingMessage::Offer { .. } | SignalingMessage::IceCandidate { .. }) => {
                    hub.publish(SessionEvent::Negotiation { session_id, message });
                    None
                }
                message @ SignalingMessage::Answer { .. } => {
                    if state.status == CallStatus::Ringing {
                        state.transition(Trigger::AnswerReceived, hub);
                    }
                    hub.publish(SessionEvent::Negotiation { session_id, message });
                    None
                }
                SignalingMessage::TurnResponse {
                    response_text,
                    response_audio,
                    echoed_user_text,
                } => {
                    let reply = TurnReply {
                        text: response_text,
                        audio: response_audio,
                        user_text: echoed_user_text,
                    };
                    if let Some(turn) = state.turns.complete(reply) {
                        state.remote_errors = 0;
                        hub.publish(SessionEvent::TurnClosed(turn));
                    }
                    None
                }
                SignalingMessage::Error { message } => {
                    state.remote_errors += 1;
                    warn!(%message, count = state.remote_errors, "Remote peer reported an error.");
                    hub.publish(SessionEvent::RemoteError {
                        session_id: Some(session_id),
                        message,
                    });
                    if let Some(turn) = state.turns.fail_pending(None) {
                        hub.publish(SessionEvent::TurnClosed(turn));
                    }
                    (state.remote_errors >= self.shared.config.max_remote_errors)
                        .then_some((Trigger::ChannelFailed, Remote::End))
                }
                SignalingMessage::CallEnded => Some((Trigger::EndedRemotely, Remote::None)),
                SignalingMessage::CallRejected if state.status == CallStatus::Ringing => {
                    Some((Trigger::RejectedRemotely, Remote::None))
                }
                SignalingMessage::CallRejected => {
                    warn!(status = %state.status, "Ignoring call_rejected outside of ringing.");
                    None
                }
                message @ (SignalingMessage::VoiceTurnRequest { .. }
                | SignalingMessage::TextTurnRequest { .. }) => {
                    warn!(kind = message.kind(), "Ignoring turn request sent by the peer.");
                    None
                }
            };
            match terminal {
                Some((trigger, remote)) => state
                    .terminate(trigger, hub)
                    .map(|teardown| (teardown, remote)),
                None => None,
            }
        };
        if let Some((teardown, remote)) = teardown {
            self.release(teardown, remote).await;
        }
    }

    async fn handle_lost(&self, epoch: u64, error: ConnectionError) {
        let attempts = self.shared.config.reconnect_attempts;
        let lost = {
            let mut state = self.shared.state.lock().await;
            if state.epoch != epoch || !state.status.is_active() {
                return;
            }
            if attempts == 0 || state.status != CallStatus::Connected {
                None
            } else {
                state.channel.take().zip(state.session_id())
            }
        };
        let Some((old, session_id)) = lost else {
            error!(error = %error, "Signaling channel lost; failing the call.");
            self.finish(Some(epoch), Trigger::ChannelFailed, Remote::End)
                .await;
            return;
        };

        warn!(error = %error, "Signaling channel lost; reconnecting.");
        old.close().await;
        for attempt in 1..=attempts {
            tokio::time::sleep(self.shared.config.reconnect_delay * attempt).await;
            match self.open_channel(epoch, &session_id).await {
                Ok(channel) => {
                    if self.install_channel(epoch, Arc::new(channel)).await.is_ok() {
                        info!(attempt, "Signaling channel reopened.");
                    }
                    return;
                }
                Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed."),
            }
        }
        error!(attempts, "Could not reopen the signaling channel; failing the call.");
        self.finish(Some(epoch), Trigger::ChannelFailed, Remote::End)
            .await;
    }
}

/// Resolves once session `epoch` has terminated.
async fn session_terminated(mut terminated: watch::Receiver<u64>, epoch: u64) {
    while *terminated.borrow_and_update() != epoch {
        if terminated.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Routes channel events of one session back into its manager.
struct SessionInbound {
    shared: Weak<Shared>,
    epoch: u64,
}

#[async_trait]
impl InboundHandler for SessionInbound {
    async fn on_frame(&self, frame: Frame) {
        if let Some(shared) = self.shared.upgrade() {
            CallSessionManager { shared }
                .handle_frame(self.epoch, frame)
                .await;
        }
    }

    async fn on_lost(&self, error: ConnectionError) {
        if let Some(shared) = self.shared.upgrade() {
            CallSessionManager { shared }
                .handle_lost(self.epoch, error)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockCallApi;
    use crate::error::ApiError;
    use crate::model::TurnState;
    use crate::testing::{ConnectMode, MemoryTransport, RemotePeer};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn record(call_id: &str, kind: CallKind) -> CallRecord {
        CallRecord {
            call_id: call_id.into(),
            caller_id: Some("u1".into()),
            callee_id: None,
            kind,
            status: "initiating".into(),
            language: "en".into(),
            started_at: None,
            ended_at: None,
            duration: None,
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            signaling_url: "mem://calls/".into(),
            create_timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_millis(200),
            end_timeout: Duration::from_millis(100),
            ring_timeout: Duration::from_secs(10),
            turn_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_millis(200),
            max_remote_errors: 3,
            reconnect_attempts: 0,
            reconnect_delay: Duration::from_millis(10),
        }
    }

    /// Records teardown requests; can be told to never answer.
    #[derive(Default)]
    struct FakeApi {
        create_hangs: bool,
        create_delay: Duration,
        teardown_hangs: bool,
        ended: StdMutex<Vec<String>>,
        rejected: StdMutex<Vec<String>>,
    }

    impl FakeApi {
        fn ended(&self) -> Vec<String> {
            self.ended.lock().unwrap().clone()
        }

        fn rejected(&self) -> Vec<String> {
            self.rejected.lock().unwrap().clone()
        }

        async fn maybe_hang(&self, hang: bool) {
            if hang {
                std::future::pending::<()>().await;
            }
        }
    }

    #[async_trait]
    impl CallApi for FakeApi {
        async fn create_call(&self, request: &CreateCallRequest) -> Result<CallRecord, ApiError> {
            self.maybe_hang(self.create_hangs).await;
            tokio::time::sleep(self.create_delay).await;
            Ok(record("c1", request.kind))
        }

        async fn end_call(&self, session_id: &str) -> Result<(), ApiError> {
            self.ended.lock().unwrap().push(session_id.to_owned());
            self.maybe_hang(self.teardown_hangs).await;
            Ok(())
        }

        async fn reject_call(&self, session_id: &str) -> Result<(), ApiError> {
            self.rejected.lock().unwrap().push(session_id.to_owned());
            self.maybe_hang(self.teardown_hangs).await;
            Ok(())
        }

        async fn call_history(&self, _kind: Option<CallKind>) -> Result<Vec<CallRecord>, ApiError> {
            Ok(Vec::new())
        }

        async fn available_counselors(&self, _language: &str) -> Result<Vec<Counselor>, ApiError> {
            Ok(Vec::new())
        }
    }

    fn with_api(api: Arc<dyn CallApi>, config: SessionConfig) -> (CallSessionManager, RemotePeer) {
        let (transport, peer) = MemoryTransport::pair();
        (
            CallSessionManager::new(api, Arc::new(transport), config),
            peer,
        )
    }

    fn with_fake(fake: FakeApi, config: SessionConfig) -> (CallSessionManager, RemotePeer, Arc<FakeApi>) {
        let fake = Arc::new(fake);
        let (manager, peer) = with_api(fake.clone(), config);
        (manager, peer, fake)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn drain_statuses(subscription: &mut Subscription) -> Vec<CallStatus> {
        let mut statuses = Vec::new();
        while let Some(event) = subscription.try_recv() {
            if let SessionEvent::StatusChanged { current, .. } = event {
                statuses.push(current);
            }
        }
        statuses
    }

    async fn next_turn(subscription: &mut Subscription) -> Turn {
        let event = tokio::time::timeout(Duration::from_secs(1), subscription.recv())
            .await
            .expect("no turn event")
            .expect("hub closed");
        match event {
            SessionEvent::TurnClosed(turn) => turn,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ai_practice_text_turn_round_trip() {
        let mut api = MockCallApi::new();
        api.expect_create_call()
            .times(1)
            .returning(|request| Ok(record("abc123", request.kind)));
        api.expect_end_call().times(1).returning(|_| Ok(()));
        let (manager, mut peer) = with_api(Arc::new(api), test_config());
        let mut statuses = manager.subscribe_filtered(EventFilter::StatusChanges);
        let mut turns = manager.subscribe_filtered(EventFilter::CompletedTurns);

        let id = manager
            .create_call(CallKind::AiPractice, None, "en")
            .await
            .unwrap();
        assert_eq!(id, "abc123");
        assert_eq!(manager.status().await, CallStatus::Connected);
        assert_eq!(peer.endpoints(), ["mem://calls/abc123"]);
        assert_eq!(
            drain_statuses(&mut statuses),
            [CallStatus::Initiating, CallStatus::Connected]
        );

        // The server's greeting arrives before any turn; it is not a reply.
        peer.push_json(json!({"type": "bot_response", "text": "Welcome", "call_id": "abc123"}));
        settle().await;
        assert!(manager.turns().await.is_empty());

        let index = manager.submit_text_turn("Hello").await.unwrap();
        assert_eq!(index, 0);
        assert_eq!(
            peer.recv_json().await.unwrap(),
            json!({"type": "text_message", "text": "Hello", "call_id": "abc123"})
        );

        peer.push_json(json!({"type": "bot_response", "text": "Hi there", "call_id": "abc123"}));
        let turn = next_turn(&mut turns).await;
        assert_eq!(turn.state, TurnState::Completed);
        assert_eq!(turn.reply.unwrap().text, "Hi there");

        assert_eq!(manager.end_call().await, CallStatus::Ended);
        assert_eq!(drain_statuses(&mut statuses), [CallStatus::Ended]);
        assert_eq!(peer.closes(), 1);
    }

    #[tokio::test]
    async fn test_end_call_twice_is_a_no_op() {
        let (manager, peer, api) = with_fake(FakeApi::default(), test_config());
        manager
            .create_call(CallKind::AiPractice, None, "en")
            .await
            .unwrap();
        let mut statuses = manager.subscribe_filtered(EventFilter::StatusChanges);

        assert_eq!(manager.end_call().await, CallStatus::Ended);
        assert_eq!(manager.end_call().await, CallStatus::Ended);

        assert_eq!(drain_statuses(&mut statuses), [CallStatus::Ended]);
        assert_eq!(api.ended(), ["c1"]);
        assert_eq!(peer.closes(), 1);
        assert!(manager.session().await.is_none());
    }

    #[tokio::test]
    async fn test_counselor_call_rejected_by_peer() {
        let (manager, peer, api) = with_fake(FakeApi::default(), test_config());
        let id = manager
            .create_call(CallKind::Counselor, Some("c9".into()), "en")
            .await
            .unwrap();
        assert_eq!(manager.status().await, CallStatus::Ringing);

        peer.push_json(json!({"type": "call_rejected", "call_id": id}));
        settle().await;

        assert_eq!(manager.status().await, CallStatus::Rejected);
        assert_eq!(peer.closes(), 1);
        assert!(api.ended().is_empty());
        assert!(matches!(
            manager.submit_text_turn("anyone?").await,
            Err(CallError::NotConnected {
                status: CallStatus::Rejected
            })
        ));
    }

    #[tokio::test]
    async fn test_counselor_call_requires_callee() {
        let (manager, peer, _api) = with_fake(FakeApi::default(), test_config());
        let err = manager
            .create_call(CallKind::Counselor, None, "en")
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::MissingCallee));
        assert_eq!(manager.status().await, CallStatus::Idle);
        assert!(peer.endpoints().is_empty());
    }

    #[tokio::test]
    async fn test_answer_connects_a_ringing_call() {
        let (manager, peer, _api) = with_fake(FakeApi::default(), test_config());
        let mut notices = manager.subscribe_filtered(EventFilter::Notices);
        manager
            .create_call(CallKind::Counselor, Some("c9".into()), "en")
            .await
            .unwrap();

        peer.push_json(json!({"type": "answer", "answer": {"sdp": "v=0"}, "call_id": "c1"}));
        settle().await;

        assert_eq!(manager.status().await, CallStatus::Connected);
        match notices.try_recv() {
            Some(SessionEvent::Negotiation { session_id, message }) => {
                assert_eq!(session_id, "c1");
                assert_eq!(
                    message,
                    SignalingMessage::Answer {
                        body: json!({"sdp": "v=0"})
                    }
                );
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_second_turn_while_pending_is_rejected() {
        let (manager, mut peer, _api) = with_fake(FakeApi::default(), test_config());
        manager
            .create_call(CallKind::AiPractice, None, "en")
            .await
            .unwrap();

        manager
            .submit_voice_turn(Bytes::from_static(b"pcm"))
            .await
            .unwrap();
        assert_eq!(
            peer.recv_json().await.unwrap(),
            json!({"type": "voice_message", "audio": "cGNt", "call_id": "c1"})
        );

        let err = manager.submit_text_turn("too soon").await.unwrap_err();
        assert!(matches!(err, CallError::TurnInProgress));
        assert!(peer.try_recv().is_none());
        assert_eq!(manager.turns().await.len(), 1);
    }

    #[tokio::test]
    async fn test_end_while_ringing_does_not_wait_for_the_server() {
        let fake = FakeApi {
            teardown_hangs: true,
            ..FakeApi::default()
        };
        let (manager, peer, api) = with_fake(fake, test_config());
        manager
            .create_call(CallKind::Emergency, Some("e1".into()), "en")
            .await
            .unwrap();
        let mut statuses = manager.subscribe_filtered(EventFilter::StatusChanges);

        let ended = tokio::time::timeout(Duration::from_secs(1), manager.end_call())
            .await
            .expect("end_call must be bounded");

        assert_eq!(ended, CallStatus::Ended);
        assert_eq!(drain_statuses(&mut statuses), [CallStatus::Ended]);
        assert_eq!(peer.closes(), 1);
        assert_eq!(api.ended(), ["c1"]);
    }

    #[tokio::test]
    async fn test_create_timeout_fails_the_call() {
        let fake = FakeApi {
            create_hangs: true,
            ..FakeApi::default()
        };
        let (manager, peer, _api) = with_fake(fake, test_config());

        let err = manager
            .create_call(CallKind::AiPractice, None, "en")
            .await
            .unwrap_err();

        assert!(matches!(err, CallError::CreateTimedOut(_)));
        assert_eq!(manager.status().await, CallStatus::Failed);
        assert!(peer.endpoints().is_empty());

        // A failed call does not block the next one.
        let mut api = MockCallApi::new();
        api.expect_create_call()
            .returning(|_| Err(ApiError::Status { status: 500, body: "boom".into() }));
        let (manager, _peer) = with_api(Arc::new(api), test_config());
        let err = manager
            .create_call(CallKind::AiPractice, None, "en")
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::CreateFailed(ApiError::Status { status: 500, .. })));
        assert_eq!(manager.status().await, CallStatus::Ended);
    }

    #[tokio::test]
    async fn test_second_create_while_active_is_rejected() {
        let (manager, _peer, _api) = with_fake(FakeApi::default(), test_config());
        manager
            .create_call(CallKind::AiPractice, None, "en")
            .await
            .unwrap();
        let err = manager
            .create_call(CallKind::AiPractice, None, "en")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CallError::AlreadyInCall {
                status: CallStatus::Connected
            }
        ));

        manager.end_call().await;
        manager
            .create_call(CallKind::AiPractice, None, "fr")
            .await
            .unwrap();
        assert_eq!(manager.session().await.unwrap().language, "fr");
    }

    #[tokio::test]
    async fn test_unreachable_signaling_fails_the_call() {
        let (manager, peer, api) = with_fake(FakeApi::default(), test_config());
        peer.set_mode(ConnectMode::Refuse);

        let err = manager
            .create_call(CallKind::AiPractice, None, "en")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CallError::Connection(ConnectionError::Unreachable { .. })
        ));
        assert_eq!(manager.status().await, CallStatus::Failed);
        assert_eq!(api.ended(), ["c1"]);
    }

    #[tokio::test]
    async fn test_remote_errors_fail_turns_then_the_call() {
        let (manager, mut peer, api) = with_fake(FakeApi::default(), test_config());
        let mut all = manager.subscribe();
        manager
            .create_call(CallKind::AiPractice, None, "en")
            .await
            .unwrap();

        manager.submit_text_turn("q").await.unwrap();
        peer.recv().await.unwrap();
        peer.push_json(json!({"type": "error", "message": "transcription failed"}));
        settle().await;

        let turns = manager.turns().await;
        assert_eq!(turns[0].state, TurnState::Failed);
        assert_eq!(manager.status().await, CallStatus::Connected);
        let notices: Vec<_> = std::iter::from_fn(|| all.try_recv())
            .filter(|e| matches!(e, SessionEvent::RemoteError { .. }))
            .collect();
        assert_eq!(
            notices,
            [SessionEvent::RemoteError {
                session_id: Some("c1".into()),
                message: "transcription failed".into()
            }]
        );

        peer.push_json(json!({"type": "error", "message": "again"}));
        peer.push_json(json!({"type": "error", "message": "and again"}));
        settle().await;

        assert_eq!(manager.status().await, CallStatus::Failed);
        assert_eq!(peer.closes(), 1);
        assert_eq!(api.ended(), ["c1"]);
    }

    #[tokio::test]
    async fn test_lost_channel_fails_the_call_and_abandons_the_turn() {
        let (manager, peer, api) = with_fake(FakeApi::default(), test_config());
        let mut turns = manager.subscribe_filtered(EventFilter::Turns);
        manager
            .create_call(CallKind::AiPractice, None, "en")
            .await
            .unwrap();
        manager.submit_text_turn("q").await.unwrap();

        peer.hang_up();
        let turn = next_turn(&mut turns).await;

        assert_eq!(turn.state, TurnState::Abandoned);
        settle().await;
        assert_eq!(manager.status().await, CallStatus::Failed);
        assert_eq!(api.ended(), ["c1"]);
    }

    #[tokio::test]
    async fn test_lost_channel_is_reopened_when_configured() {
        let config = SessionConfig {
            reconnect_attempts: 2,
            ..test_config()
        };
        let (manager, mut peer, _api) = with_fake(FakeApi::default(), config);
        manager
            .create_call(CallKind::AiPractice, None, "en")
            .await
            .unwrap();

        peer.hang_up();
        settle().await;

        assert_eq!(manager.status().await, CallStatus::Connected);
        assert_eq!(peer.endpoints(), ["mem://calls/c1", "mem://calls/c1"]);
        manager.submit_text_turn("still there?").await.unwrap();
        assert_eq!(peer.recv_json().await.unwrap()["text"], "still there?");
    }

    #[tokio::test]
    async fn test_unanswered_call_is_missed() {
        let config = SessionConfig {
            ring_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let (manager, peer, api) = with_fake(FakeApi::default(), config);
        manager
            .create_call(CallKind::Counselor, Some("c9".into()), "en")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(manager.status().await, CallStatus::Missed);
        assert_eq!(peer.closes(), 1);
        assert_eq!(api.ended(), ["c1"]);
    }

    #[tokio::test]
    async fn test_end_during_create_ends_the_orphaned_call() {
        let fake = FakeApi {
            create_delay: Duration::from_millis(100),
            ..FakeApi::default()
        };
        let (manager, peer, api) = with_fake(fake, test_config());

        let creating = tokio::spawn({
            let manager = manager.clone();
            async move { manager.create_call(CallKind::AiPractice, None, "en").await }
        });
        settle().await;
        assert_eq!(manager.status().await, CallStatus::Initiating);
        assert_eq!(manager.end_call().await, CallStatus::Ended);

        let err = creating.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            CallError::Aborted {
                status: CallStatus::Ended
            }
        ));
        assert_eq!(manager.status().await, CallStatus::Ended);
        assert_eq!(api.ended(), ["c1"]);
        assert!(peer.endpoints().is_empty());
    }

    #[tokio::test]
    async fn test_end_while_connecting_stops_waiting_for_the_channel() {
        let config = SessionConfig {
            connect_timeout: Duration::from_secs(10),
            ..test_config()
        };
        let (manager, peer, api) = with_fake(FakeApi::default(), config);
        peer.set_mode(ConnectMode::Stall);

        let creating = tokio::spawn({
            let manager = manager.clone();
            async move { manager.create_call(CallKind::AiPractice, None, "en").await }
        });
        settle().await;
        assert_eq!(peer.endpoints(), ["mem://calls/c1"]);
        assert_eq!(manager.end_call().await, CallStatus::Ended);

        let result = tokio::time::timeout(Duration::from_secs(1), creating)
            .await
            .expect("create_call must return once the call ended")
            .unwrap();
        assert!(matches!(
            result,
            Err(CallError::Aborted {
                status: CallStatus::Ended
            })
        ));
        assert_eq!(api.ended(), ["c1"]);
        assert_eq!(peer.closes(), 0);
    }

    #[tokio::test]
    async fn test_local_end_racing_remote_call_ended_settles_once() {
        let (manager, peer, _api) = with_fake(FakeApi::default(), test_config());
        let mut statuses = manager.subscribe_filtered(EventFilter::StatusChanges);
        manager
            .create_call(CallKind::AiPractice, None, "en")
            .await
            .unwrap();

        peer.push_json(json!({"type": "call_ended", "call_id": "c1"}));
        let ended = manager.end_call().await;
        settle().await;

        assert!(ended.is_terminal());
        assert_eq!(manager.status().await, CallStatus::Ended);
        assert_eq!(
            drain_statuses(&mut statuses),
            [CallStatus::Initiating, CallStatus::Connected, CallStatus::Ended]
        );
        assert_eq!(peer.closes(), 1);
    }

    #[tokio::test]
    async fn test_turn_without_reply_fails_after_timeout() {
        let config = SessionConfig {
            turn_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let (manager, peer, _api) = with_fake(FakeApi::default(), config);
        let mut turns = manager.subscribe_filtered(EventFilter::Turns);
        manager
            .create_call(CallKind::AiPractice, None, "en")
            .await
            .unwrap();
        manager.submit_text_turn("hello?").await.unwrap();

        let turn = next_turn(&mut turns).await;
        assert_eq!(turn.state, TurnState::Failed);

        // A late reply finds no pending turn.
        peer.push_json(json!({"type": "bot_response", "text": "late", "call_id": "c1"}));
        settle().await;
        assert!(manager.turns().await[0].reply.is_none());
        manager.submit_text_turn("again").await.unwrap();
    }

    #[tokio::test]
    async fn test_frames_for_another_call_are_ignored() {
        let (manager, peer, _api) = with_fake(FakeApi::default(), test_config());
        manager
            .create_call(CallKind::Counselor, Some("c9".into()), "en")
            .await
            .unwrap();

        peer.push_json(json!({"type": "call_ended", "call_id": "someone-else"}));
        settle().await;
        assert_eq!(manager.status().await, CallStatus::Ringing);

        peer.push_json(json!({"type": "call_ended", "call_id": "c1"}));
        settle().await;
        assert_eq!(manager.status().await, CallStatus::Ended);
    }

    #[tokio::test]
    async fn test_incoming_call_accept_and_reject() {
        let (manager, mut peer, api) = with_fake(FakeApi::default(), test_config());
        manager
            .incoming_call("in1", CallKind::Counselor, "en")
            .await
            .unwrap();
        assert_eq!(manager.status().await, CallStatus::Ringing);

        manager.accept_call(json!({"sdp": "v=0"})).await.unwrap();
        assert_eq!(manager.status().await, CallStatus::Connected);
        assert_eq!(
            peer.recv_json().await.unwrap(),
            json!({"type": "answer", "answer": {"sdp": "v=0"}, "call_id": "in1"})
        );
        assert!(matches!(
            manager.reject_call("in1").await,
            Err(CallError::NotRinging { .. })
        ));
        manager.end_call().await;

        manager
            .incoming_call("in2", CallKind::Counselor, "en")
            .await
            .unwrap();
        assert!(matches!(
            manager.reject_call("nope").await,
            Err(CallError::UnknownSession(_))
        ));
        manager.reject_call("in2").await.unwrap();
        assert_eq!(manager.status().await, CallStatus::Rejected);
        assert_eq!(api.rejected(), ["in2"]);
        // Rejecting again is a no-op.
        manager.reject_call("in2").await.unwrap();
        assert_eq!(api.rejected(), ["in2"]);
    }

    #[tokio::test]
    async fn test_cancel_only_while_ringing() {
        let (manager, _peer, api) = with_fake(FakeApi::default(), test_config());
        manager
            .create_call(CallKind::Counselor, Some("c9".into()), "en")
            .await
            .unwrap();
        manager.cancel_call().await.unwrap();
        assert_eq!(manager.status().await, CallStatus::Cancelled);
        assert_eq!(api.ended(), ["c1"]);

        manager
            .create_call(CallKind::AiPractice, None, "en")
            .await
            .unwrap();
        assert!(matches!(
            manager.cancel_call().await,
            Err(CallError::NotRinging {
                status: CallStatus::Connected
            })
        ));
    }

    #[tokio::test]
    async fn test_send_negotiation() {
        let (manager, mut peer, _api) = with_fake(FakeApi::default(), test_config());
        assert!(matches!(
            manager
                .send_negotiation(SignalingMessage::IceCandidate { payload: json!({}) })
                .await,
            Err(CallError::NotConnected {
                status: CallStatus::Idle
            })
        ));
        manager
            .create_call(CallKind::Counselor, Some("c9".into()), "en")
            .await
            .unwrap();

        manager
            .send_negotiation(SignalingMessage::Offer { body: json!("sdp") })
            .await
            .unwrap();
        assert_eq!(
            peer.recv_json().await.unwrap(),
            json!({"type": "offer", "offer": "sdp", "call_id": "c1"})
        );
        assert!(matches!(
            manager.send_negotiation(SignalingMessage::CallEnded).await,
            Err(CallError::NotNegotiation)
        ));
    }

    #[tokio::test]
    async fn test_history_and_counselors_pass_through() {
        let mut api = MockCallApi::new();
        api.expect_call_history()
            .times(1)
            .returning(|_| Ok(vec![record("old", CallKind::Counselor)]));
        api.expect_available_counselors().times(1).returning(|_| {
            Err(ApiError::Transport("connection reset".into()))
        });
        let (manager, _peer) = with_api(Arc::new(api), test_config());

        let history = manager.call_history(Some(CallKind::Counselor)).await.unwrap();
        assert_eq!(history[0].call_id, "old");
        assert!(matches!(
            manager.available_counselors("en").await,
            Err(CallError::Api(ApiError::Transport(_)))
        ));
    }
}
