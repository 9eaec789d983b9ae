//! Client side of a real-time call session protocol.
//!
//! A call is created through a REST collaborator ([`api::CallApi`]), then
//! driven over a persistent signaling channel ([`channel::SignalingChannel`])
//! carrying JSON messages ([`protocol`]). [`session::CallSessionManager`]
//! ties the two together and reports every change through
//! [`observer::SessionObserverHub`].

pub mod api;
pub mod channel;
pub mod error;
pub mod model;
pub mod observer;
pub mod protocol;
pub mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod turn;

pub use api::{CallApi, CallRecord, Counselor, CreateCallRequest, HttpCallApi};
pub use channel::{FrameSink, FrameStream, InboundHandler, SignalingChannel, Transport};
pub use error::{ApiError, CallError, ConnectionError, DecodeError, EncodeError};
pub use model::{CallKind, CallSession, CallStatus, Turn, TurnInput, TurnReply, TurnState};
pub use observer::{EventFilter, SessionEvent, SessionObserverHub, Subscription, SubscriptionId};
pub use protocol::{Frame, SignalingMessage};
pub use session::{CallSessionManager, SessionConfig};
