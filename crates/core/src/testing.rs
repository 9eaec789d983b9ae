//! In-memory transport with a scriptable remote peer.

use crate::channel::{FrameSink, FrameStream, Transport};
use crate::error::ConnectionError;
use async_trait::async_trait;
use futures::{Sink, StreamExt};
use serde_json::Value;
use std::pin::Pin;
use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// How the peer answers connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    Accept,
    Refuse,
    /// Never completes the handshake.
    Stall,
}

struct PeerState {
    mode: ConnectMode,
    endpoints: Vec<String>,
    inbound: Option<mpsc::UnboundedSender<String>>,
}

/// A [`Transport`] whose connections all lead to one [`RemotePeer`].
#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<PeerState>>,
    outbound: mpsc::UnboundedSender<String>,
    closes: Arc<AtomicUsize>,
}

/// The far end of a [`MemoryTransport`].
pub struct RemotePeer {
    state: Arc<Mutex<PeerState>>,
    outbound: mpsc::UnboundedReceiver<String>,
    closes: Arc<AtomicUsize>,
}

impl MemoryTransport {
    /// A transport and the peer at the far end of every connection it makes.
    pub fn pair() -> (Self, RemotePeer) {
        let state = Arc::new(Mutex::new(PeerState {
            mode: ConnectMode::Accept,
            endpoints: Vec::new(),
            inbound: None,
        }));
        let (tx, rx) = mpsc::unbounded_channel();
        let closes = Arc::new(AtomicUsize::new(0));
        let transport = Self {
            state: state.clone(),
            outbound: tx,
            closes: closes.clone(),
        };
        let peer = RemotePeer {
            state,
            outbound: rx,
            closes,
        };
        (transport, peer)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, endpoint: &str) -> Result<(FrameSink, FrameStream), ConnectionError> {
        let mode = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.endpoints.push(endpoint.to_owned());
            state.mode
        };
        match mode {
            ConnectMode::Refuse => {
                return Err(ConnectionError::Unreachable {
                    endpoint: endpoint.to_owned(),
                    reason: "connection refused".into(),
                });
            }
            ConnectMode::Stall => std::future::pending::<()>().await,
            ConnectMode::Accept => {}
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .inbound = Some(inbound_tx);

        let sink = PeerSink {
            tx: self.outbound.clone(),
            closes: self.closes.clone(),
            closed: false,
        };
        let stream = UnboundedReceiverStream::new(inbound_rx).map(Ok);
        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

impl RemotePeer {
    pub fn set_mode(&self, mode: ConnectMode) {
        self.lock().mode = mode;
    }

    /// Every endpoint a connection was attempted to, in order.
    pub fn endpoints(&self) -> Vec<String> {
        self.lock().endpoints.clone()
    }

    /// How many times a client closed its side of a connection.
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Delivers a raw frame on the current connection.
    pub fn push(&self, raw: impl Into<String>) -> bool {
        match &self.lock().inbound {
            Some(tx) => tx.send(raw.into()).is_ok(),
            None => false,
        }
    }

    pub fn push_json(&self, value: Value) -> bool {
        self.push(value.to_string())
    }

    /// Ends the current connection from the peer's side.
    pub fn hang_up(&self) {
        self.lock().inbound = None;
    }

    /// The next frame the client sent, waiting up to one second.
    pub async fn recv(&mut self) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(1), self.outbound.recv())
            .await
            .ok()
            .flatten()
    }

    pub async fn recv_json(&mut self) -> Option<Value> {
        let raw = self.recv().await?;
        serde_json::from_str(&raw).ok()
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.outbound.try_recv().ok()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct PeerSink {
    tx: mpsc::UnboundedSender<String>,
    closes: Arc<AtomicUsize>,
    closed: bool,
}

impl Sink<String> for PeerSink {
    type Error = ConnectionError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: String) -> Result<(), Self::Error> {
        self.tx
            .send(item)
            .map_err(|_| ConnectionError::Lost("peer went away".into()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        if !self.closed {
            self.closed = true;
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        Poll::Ready(Ok(()))
    }
}
