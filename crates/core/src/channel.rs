//! The signaling channel: one persistent duplex connection per session.
//!
//! Outbound messages are encoded on the caller's side and queued to a writer
//! task, so [`SignalingChannel::send`] never blocks. A reader task decodes
//! inbound frames and hands them, in transport order, to a single
//! [`InboundHandler`].

use crate::error::{CallError, ConnectionError};
use crate::protocol::{self, Frame, SignalingMessage};
use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{Instrument, debug, error, info, warn};

/// Outbound half of a raw text-frame connection.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = ConnectionError> + Send>>;

/// Inbound half of a raw text-frame connection.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ConnectionError>> + Send>>;

/// Establishes raw duplex connections to signaling endpoints.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connects to `endpoint`, failing with a [`ConnectionError`] if it is
    /// unreachable or the handshake fails.
    async fn connect(&self, endpoint: &str) -> Result<(FrameSink, FrameStream), ConnectionError>;
}

/// Receives everything the channel delivers.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    /// Called for every successfully decoded inbound frame, in order.
    async fn on_frame(&self, frame: Frame);

    /// Called once if the connection is lost without a local `close`.
    async fn on_lost(&self, error: ConnectionError);
}

/// A live signaling connection bound to one session.
pub struct SignalingChannel {
    endpoint: String,
    call_id: String,
    outbound: mpsc::UnboundedSender<String>,
    shutdown: watch::Sender<bool>,
    closed: Arc<AtomicBool>,
    released: AtomicBool,
    writer: Mutex<Option<JoinHandle<()>>>,
    close_timeout: Duration,
}

impl SignalingChannel {
    /// Connects to `endpoint` and starts delivering inbound frames to `handler`.
    pub async fn open(
        transport: &dyn Transport,
        endpoint: &str,
        call_id: &str,
        handler: Arc<dyn InboundHandler>,
        close_timeout: Duration,
    ) -> Result<Self, ConnectionError> {
        let (sink, stream) = transport.connect(endpoint).await?;
        info!(%endpoint, %call_id, "Signaling channel connected.");

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let closed = Arc::new(AtomicBool::new(false));
        let span = tracing::info_span!("signaling_channel", %call_id);

        let writer = tokio::spawn(
            write_loop(
                sink,
                outbound_rx,
                shutdown_rx.clone(),
                closed.clone(),
                handler.clone(),
            )
            .instrument(span.clone()),
        );
        tokio::spawn(read_loop(stream, shutdown_rx, closed.clone(), handler).instrument(span));

        Ok(Self {
            endpoint: endpoint.to_owned(),
            call_id: call_id.to_owned(),
            outbound,
            shutdown,
            closed,
            released: AtomicBool::new(false),
            writer: Mutex::new(Some(writer)),
            close_timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    /// Queues `message` for transmission, addressed to this channel's session.
    /// Fails fast with [`ConnectionError::Closed`] once the channel is closed.
    pub fn send(&self, message: SignalingMessage) -> Result<(), CallError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed.into());
        }
        let text = protocol::encode(&Frame::new(message, &self.call_id))?;
        self.outbound
            .send(text)
            .map_err(|_| CallError::from(ConnectionError::Closed))
    }

    /// Flushes queued frames and releases the connection. Idempotent; only the
    /// first call does any work.
    pub async fn close(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = writer {
            let abort = handle.abort_handle();
            if tokio::time::timeout(self.close_timeout, handle).await.is_err() {
                warn!(call_id = %self.call_id, "Signaling writer did not finish in time; aborting it.");
                abort.abort();
            }
        }
        debug!(call_id = %self.call_id, "Signaling channel closed.");
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        // Both tasks stop once the shutdown sender is gone.
        self.closed.store(true, Ordering::SeqCst);
    }
}

async fn write_loop(
    mut sink: FrameSink,
    mut outbound: mpsc::UnboundedReceiver<String>,
    mut shutdown: watch::Receiver<bool>,
    closed: Arc<AtomicBool>,
    handler: Arc<dyn InboundHandler>,
) {
    loop {
        tokio::select! {
            biased;
            next = outbound.recv() => match next {
                Some(text) => {
                    if let Err(e) = sink.send(text).await {
                        error!(error = %e, "Failed to write signaling frame.");
                        // The handler may close the channel, which joins this task.
                        if !closed.swap(true, Ordering::SeqCst) {
                            tokio::spawn(
                                async move { handler.on_lost(e).await }.in_current_span(),
                            );
                        }
                        return;
                    }
                }
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }
    // Frames queued before `close` still go out, in order.
    while let Ok(text) = outbound.try_recv() {
        if sink.send(text).await.is_err() {
            break;
        }
    }
    if let Err(e) = sink.close().await {
        debug!(error = %e, "Error while closing signaling sink.");
    }
}

async fn read_loop(
    mut stream: FrameStream,
    mut shutdown: watch::Receiver<bool>,
    closed: Arc<AtomicBool>,
    handler: Arc<dyn InboundHandler>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = stream.next() => match next {
                Some(Ok(text)) => match protocol::decode(&text) {
                    Ok(frame) => handler.on_frame(frame).await,
                    Err(e) => warn!(error = %e, "Dropping undecodable signaling frame."),
                },
                Some(Err(e)) => {
                    if !closed.swap(true, Ordering::SeqCst) {
                        error!(error = %e, "Signaling connection failed.");
                        handler.on_lost(e).await;
                    }
                    break;
                }
                None => {
                    if !closed.swap(true, Ordering::SeqCst) {
                        error!("Signaling connection closed by the remote end.");
                        handler
                            .on_lost(ConnectionError::Lost("remote end closed the connection".into()))
                            .await;
                    }
                    break;
                }
            },
        }
    }
}
