//! Per-connection full-duplex frame relay.
//!
//! A [`ConnectionPump`] owns both halves of an upgraded transport. Two tasks
//! run per connection:
//! - the inbound pump reads frames off the transport into a bounded queue
//!   drained by [`ConnectionPump::receive`];
//! - the outbound pump drains a bounded queue filled by
//!   [`ConnectionPump::write`] onto the transport.
//!
//! Both tasks, and every pending `receive`/`write`, observe one close signal.
//! [`ConnectionPump::close`] fires it exactly once.

use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::ConnectionError;
use crate::frame::Frame;
use crate::registry::RegistryShared;

/// Default capacity of the inbound frame queue.
pub const DEFAULT_INBOUND_CAPACITY: usize = 1024;

/// Default capacity of the outbound frame queue.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Upper bound on flushing and closing the transport once the close signal
/// has fired.
const TRANSPORT_CLOSE_GRACE: Duration = Duration::from_secs(1);

type FrameSink = Pin<Box<dyn Sink<Frame, Error = ConnectionError> + Send>>;

/// Opaque unique connection identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle of a connection. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Open,
    Closing,
    Closed,
}

/// Queue sizing for a pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpOptions {
    /// Frames read from the transport but not yet received.
    pub inbound_capacity: usize,
    /// Frames written by callers but not yet sent on the transport.
    pub outbound_capacity: usize,
}

impl Default for PumpOptions {
    fn default() -> Self {
        Self {
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

/// Handle to one live connection. Cheap to clone; all clones share the
/// same queues and close signal.
#[derive(Clone)]
pub struct ConnectionPump {
    shared: Arc<Shared>,
}

struct Shared {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    inbound: AsyncMutex<mpsc::Receiver<Frame>>,
    outbound: mpsc::Sender<Frame>,
    /// Write half of the transport. Taken by the first closer.
    transport: AsyncMutex<Option<FrameSink>>,
    close_signal: CancellationToken,
    /// Skip flushing the transport on close.
    abort: CancellationToken,
    /// Fires after the transport is closed and the record is detached.
    closed: CancellationToken,
    state: Mutex<LifecycleState>,
    registry: OnceLock<Weak<RegistryShared>>,
}

impl ConnectionPump {
    /// Start pumping frames over `transport`.
    ///
    /// Must be called from within a tokio runtime: the inbound and outbound
    /// pumps are spawned as tasks.
    pub fn open<T, E>(transport: T, peer_addr: Option<SocketAddr>, options: PumpOptions) -> Self
    where
        T: Stream<Item = Result<Frame, E>> + Sink<Frame, Error = E> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let (sink, stream) = transport.split();
        let sink: FrameSink = Box::pin(sink.sink_map_err(ConnectionError::transport));

        let (inbound_tx, inbound_rx) = mpsc::channel(options.inbound_capacity.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(options.outbound_capacity.max(1));

        let pump = Self {
            shared: Arc::new(Shared {
                id: ConnectionId::new(),
                peer_addr,
                inbound: AsyncMutex::new(inbound_rx),
                outbound: outbound_tx,
                transport: AsyncMutex::new(Some(sink)),
                close_signal: CancellationToken::new(),
                abort: CancellationToken::new(),
                closed: CancellationToken::new(),
                state: Mutex::new(LifecycleState::Open),
                registry: OnceLock::new(),
            }),
        };

        tokio::spawn(pump.clone().pump_inbound(stream, inbound_tx));
        tokio::spawn(pump.clone().pump_outbound(outbound_rx));

        debug!(connection = %pump.id(), peer = ?peer_addr, "Connection opened");
        pump
    }

    pub fn id(&self) -> &ConnectionId {
        &self.shared.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr
    }

    pub fn state(&self) -> LifecycleState {
        *self.shared.state.lock()
    }

    /// Whether the close signal has fired.
    pub fn is_closed(&self) -> bool {
        self.shared.close_signal.is_cancelled()
    }

    /// A token that is cancelled when this connection's close signal fires.
    ///
    /// Cancelling the returned token does not close the connection.
    pub fn close_signal(&self) -> CancellationToken {
        self.shared.close_signal.child_token()
    }

    /// Wait until the connection reaches [`LifecycleState::Closed`].
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Dequeue the next inbound frame.
    ///
    /// Fails with [`ConnectionError::Closed`] once the close signal fired,
    /// even if frames are still queued.
    pub async fn receive(&self) -> Result<Frame, ConnectionError> {
        let signal = &self.shared.close_signal;

        let mut inbound = tokio::select! {
            biased;
            _ = signal.cancelled() => return Err(ConnectionError::Closed),
            guard = self.shared.inbound.lock() => guard,
        };

        tokio::select! {
            biased;
            _ = signal.cancelled() => Err(ConnectionError::Closed),
            frame = inbound.recv() => frame.ok_or(ConnectionError::Closed),
        }
    }

    /// Enqueue a frame for the outbound pump. Blocks while the outbound
    /// queue is full.
    pub async fn write(&self, frame: Frame) -> Result<(), ConnectionError> {
        let signal = &self.shared.close_signal;

        tokio::select! {
            biased;
            _ = signal.cancelled() => Err(ConnectionError::Closed),
            sent = self.shared.outbound.send(frame) => sent.map_err(|_| ConnectionError::Closed),
        }
    }

    /// Close the connection.
    ///
    /// The first caller fires the close signal, closes the transport and
    /// detaches the connection from its registry. Every caller returns once
    /// the connection is [`LifecycleState::Closed`]; none observes an error.
    pub async fn close(&self) {
        self.finish().await
    }

    /// Close the connection without flushing the transport.
    ///
    /// Frames still buffered are dropped and the transport is released
    /// instead of closed. Also cuts short a graceful close already in
    /// progress.
    pub async fn abort(&self) {
        self.shared.abort.cancel();
        self.finish().await
    }

    async fn finish(&self) {
        let first = {
            let mut state = self.shared.state.lock();
            if *state == LifecycleState::Open {
                *state = LifecycleState::Closing;
                true
            } else {
                false
            }
        };

        if !first {
            self.shared.closed.cancelled().await;
            return;
        }

        self.shared.close_signal.cancel();

        let transport = self.shared.transport.lock().await.take();
        if let Some(mut transport) = transport {
            let abort = &self.shared.abort;
            if abort.is_cancelled() {
                debug!(connection = %self.id(), "Transport dropped without flushing");
            } else {
                tokio::select! {
                    biased;
                    _ = abort.cancelled() => {
                        debug!(connection = %self.id(), "Transport close aborted");
                    }
                    closed = tokio::time::timeout(TRANSPORT_CLOSE_GRACE, transport.close()) => match closed {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            debug!(connection = %self.id(), error = %err, "Transport close failed");
                        }
                        Err(_) => {
                            debug!(connection = %self.id(), "Transport close timed out");
                        }
                    },
                }
            }
        }

        if let Some(registry) = self.shared.registry.get().and_then(Weak::upgrade) {
            registry.detach(self.id());
        }

        *self.shared.state.lock() = LifecycleState::Closed;
        self.shared.closed.cancel();
        debug!(connection = %self.id(), "Connection closed");
    }

    /// Bind this connection to a registry so that closing removes it.
    ///
    /// Refused if the connection already left `Open` or belongs to another
    /// registry. Called with the registry's lock held.
    pub(crate) fn attach(&self, registry: Weak<RegistryShared>) -> bool {
        let state = self.shared.state.lock();
        if *state != LifecycleState::Open {
            return false;
        }
        self.shared.registry.set(registry).is_ok()
    }

    async fn pump_inbound<S, E>(self, mut stream: S, inbound: mpsc::Sender<Frame>)
    where
        S: Stream<Item = Result<Frame, E>> + Unpin,
        E: std::error::Error,
    {
        let signal = self.shared.close_signal.clone();

        loop {
            let next = tokio::select! {
                biased;
                _ = signal.cancelled() => break,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(frame)) => {
                    trace!(connection = %self.id(), kind = %frame.kind(), len = frame.payload().len(), "Frame received");
                    tokio::select! {
                        biased;
                        _ = signal.cancelled() => break,
                        sent = inbound.send(frame) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
                Some(Err(err)) => {
                    debug!(connection = %self.id(), error = %err, "Read failed, closing connection");
                    self.close().await;
                    break;
                }
                None => {
                    debug!(connection = %self.id(), "Peer ended the stream");
                    self.close().await;
                    break;
                }
            }
        }
    }

    async fn pump_outbound(self, mut outbound: mpsc::Receiver<Frame>) {
        let signal = self.shared.close_signal.clone();

        loop {
            let frame = tokio::select! {
                biased;
                _ = signal.cancelled() => break,
                frame = outbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let mut guard = tokio::select! {
                biased;
                _ = signal.cancelled() => break,
                guard = self.shared.transport.lock() => guard,
            };
            let Some(transport) = guard.as_mut() else {
                break;
            };

            let written = tokio::select! {
                biased;
                _ = signal.cancelled() => break,
                written = transport.send(frame) => written,
            };
            drop(guard);

            if let Err(err) = written {
                debug!(connection = %self.id(), error = %err, "Write failed, closing connection");
                self.close().await;
                break;
            }
        }
    }
}

impl fmt::Debug for ConnectionPump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPump")
            .field("id", &self.shared.id)
            .field("peer_addr", &self.shared.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}
