//! In-memory transport used by unit tests.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::channel::mpsc;
use futures::{Sink, Stream, StreamExt};

use crate::frame::Frame;
use crate::pump::{ConnectionPump, PumpOptions};

/// Transport side handed to a [`ConnectionPump`].
pub(crate) struct MemoryTransport {
    incoming: mpsc::UnboundedReceiver<io::Result<Frame>>,
    written: mpsc::UnboundedSender<Frame>,
    closes: Arc<AtomicUsize>,
    stalled: bool,
}

/// Remote end of a [`MemoryTransport`].
pub(crate) struct Peer {
    incoming: mpsc::UnboundedSender<io::Result<Frame>>,
    pub written: mpsc::UnboundedReceiver<Frame>,
    closes: Arc<AtomicUsize>,
}

impl MemoryTransport {
    pub fn pair() -> (Self, Peer) {
        Self::build(false)
    }

    /// A transport whose write side never becomes ready.
    pub fn stalled_pair() -> (Self, Peer) {
        Self::build(true)
    }

    fn build(stalled: bool) -> (Self, Peer) {
        let (incoming_tx, incoming_rx) = mpsc::unbounded();
        let (written_tx, written_rx) = mpsc::unbounded();
        let closes = Arc::new(AtomicUsize::new(0));
        (
            Self {
                incoming: incoming_rx,
                written: written_tx,
                closes: Arc::clone(&closes),
                stalled,
            },
            Peer {
                incoming: incoming_tx,
                written: written_rx,
                closes,
            },
        )
    }
}

impl Peer {
    pub fn send(&self, frame: Frame) {
        let _ = self.incoming.unbounded_send(Ok(frame));
    }

    pub fn fail(&self, reason: &str) {
        let _ = self
            .incoming
            .unbounded_send(Err(io::Error::new(io::ErrorKind::ConnectionReset, reason.to_string())));
    }

    pub fn hang_up(&self) {
        self.incoming.close_channel();
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Stream for MemoryTransport {
    type Item = io::Result<Frame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.incoming.poll_next_unpin(cx)
    }
}

impl Sink<Frame> for MemoryTransport {
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.stalled {
            Poll::Pending
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn start_send(self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        self.written
            .unbounded_send(item)
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.written.close_channel();
        Poll::Ready(Ok(()))
    }
}

/// Open a pump over a fresh in-memory transport.
pub(crate) fn open_pump() -> (ConnectionPump, Peer) {
    let (transport, peer) = MemoryTransport::pair();
    (ConnectionPump::open(transport, None, PumpOptions::default()), peer)
}
