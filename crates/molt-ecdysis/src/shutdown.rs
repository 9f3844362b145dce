//! Graceful shutdown coordinator.
//!
//! Shutdown runs once per process:
//! 1. close the listener and the registry so no new connections are accepted;
//! 2. wait for the registry to drain, bounded by the drain timeout;
//! 3. on timeout, abort every remaining connection concurrently without
//!    flushing its transport;
//! 4. signal exit readiness.
//!
//! Later or concurrent triggers await the same outcome.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::listener::ListenerHandle;
use crate::registry::ConnectionRegistry;

/// Default upper bound on draining.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Shutdown was triggered and is still draining.
    Pending,
    /// Every connection closed on its own before the deadline.
    DrainedEmpty,
    /// The deadline passed and the stragglers were closed.
    ForcedClose,
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownState {
    pub triggered: bool,
    pub deadline: Option<Instant>,
    pub outcome: ShutdownOutcome,
}

/// Coordinator for graceful shutdown with connection draining.
pub struct DrainCoordinator {
    listener: Arc<ListenerHandle>,
    registry: ConnectionRegistry,
    drain_timeout: Duration,
    deadline: OnceLock<Instant>,
    outcome: OnceCell<ShutdownOutcome>,
    exit_ready: CancellationToken,
}

impl DrainCoordinator {
    pub fn new(
        listener: Arc<ListenerHandle>,
        registry: ConnectionRegistry,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            listener,
            registry,
            drain_timeout,
            deadline: OnceLock::new(),
            outcome: OnceCell::new(),
            exit_ready: CancellationToken::new(),
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    pub fn is_triggered(&self) -> bool {
        self.deadline.get().is_some()
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState {
            triggered: self.is_triggered(),
            deadline: self.deadline.get().copied(),
            outcome: self
                .outcome
                .get()
                .copied()
                .unwrap_or(ShutdownOutcome::Pending),
        }
    }

    /// Run the shutdown sequence, or await the one already in flight.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        *self.outcome.get_or_init(|| self.drain()).await
    }

    /// Wait until shutdown has completed and the process may exit.
    pub async fn exit_ready(&self) {
        self.exit_ready.cancelled().await
    }

    pub fn is_exit_ready(&self) -> bool {
        self.exit_ready.is_cancelled()
    }

    async fn drain(&self) -> ShutdownOutcome {
        let deadline = *self
            .deadline
            .get_or_init(|| Instant::now() + self.drain_timeout);

        info!("Stopping accept loop");
        self.listener.close();
        self.registry.begin_drain();

        let active = self.registry.size();
        if active > 0 {
            info!(
                active_connections = active,
                timeout_ms = self.drain_timeout.as_millis() as u64,
                "Draining active connections"
            );
        }

        let outcome = if self.registry.wait_empty(deadline).await {
            info!("All connections drained cleanly");
            ShutdownOutcome::DrainedEmpty
        } else {
            let stragglers = self.registry.snapshot();
            warn!(
                remaining_connections = stragglers.len(),
                timeout_ms = self.drain_timeout.as_millis() as u64,
                "Drain timeout expired, force-closing connections"
            );
            join_all(stragglers.iter().map(|connection| connection.abort())).await;
            ShutdownOutcome::ForcedClose
        };

        self.exit_ready.cancel();
        info!(outcome = ?outcome, "Shutdown complete");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::pump::{ConnectionPump, PumpOptions};
    use crate::testing::{open_pump, MemoryTransport};

    async fn coordinator(timeout: Duration) -> (Arc<DrainCoordinator>, ConnectionRegistry) {
        let listener = Arc::new(ListenerHandle::bind("127.0.0.1:0").await.unwrap());
        let registry = ConnectionRegistry::new();
        let coordinator = Arc::new(DrainCoordinator::new(listener, registry.clone(), timeout));
        (coordinator, registry)
    }

    #[tokio::test]
    async fn test_drain_with_no_connections() {
        let (coordinator, _registry) = coordinator(Duration::from_secs(60)).await;

        let started = Instant::now();
        let outcome = coordinator.shutdown().await;

        assert_eq!(outcome, ShutdownOutcome::DrainedEmpty);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(coordinator.is_exit_ready());
        assert!(coordinator.listener.is_closed());
    }

    #[tokio::test]
    async fn test_graceful_drain() {
        let (coordinator, registry) = coordinator(Duration::from_secs(5)).await;
        let pumps: Vec<_> = (0..3).map(|_| open_pump()).collect();
        for (pump, _) in &pumps {
            registry.add(pump);
        }

        let closers: Vec<_> = pumps.iter().map(|(pump, _)| pump.clone()).collect();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            for pump in closers {
                pump.close().await;
            }
        });

        let started = Instant::now();
        let outcome = coordinator.shutdown().await;

        assert_eq!(outcome, ShutdownOutcome::DrainedEmpty);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_drain_timeout_forces_close() {
        let (coordinator, registry) = coordinator(Duration::from_millis(100)).await;
        let (pump, _peer) = open_pump();
        registry.add(&pump);
        let observer = pump.close_signal();

        let started = Instant::now();
        let outcome = coordinator.shutdown().await;
        let elapsed = started.elapsed();

        assert_eq!(outcome, ShutdownOutcome::ForcedClose);
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");
        assert!(observer.is_cancelled());
        assert!(pump.is_closed());
        assert!(registry.is_empty());
        assert!(coordinator.is_exit_ready());
    }

    #[tokio::test]
    async fn test_forced_close_does_not_wait_on_stalled_transport() {
        let (coordinator, registry) = coordinator(Duration::from_millis(100)).await;
        let (transport, _peer) = MemoryTransport::stalled_pair();
        let pump = ConnectionPump::open(transport, None, PumpOptions::default());
        pump.write(Frame::text("x")).await.unwrap();
        registry.add(&pump);

        let started = Instant::now();
        let outcome = coordinator.shutdown().await;
        let elapsed = started.elapsed();

        assert_eq!(outcome, ShutdownOutcome::ForcedClose);
        assert!(elapsed < Duration::from_millis(300), "took {elapsed:?}");
        assert!(pump.is_closed());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_add_refused_once_shutdown_starts() {
        let (coordinator, registry) = coordinator(Duration::from_millis(100)).await;
        coordinator.shutdown().await;

        let (pump, _peer) = open_pump();
        assert!(!registry.add(&pump));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (coordinator, registry) = coordinator(Duration::from_millis(100)).await;
        let (pump, _peer) = open_pump();
        registry.add(&pump);

        let callers: Vec<_> = (0..5)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move { coordinator.shutdown().await })
            })
            .collect();

        for caller in callers {
            assert_eq!(caller.await.unwrap(), ShutdownOutcome::ForcedClose);
        }

        let state = coordinator.state();
        assert!(state.triggered);
        assert_eq!(state.outcome, ShutdownOutcome::ForcedClose);

        // A later trigger observes the same outcome without waiting again.
        let started = Instant::now();
        assert_eq!(coordinator.shutdown().await, ShutdownOutcome::ForcedClose);
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(coordinator.state().deadline, state.deadline);
    }

    #[tokio::test]
    async fn test_state_before_trigger() {
        let (coordinator, _registry) = coordinator(DEFAULT_DRAIN_TIMEOUT).await;
        let state = coordinator.state();

        assert!(!state.triggered);
        assert_eq!(state.deadline, None);
        assert_eq!(state.outcome, ShutdownOutcome::Pending);
        assert!(!coordinator.is_exit_ready());
    }

    #[tokio::test]
    async fn test_no_accept_after_shutdown() {
        let listener = Arc::new(ListenerHandle::bind("127.0.0.1:0").await.unwrap());
        let addr = listener.local_addr();
        let accept = listener.take_listener().unwrap();
        let stop = listener.stop_token();

        let accept_loop = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    accepted = accept.accept() => drop(accepted),
                }
            }
        });

        assert!(tokio::net::TcpStream::connect(addr).await.is_ok());

        let coordinator = DrainCoordinator::new(
            Arc::clone(&listener),
            ConnectionRegistry::new(),
            Duration::from_secs(1),
        );
        coordinator.shutdown().await;
        accept_loop.await.unwrap();

        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
