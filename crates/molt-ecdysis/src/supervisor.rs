//! Process-level supervision: listener acquisition by role, parent
//! notification, and signal dispatch.
//!
//! - `SIGINT` / `SIGTERM`: graceful shutdown (drain, then exit)
//! - `SIGHUP`: reload (spawn a successor that inherits the listener)

use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use crate::error::EcdysisError;
use crate::listener::{ListenerHandle, ProcessRole};
use crate::registry::ConnectionRegistry;
use crate::restart::ReloadProtocol;
use crate::shutdown::{DrainCoordinator, ShutdownOutcome};

/// Owns the listener, registry, drain coordinator and reload protocol of one
/// process generation.
pub struct ProcessSupervisor {
    role: ProcessRole,
    listener: Arc<ListenerHandle>,
    registry: ConnectionRegistry,
    coordinator: Arc<DrainCoordinator>,
    reload: ReloadProtocol,
}

impl ProcessSupervisor {
    /// Acquire the listener for `role`.
    ///
    /// A `Spawned` generation adopts the inherited descriptor; a `Primary`
    /// binds `bind_addr`. Either failure is fatal to startup.
    pub async fn start(
        role: ProcessRole,
        bind_addr: &str,
        drain_timeout: Duration,
        reload: ReloadProtocol,
    ) -> Result<Self, EcdysisError> {
        let listener = match role {
            ProcessRole::Spawned => ListenerHandle::inherit()?,
            ProcessRole::Primary => ListenerHandle::bind(bind_addr).await?,
        };
        Ok(Self::with_listener(role, listener, drain_timeout, reload))
    }

    /// Build a supervisor around an already acquired listener.
    pub fn with_listener(
        role: ProcessRole,
        listener: ListenerHandle,
        drain_timeout: Duration,
        reload: ReloadProtocol,
    ) -> Self {
        let listener = Arc::new(listener);
        let registry = ConnectionRegistry::new();
        let coordinator = Arc::new(DrainCoordinator::new(
            Arc::clone(&listener),
            registry.clone(),
            drain_timeout,
        ));

        info!(
            role = %role,
            addr = %listener.local_addr(),
            drain_timeout_ms = drain_timeout.as_millis() as u64,
            "Process supervisor ready"
        );

        Self {
            role,
            listener,
            registry,
            coordinator,
            reload,
        }
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn listener(&self) -> &Arc<ListenerHandle> {
        &self.listener
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<DrainCoordinator> {
        &self.coordinator
    }

    pub fn reload_protocol(&self) -> &ReloadProtocol {
        &self.reload
    }

    /// Hand the listener to a successor. Errors are returned, never fatal.
    pub fn reload(&self) -> Result<u32, EcdysisError> {
        self.reload.reload(&self.listener)
    }

    /// Start draining in the background. Repeated calls are no-ops.
    pub fn begin_shutdown(&self) {
        let coordinator = Arc::clone(&self.coordinator);
        tokio::spawn(async move {
            coordinator.shutdown().await;
        });
    }

    /// Tell the predecessor to start draining. Only a `Spawned` generation
    /// has one; returns the signalled pid.
    pub fn notify_parent(&self) -> Option<u32> {
        if self.role != ProcessRole::Spawned {
            return None;
        }

        let parent = std::os::unix::process::parent_id();
        if parent <= 1 {
            warn!(parent, "Predecessor already gone, not signalling");
            return None;
        }

        let result = unsafe { libc::kill(parent as libc::pid_t, libc::SIGTERM) };
        if result != 0 {
            warn!(
                parent,
                error = %std::io::Error::last_os_error(),
                "Failed to signal predecessor"
            );
            return None;
        }

        info!(parent, "Signalled predecessor to drain");
        Some(parent)
    }

    /// Dispatch signals until shutdown completes.
    ///
    /// Installs the handlers, notifies the predecessor if this generation was
    /// spawned, then loops: interrupt/terminate start the drain, hang-up
    /// reloads. Returns the drain outcome once the process may exit.
    pub async fn run(&self) -> Result<ShutdownOutcome, EcdysisError> {
        let mut interrupt = install(SignalKind::interrupt(), "SIGINT")?;
        let mut terminate = install(SignalKind::terminate(), "SIGTERM")?;
        let mut hangup = install(SignalKind::hangup(), "SIGHUP")?;

        self.notify_parent();

        loop {
            tokio::select! {
                _ = self.coordinator.exit_ready() => break,
                _ = interrupt.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                    self.begin_shutdown();
                }
                _ = terminate.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                    self.begin_shutdown();
                }
                _ = hangup.recv() => {
                    info!("Received SIGHUP, handing listener to a successor");
                    match self.reload() {
                        Ok(pid) => info!(pid, "Reload handed off, waiting for successor to signal"),
                        Err(err) => error!(error = %err, "Reload failed"),
                    }
                }
            }
        }

        Ok(self.coordinator.shutdown().await)
    }
}

fn install(
    kind: SignalKind,
    name: &'static str,
) -> Result<tokio::signal::unix::Signal, EcdysisError> {
    signal(kind).map_err(|source| EcdysisError::Signal { name, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn primary(timeout: Duration) -> ProcessSupervisor {
        ProcessSupervisor::start(
            ProcessRole::Primary,
            "127.0.0.1:0",
            timeout,
            ReloadProtocol::new("/bin/true", Vec::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_primary_binds_fresh_listener() {
        let supervisor = primary(Duration::from_secs(1)).await;

        assert_eq!(supervisor.role(), ProcessRole::Primary);
        assert_ne!(supervisor.listener().local_addr().port(), 0);
        assert!(supervisor.registry().is_empty());
    }

    #[tokio::test]
    async fn test_primary_does_not_notify_parent() {
        let supervisor = primary(Duration::from_secs(1)).await;
        assert_eq!(supervisor.notify_parent(), None);
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let result = ProcessSupervisor::start(
            ProcessRole::Primary,
            &addr,
            Duration::from_secs(1),
            ReloadProtocol::new("/bin/true", Vec::new()),
        )
        .await;

        assert!(matches!(result, Err(EcdysisError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown() {
        let supervisor = Arc::new(primary(Duration::from_millis(100)).await);

        let runner = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.run().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        supervisor.begin_shutdown();
        supervisor.begin_shutdown();

        let outcome = tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, ShutdownOutcome::DrainedEmpty);
        assert!(supervisor.listener().is_closed());
    }

    #[tokio::test]
    async fn test_reload_after_shutdown_is_reported() {
        let supervisor = primary(Duration::from_millis(10)).await;
        supervisor.coordinator().shutdown().await;

        let err = supervisor.reload().unwrap_err();
        assert!(err.is_configuration());
    }
}
