//! Error types for listener handoff, draining and connection pumping.

use thiserror::Error;

/// Errors raised by process-level coordination (startup, reload, signals).
#[derive(Debug, Error)]
pub enum EcdysisError {
    /// The listener could not be acquired or handed off: the inherited
    /// descriptor is missing or is not a listening stream socket, or the
    /// handle no longer exposes a descriptor.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Binding a fresh listener failed.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The successor process could not be launched.
    #[error("Failed to spawn successor process: {0}")]
    Spawn(#[source] std::io::Error),

    /// A reload was requested while another handoff was still being prepared.
    #[error("Reload already in progress")]
    ReloadInProgress,

    /// A signal handler could not be installed.
    #[error("Failed to install {name} handler: {source}")]
    Signal {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl EcdysisError {
    /// Create a new configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether this error is the configuration class (fatal at startup,
    /// reported at reload).
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

/// Errors observed by callers of a [`ConnectionPump`](crate::ConnectionPump).
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The connection's close signal fired before or during the call.
    #[error("Connection already closed")]
    Closed,

    /// The underlying transport failed. Only logged by the pump itself; the
    /// failure closes the connection.
    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ConnectionError {
    pub(crate) fn transport<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport(Box::new(err))
    }
}

/// Errors raised while interpreting wire frame values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The integer kind is not one of the known frame kinds.
    #[error("Unknown frame kind: {0}")]
    UnknownKind(u8),
}
