//! # molt-ecdysis
//!
//! Hot reload and graceful drain for long-lived connection servers.
//!
//! ## Overview
//!
//! A reload hands the listening socket to a new process generation without
//! refusing connections:
//! 1. The running generation receives `SIGHUP` and spawns a successor with the
//!    listener duplicated at fd 3 and `MOLT_RELOAD` set
//! 2. The successor adopts the inherited listener and starts accepting
//! 3. The successor sends `SIGTERM` to its parent
//! 4. The parent stops accepting, drains its connections and exits; stragglers
//!    are force-closed once the drain timeout expires
//!
//! ## Signal Conventions
//!
//! - `SIGINT` / `SIGTERM`: graceful shutdown (drain connections, then exit)
//! - `SIGHUP`: reload (spawn a successor that inherits the listener)
//!
//! ## Connections
//!
//! Each accepted connection is wrapped in a [`ConnectionPump`]: bounded
//! inbound and outbound frame queues serviced by two tasks, with a single
//! idempotent close. Pumps are tracked in a [`ConnectionRegistry`], which the
//! [`DrainCoordinator`] waits on during shutdown.
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("molt-ecdysis requires a Unix platform (Linux or macOS)");

mod error;
mod frame;
mod listener;
mod pump;
mod registry;
mod restart;
mod shutdown;
mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ConnectionError, EcdysisError, FrameError};
pub use frame::{Frame, FrameKind};
pub use listener::{normalize_bind_addr, ListenerHandle, ProcessRole, INHERITED_FD, ROLE_ENV};
pub use pump::{
    ConnectionId, ConnectionPump, LifecycleState, PumpOptions, DEFAULT_INBOUND_CAPACITY,
    DEFAULT_OUTBOUND_CAPACITY,
};
pub use registry::ConnectionRegistry;
pub use restart::{ReloadProtocol, ReloadState};
pub use shutdown::{DrainCoordinator, ShutdownOutcome, ShutdownState, DEFAULT_DRAIN_TIMEOUT};
pub use supervisor::ProcessSupervisor;
