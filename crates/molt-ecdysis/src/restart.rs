//! Reload: spawn a successor process that inherits the listening socket.
//!
//! The predecessor duplicates its listener, launches the current binary with
//! the duplicate at [`INHERITED_FD`] and the [`ROLE_ENV`] marker set, then
//! keeps serving. It only starts draining once the successor signals it
//! with SIGTERM. The listener is never closed here.

use std::ffi::OsString;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tracing::{error, info, instrument};

use crate::error::EcdysisError;
use crate::listener::{ListenerHandle, INHERITED_FD, ROLE_ENV};

/// Where the handoff state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadState {
    /// No reload has happened yet.
    Idle,
    /// A descriptor is being prepared and a successor launched.
    HandoffRequested,
    /// The last reload launched this successor.
    ChildSpawned { pid: u32 },
}

/// Launches successor generations on reload.
pub struct ReloadProtocol {
    program: PathBuf,
    args: Vec<OsString>,
    state: Mutex<ReloadState>,
}

impl ReloadProtocol {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
            state: Mutex::new(ReloadState::Idle),
        }
    }

    /// Re-launch the running executable with the same arguments.
    pub fn current_exe() -> Result<Self, EcdysisError> {
        let program = std::env::current_exe().map_err(|e| {
            EcdysisError::configuration(format!("failed to determine current executable: {e}"))
        })?;
        Ok(Self::new(program, std::env::args_os().skip(1).collect()))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn state(&self) -> ReloadState {
        *self.state.lock()
    }

    /// Hand the listener to a new successor process and return its pid.
    ///
    /// On failure the state reverts and the caller keeps serving; nothing is
    /// retried.
    #[instrument(skip(self, listener), fields(addr = %listener.local_addr()))]
    pub fn reload(&self, listener: &ListenerHandle) -> Result<u32, EcdysisError> {
        let child = self.spawn_successor(listener)?;
        child
            .id()
            .ok_or_else(|| EcdysisError::Spawn(std::io::Error::other("successor exited before reporting its pid")))
    }

    pub(crate) fn spawn_successor(&self, listener: &ListenerHandle) -> Result<Child, EcdysisError> {
        let previous = {
            let mut state = self.state.lock();
            if *state == ReloadState::HandoffRequested {
                return Err(EcdysisError::ReloadInProgress);
            }
            std::mem::replace(&mut *state, ReloadState::HandoffRequested)
        };

        let result = listener.handoff_fd().and_then(|fd| self.spawn(fd));

        let mut state = self.state.lock();
        match &result {
            Ok(child) => {
                let pid = child.id().unwrap_or_default();
                *state = ReloadState::ChildSpawned { pid };
                info!(pid, program = %self.program.display(), "Spawned successor process");
            }
            Err(err) => {
                *state = previous;
                error!(error = %err, "Reload aborted, continuing to serve");
            }
        }
        result
    }

    fn spawn(&self, fd: OwnedFd) -> Result<Child, EcdysisError> {
        let source = fd.as_raw_fd();

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env(ROLE_ENV, "1")
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        // SAFETY: the closure only calls dup2 and fcntl, which are
        // async-signal-safe.
        unsafe {
            command.pre_exec(move || place_inherited_fd(source));
        }

        let child = command.spawn().map_err(EcdysisError::Spawn)?;
        // The child holds its own copy now.
        drop(fd);
        Ok(child)
    }
}

/// Runs in the forked child: move `source` to [`INHERITED_FD`] and make it
/// survive exec.
fn place_inherited_fd(source: RawFd) -> std::io::Result<()> {
    if source != INHERITED_FD && unsafe { libc::dup2(source, INHERITED_FD) } < 0 {
        return Err(std::io::Error::last_os_error());
    }

    let flags = unsafe { libc::fcntl(INHERITED_FD, libc::F_GETFD) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(INHERITED_FD, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
