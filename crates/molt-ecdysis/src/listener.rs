//! Listening socket acquisition: fresh bind or inheritance from a
//! predecessor generation.
//!
//! A successor finds its listener at descriptor slot 3, right after the
//! standard streams. Anything other than a listening stream socket there is
//! a configuration error: a half-inherited state is a bug in the parent.

use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::EcdysisError;

/// Descriptor slot a successor reads its listening socket from.
pub const INHERITED_FD: RawFd = 3;

/// Environment marker set on a successor process. Any non-empty value means
/// the process was spawned by a predecessor.
pub const ROLE_ENV: &str = "MOLT_RELOAD";

static INHERITED_ADOPTED: AtomicBool = AtomicBool::new(false);

/// How this process generation came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// Started by an operator; binds a fresh socket.
    Primary,
    /// Started by a predecessor during reload; inherits the socket.
    Spawned,
}

impl ProcessRole {
    /// Resolve the role from the startup marker in the environment.
    ///
    /// Call once at startup and pass the result along.
    pub fn from_env() -> Self {
        Self::from_marker(std::env::var(ROLE_ENV).ok().as_deref())
    }

    /// Resolve the role from the marker value, if any.
    pub fn from_marker(marker: Option<&str>) -> Self {
        match marker {
            Some(value) if !value.is_empty() => ProcessRole::Spawned,
            _ => ProcessRole::Primary,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessRole::Primary => "primary",
            ProcessRole::Spawned => "spawned",
        }
    }
}

impl std::fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The listening socket of one process generation.
///
/// The accept side is taken once by the accept loop via
/// [`take_listener`](Self::take_listener). The handle keeps a close-on-exec
/// duplicate of the descriptor for handoff, and a stop token the accept loop
/// observes. [`close`](Self::close) cancels the token and releases the
/// duplicate.
pub struct ListenerHandle {
    local_addr: SocketAddr,
    accept: Mutex<Option<TcpListener>>,
    handoff: Mutex<Option<OwnedFd>>,
    stop: CancellationToken,
}

impl ListenerHandle {
    /// Bind a fresh listener. `:port` binds on all interfaces.
    pub async fn bind(addr: &str) -> Result<Self, EcdysisError> {
        let addr = normalize_bind_addr(addr);
        let listener = TcpListener::bind(addr.as_str())
            .await
            .map_err(|source| EcdysisError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let listener = listener.into_std().map_err(|source| EcdysisError::Bind {
            addr: addr.clone(),
            source,
        })?;

        let handle = Self::from_std(listener)?;
        info!(addr = %handle.local_addr, "Bound fresh listener");
        Ok(handle)
    }

    /// Adopt the listener inherited at [`INHERITED_FD`].
    ///
    /// Fails if the slot is empty, is not a listening stream socket, or was
    /// already adopted by this process.
    pub fn inherit() -> Result<Self, EcdysisError> {
        if INHERITED_ADOPTED.swap(true, Ordering::SeqCst) {
            return Err(EcdysisError::configuration(format!(
                "inherited descriptor {} was already adopted",
                INHERITED_FD
            )));
        }
        let handle = Self::adopt(INHERITED_FD)?;
        info!(fd = INHERITED_FD, addr = %handle.local_addr, "Inherited listener from parent process");
        Ok(handle)
    }

    /// Take ownership of `fd` as a listener after validating it.
    pub(crate) fn adopt(fd: RawFd) -> Result<Self, EcdysisError> {
        validate_stream_listener(fd)?;
        set_cloexec(fd)
            .map_err(|e| EcdysisError::configuration(format!("descriptor {fd}: {e}")))?;

        // SAFETY: fd was validated above as an open listening socket, and
        // this process has no other owner for it.
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Self::from_std(std::net::TcpListener::from(owned))
    }

    /// Wrap an already bound std listener.
    pub fn from_std(listener: std::net::TcpListener) -> Result<Self, EcdysisError> {
        let config = |e: std::io::Error| EcdysisError::configuration(e.to_string());

        listener.set_nonblocking(true).map_err(config)?;
        let local_addr = listener.local_addr().map_err(config)?;
        let handoff = listener.as_fd().try_clone_to_owned().map_err(config)?;
        let accept = TcpListener::from_std(listener).map_err(config)?;

        Ok(Self {
            local_addr,
            accept: Mutex::new(Some(accept)),
            handoff: Mutex::new(Some(handoff)),
            stop: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Take the accept side for the accept loop. Returns `None` after the
    /// first call or once the handle is closed.
    pub fn take_listener(&self) -> Option<TcpListener> {
        self.accept.lock().take()
    }

    /// Token cancelled when the accept loop must stop.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Duplicate the listening descriptor for a successor.
    ///
    /// The duplicate is close-on-exec; the spawner places it at
    /// [`INHERITED_FD`] in the child only.
    pub fn handoff_fd(&self) -> Result<OwnedFd, EcdysisError> {
        let handoff = self.handoff.lock();
        let fd = handoff.as_ref().ok_or_else(|| {
            EcdysisError::configuration("listener is closed and no longer exposes a descriptor")
        })?;

        if !validate_fd(fd.as_raw_fd()) {
            return Err(EcdysisError::configuration(format!(
                "descriptor {} is not a socket",
                fd.as_raw_fd()
            )));
        }

        fd.try_clone()
            .map_err(|e| EcdysisError::configuration(format!("failed to duplicate listener: {e}")))
    }

    /// Stop accepting: cancel the accept loop and release the handoff
    /// duplicate. Idempotent.
    pub fn close(&self) {
        if self.stop.is_cancelled() {
            return;
        }
        self.stop.cancel();
        self.handoff.lock().take();
        self.accept.lock().take();
        debug!(addr = %self.local_addr, "Listener closed");
    }

    pub fn is_closed(&self) -> bool {
        self.stop.is_cancelled()
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Turn `:8550` into `0.0.0.0:8550`; other forms pass through.
pub fn normalize_bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// Validate that a file descriptor is a valid socket using fstat.
pub(crate) fn validate_fd(fd: RawFd) -> bool {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::fstat(fd, &mut stat) };
    if result != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

fn validate_stream_listener(fd: RawFd) -> Result<(), EcdysisError> {
    if !validate_fd(fd) {
        return Err(EcdysisError::configuration(format!(
            "inherited descriptor {fd} is missing or not a socket"
        )));
    }

    let socket_type = socket_option(fd, libc::SO_TYPE)
        .map_err(|e| EcdysisError::configuration(format!("descriptor {fd}: {e}")))?;
    if socket_type != libc::SOCK_STREAM {
        return Err(EcdysisError::configuration(format!(
            "inherited descriptor {fd} is not a stream socket"
        )));
    }

    let listening = socket_option(fd, libc::SO_ACCEPTCONN)
        .map_err(|e| EcdysisError::configuration(format!("descriptor {fd}: {e}")))?;
    if listening == 0 {
        return Err(EcdysisError::configuration(format!(
            "inherited descriptor {fd} is not listening"
        )));
    }

    Ok(())
}

fn socket_option(fd: RawFd, option: libc::c_int) -> std::io::Result<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(value)
}

fn set_cloexec(fd: RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
