//! Local shell backend using portable-pty.
//!
//! Spawns the configured shell on a pseudo-terminal and exposes the master
//! side as a non-blocking, reactor-registered backend session. Only loopback
//! targets are served, and only to requests presenting the configured
//! username and password.

use super::{reject_private_key, secrets_match};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::IpAddr;
use std::os::fd::{BorrowedFd, RawFd};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use termgate_core::{BoxedSession, ConnectFailure, Connector, Target};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, info};

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Spawns a local shell per connect request.
pub struct PtyConnector {
    shell: String,
    term: String,
    allow_user: String,
    password: String,
}

impl PtyConnector {
    pub fn new(shell: String, term: String, allow_user: String, password: String) -> Self {
        Self {
            shell,
            term,
            allow_user,
            password,
        }
    }
}

fn is_loopback(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.to_canonical().is_loopback())
            .unwrap_or(false)
}

impl Connector for PtyConnector {
    fn connect(&self, target: &Target, _timeout: Duration) -> Result<BoxedSession, ConnectFailure> {
        if !is_loopback(&target.host) {
            return Err(ConnectFailure::unreachable(target));
        }
        reject_private_key(target, "pty")?;
        let password = target.credentials.password.as_deref().unwrap_or_default();
        let user_ok = target.credentials.username == self.allow_user;
        if !(secrets_match(password, &self.password) && user_ok) {
            debug!(user = %target.credentials.username, "pty login refused");
            return Err(ConnectFailure::AuthenticationFailed);
        }

        let session = PtySession::spawn(&self.shell, &self.term).map_err(|e| {
            debug!(shell = %self.shell, error = %e, "failed to spawn pty shell");
            ConnectFailure::unreachable(target)
        })?;
        Ok(Box::new(session))
    }
}

/// A shell running on a PTY, read and written through the master fd.
pub struct PtySession {
    /// Non-blocking duplicate of the master fd, registered with the reactor.
    fd: AsyncFd<File>,
    /// Keeps the PTY open for as long as the session lives.
    _master: Box<dyn MasterPty + Send>,
    child: Option<Box<dyn Child + Send + Sync>>,
}

impl PtySession {
    /// Spawn `shell` on a fresh PTY.
    ///
    /// Must be called from within a tokio runtime (the fd is registered with
    /// the current reactor).
    pub fn spawn(shell: &str, term: &str) -> io::Result<Self> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| io::Error::other(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.env("TERM", term);
        if let Some(home) = dirs::home_dir() {
            cmd.cwd(home);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| io::Error::other(format!("failed to spawn command: {e}")))?;
        // Only the child keeps the slave open, so its exit surfaces as EOF.
        drop(pair.slave);

        let raw: RawFd = pair
            .master
            .as_raw_fd()
            .ok_or_else(|| io::Error::other("PTY master has no file descriptor"))?;
        // SAFETY: `raw` belongs to `pair.master`, which outlives this borrow.
        let owned = unsafe { BorrowedFd::borrow_raw(raw) }.try_clone_to_owned()?;
        set_nonblocking(&owned)?;
        let fd = AsyncFd::with_interest(File::from(owned), Interest::READABLE | Interest::WRITABLE)?;

        info!(shell, term, "pty shell spawned");
        Ok(Self {
            fd,
            _master: pair.master,
            child: Some(child),
        })
    }

    /// Kill the shell (if still running) and reap it off the event loop.
    fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let mut reap = move || {
            if let Ok(None) = child.try_wait() {
                let _ = child.kill();
            }
            match child.wait() {
                Ok(status) => debug!(code = status.exit_code(), "pty shell exited"),
                Err(e) => debug!(error = %e, "failed to reap pty shell"),
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(reap);
            }
            Err(_) => reap(),
        }
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn set_nonblocking(fd: &std::os::fd::OwnedFd) -> io::Result<()> {
    use std::os::fd::AsRawFd;
    let raw = fd.as_raw_fd();
    // SAFETY: plain fcntl flag manipulation on a descriptor we own.
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl AsyncRead for PtySession {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            let mut guard = ready!(this.fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| inner.get_ref().read(unfilled)) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                // Linux reports EIO on the master once the shell has exited.
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => return Poll::Ready(Ok(())),
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for PtySession {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            let mut guard = ready!(this.fd.poll_write_ready(cx))?;
            match guard.try_io(|inner| inner.get_ref().write(data)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().terminate();
        Poll::Ready(Ok(()))
    }
}
