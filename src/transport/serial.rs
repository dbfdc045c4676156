//! Serial line transport.
//!
//! The port is a device file (`/dev/ttyUSB0`, a pty) opened by the serial
//! connector. The descriptor is switched to non-blocking mode and
//! registered with the reactor, so a read waiting for the host never holds
//! up a response being written. A terminal is put into raw mode; speed and
//! parity are left to the platform.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{Transport, TransportKind};

/// Opened serial device.
pub struct SerialTransport {
    port: AsyncFd<File>,
    path: PathBuf,
}

impl SerialTransport {
    /// Register an opened device with the reactor.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails if the descriptor cannot be made non-blocking or cannot be
    /// polled (a regular file, for one).
    pub fn new(port: File, path: impl AsRef<Path>) -> io::Result<Self> {
        let fd = port.as_raw_fd();
        set_nonblocking(fd)?;
        if is_terminal(fd) {
            make_raw(fd)?;
        }

        Ok(Self {
            port: AsyncFd::new(port)?,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Device path this port was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn peer(&self) -> String {
        self.path.display().to_string()
    }
}

impl AsyncRead for SerialTransport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.port.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|port| port.get_ref().read(unfilled)) {
                Ok(Ok(len)) => {
                    buf.advance(len);
                    return Poll::Ready(Ok(()));
                }
                // A pty reports EIO once the other side hangs up.
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => {
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for SerialTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.port.poll_write_ready(cx))?;
            match guard.try_io(|port| port.get_ref().write(buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Writes go straight to the descriptor.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: `fd` belongs to a `File` that outlives both calls.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn is_terminal(fd: RawFd) -> bool {
    // SAFETY: `isatty` only inspects the descriptor.
    unsafe { libc::isatty(fd) == 1 }
}

/// Disable echo, line editing and byte translation on a terminal.
fn make_raw(fd: RawFd) -> io::Result<()> {
    // SAFETY: `termios` is plain data, filled in by `tcgetattr` before use.
    let mut termios: libc::termios = unsafe { std::mem::zeroed() };
    // SAFETY: `fd` is open and `termios` is a valid out pointer.
    if unsafe { libc::tcgetattr(fd, &mut termios) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `termios` was initialized by `tcgetattr`.
    unsafe { libc::cfmakeraw(&mut termios) };
    termios.c_cflag |= libc::CREAD | libc::CLOCAL;
    // SAFETY: `fd` is open and `termios` is initialized.
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &termios) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
