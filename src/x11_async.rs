//! X11 Async Event Stream
//!
//! Readiness of the X connection's socket as seen by the tokio reactor.
//! x11rb keeps its own read buffer, so callers must drain
//! [`X11EventStream::poll_next_event`] until it returns `None` before
//! awaiting [`X11EventStream::wait_readable`].

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use x11rb::connection::Connection;
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

/// X11 event stream registered with the current runtime
pub struct X11EventStream {
    conn: Arc<RustConnection>,
    fd: AsyncFd<RawFd>,
}

impl X11EventStream {
    /// Register the connection's socket with the reactor. Must be called
    /// from within a tokio runtime.
    pub fn new(conn: Arc<RustConnection>) -> Result<Self> {
        let raw = conn.stream().as_raw_fd();
        let fd = AsyncFd::with_interest(raw, Interest::READABLE)
            .context("Failed to register the X11 socket with the runtime")?;
        Ok(Self { conn, fd })
    }

    /// Non-blocking: the next queued event, reading from the socket if
    /// the internal buffer is empty. `None` when nothing is pending.
    pub fn poll_next_event(&self) -> Result<Option<Event>> {
        self.conn
            .poll_for_event()
            .context("Failed to poll for X11 events")
    }

    /// Wait until the socket has data. Spurious wake-ups are possible.
    pub async fn wait_readable(&self) -> Result<()> {
        let mut guard = self
            .fd
            .readable()
            .await
            .context("Failed to wait for the X11 socket")?;
        guard.clear_ready();
        Ok(())
    }

    /// Send all buffered requests.
    pub fn flush(&self) -> Result<()> {
        self.conn.flush().context("Failed to flush X11 connection")?;
        Ok(())
    }
}
