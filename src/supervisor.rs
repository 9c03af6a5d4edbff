//! Connection accounting for graceful drain.
//!
//! Every accepted connection holds a [`ConnectionGuard`] on a shared
//! [`ConnectionCounter`]. Releasing the guard, by `close()` or by drop, is
//! the only way to decrement, and it happens at most once per connection.

use pin_project::pin_project;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use crate::listener::{Connection, Listener, PeerAddr};

#[derive(Error, Debug)]
pub enum AcceptError {
    /// The supervisor was closed; accept loops should stop quietly.
    #[error("Listener closed.")]
    Closed,
    #[error("Accept failed: {0}")]
    Io(#[from] io::Error),
}

impl AcceptError {
    pub fn is_closing(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Drain timed out after {}s with {remaining} connection(s) still open.", .timeout.as_secs())]
pub struct DrainTimeout {
    pub remaining: usize,
    pub timeout: Duration,
}

/// Number of currently open connections.
#[derive(Debug, Default)]
pub struct ConnectionCounter {
    count: Mutex<usize>,
    drained: Notify,
}

impl ConnectionCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count one more open connection.
    pub fn acquire(self: &Arc<Self>) -> ConnectionGuard {
        *self.lock() += 1;

        ConnectionGuard {
            counter: Some(Arc::clone(self)),
        }
    }

    pub fn active(&self) -> usize {
        *self.lock()
    }

    /// Wait until every connection is closed, for at most `timeout`.
    pub async fn drain(&self, timeout: Duration) -> Result<(), DrainTimeout> {
        match tokio::time::timeout(timeout, self.wait_for_zero()).await {
            Ok(()) => Ok(()),
            Err(_) => Err(DrainTimeout {
                remaining: self.active(),
                timeout,
            }),
        }
    }

    async fn wait_for_zero(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed.
            notified.as_mut().enable();

            if self.active() == 0 {
                return;
            }

            notified.await;
        }
    }

    fn release(&self) {
        let remaining = {
            let mut count = self.lock();
            debug_assert!(*count > 0, "connection counter underflow");
            *count = count.saturating_sub(1);
            *count
        };

        if remaining == 0 {
            self.drained.notify_waiters();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, usize> {
        // The guarded value is a plain integer, always consistent.
        self.count.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One unit of [`ConnectionCounter`], given back exactly once.
#[derive(Debug)]
pub struct ConnectionGuard {
    counter: Option<Arc<ConnectionCounter>>,
}

impl ConnectionGuard {
    /// Returns whether this call did the decrement.
    pub fn release(&mut self) -> bool {
        match self.counter.take() {
            Some(counter) => {
                counter.release();
                true
            }
            None => false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.counter.is_none()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// An accepted connection that is counted until closed or dropped.
#[pin_project]
#[derive(Debug)]
pub struct TrackedConnection {
    #[pin]
    stream: Connection,
    peer: PeerAddr,
    guard: ConnectionGuard,
}

impl TrackedConnection {
    pub fn new(stream: Connection, peer: PeerAddr, guard: ConnectionGuard) -> Self {
        Self {
            stream,
            peer,
            guard,
        }
    }

    pub fn peer_addr(&self) -> &PeerAddr {
        &self.peer
    }

    /// Shut down the write side and stop counting this connection. Safe to
    /// call any number of times; only the first call touches the counter.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.guard.is_released() {
            return Ok(());
        }

        let result = self.stream.shutdown().await;
        self.guard.release();

        match result {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.guard.is_released()
    }
}

impl AsyncRead for TrackedConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().stream.poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().stream.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().stream.poll_shutdown(cx)
    }
}

/// A listener whose accepted connections are counted.
///
/// Cloning shares the listener, the counter, and the closed state.
#[derive(Debug, Clone)]
pub struct ConnectionSupervisor {
    listener: Arc<Mutex<Option<Arc<Listener>>>>,
    counter: Arc<ConnectionCounter>,
    closed: CancellationToken,
}

impl ConnectionSupervisor {
    pub fn new(listener: Arc<Listener>) -> Self {
        Self {
            listener: Arc::new(Mutex::new(Some(listener))),
            counter: ConnectionCounter::new(),
            closed: CancellationToken::new(),
        }
    }

    pub async fn accept(&self) -> Result<TrackedConnection, AcceptError> {
        let listener = self.listener().ok_or(AcceptError::Closed)?;

        tokio::select! {
            biased;

            _ = self.closed.cancelled() => Err(AcceptError::Closed),
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                // No await between accept and acquire: a connection is
                // counted before anyone can decide to drain.
                let guard = self.counter.acquire();
                debug!(peer = %peer, active = self.counter.active(), "accepted connection");

                Ok(TrackedConnection::new(stream, peer, guard))
            }
        }
    }

    /// Stop every accept loop on this supervisor. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// The listener, until [`release_listener`](Self::release_listener).
    pub fn listener(&self) -> Option<Arc<Listener>> {
        self.slot().clone()
    }

    /// Give up this supervisor's reference to the listener. The descriptor
    /// closes once the returned handle and any in-flight accept are gone, so
    /// new connections are refused unless another process shares the socket.
    pub fn release_listener(&self) -> Option<Arc<Listener>> {
        self.close();
        self.slot().take()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<Listener>>> {
        self.listener.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn counter(&self) -> &Arc<ConnectionCounter> {
        &self.counter
    }

    pub fn active_connections(&self) -> usize {
        self.counter.active()
    }

    /// Wait for in-flight connections after [`close`](Self::close).
    pub async fn drain(&self, timeout: Duration) -> Result<(), DrainTimeout> {
        self.counter.drain(timeout).await
    }
}
