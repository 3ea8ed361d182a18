//! Connection supervisor.
//!
//! Owns the single active outbound connection handle. `dial` closes any
//! previously held handle before installing a new one, `close_all`
//! force-closes whatever is active, and the stop token coordinates shutdown
//! across the ingestion loops. Blocking reads are only interrupted by the
//! forced close; the stop flag is consulted between cycles.

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// A closable outbound connection.
pub trait ConnectionHandle: Send {
    /// Close the connection. Safe to call more than once.
    fn close(&mut self);
}

/// Production handle: cancelling the token makes the read loop drop the
/// in-flight response, which closes the underlying socket.
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }
}

impl ConnectionHandle for CancelHandle {
    fn close(&mut self) {
        self.token.cancel();
    }
}

/// Guards the single active connection and carries the stop signal.
pub struct ConnectionSupervisor {
    // The slot lock makes dial/close_all mutually exclusive: a handle is
    // never read or closed while being replaced.
    active: Mutex<Option<Box<dyn ConnectionHandle>>>,
    stop: CancellationToken,
}

impl Default for ConnectionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSupervisor {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(None),
            stop: CancellationToken::new(),
        }
    }

    /// Install a new connection handle, closing the previous one first.
    ///
    /// The old handle is closed before the new one becomes active, so at
    /// most one outbound connection is ever live and none leak across
    /// reconnects.
    pub fn dial(&self, handle: Box<dyn ConnectionHandle>) {
        let mut slot = self.active.lock();
        if let Some(mut old) = slot.take() {
            old.close();
        }
        *slot = Some(handle);
    }

    /// Dial a token-driven connection and return the token the read loop
    /// races against.
    pub fn dial_cancellable(&self) -> CancellationToken {
        let token = CancellationToken::new();
        self.dial(Box::new(CancelHandle::new(token.clone())));
        token
    }

    /// Force-close the active connection, if any. Idempotent and safe to
    /// call concurrently with `dial`.
    pub fn close_all(&self) {
        let mut slot = self.active.lock();
        if let Some(mut handle) = slot.take() {
            handle.close();
        }
    }

    /// Mark the stop flag and force-close the active connection.
    pub fn shutdown(&self) {
        self.stop.cancel();
        self.close_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Completes once `shutdown` has been called.
    pub async fn stopped(&self) {
        self.stop.cancelled().await;
    }
}
