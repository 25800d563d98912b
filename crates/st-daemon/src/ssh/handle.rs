//! Shared handle to a running tunnel session

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Weak};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::registry::TunnelRegistry;

/// The part of a tunnel session other tasks may touch.
///
/// The session task owns the sockets and SSH transport; everyone else
/// (registry, expiry monitor, `CloseTunnel`) holds this handle. `close()`
/// is the single teardown signal: it flips the closed flag once, cancels
/// the session token so the owner's pump loop exits, and drops the
/// registry entry.
pub struct SessionHandle {
    ssh_host: String,
    local_port: AtomicU16,
    closed: AtomicBool,
    cancel: CancellationToken,
    registry: Weak<TunnelRegistry>,
}

impl SessionHandle {
    /// Create a handle whose token is a child of `parent`, so daemon
    /// shutdown reaches every session.
    pub fn new(
        ssh_host: impl Into<String>,
        local_port: u16,
        registry: &Arc<TunnelRegistry>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            ssh_host: ssh_host.into(),
            local_port: AtomicU16::new(local_port),
            closed: AtomicBool::new(false),
            cancel: parent.child_token(),
            registry: Arc::downgrade(registry),
        }
    }

    pub fn ssh_host(&self) -> &str {
        &self.ssh_host
    }

    /// The local port currently assigned to this session
    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::Acquire)
    }

    pub(crate) fn set_local_port(&self, port: u16) {
        self.local_port.store(port, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves when the session is closed or the daemon shuts down
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Close the session. Returns `false` if it was already closed.
    pub fn close(self: &Arc<Self>) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        tracing::debug!(
            "Closing tunnel to {} on local port {}",
            self.ssh_host,
            self.local_port()
        );
        self.cancel.cancel();

        if let Some(registry) = self.registry.upgrade() {
            registry.remove_session(self);
        }
        true
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("ssh_host", &self.ssh_host)
            .field("local_port", &self.local_port())
            .field("closed", &self.is_closed())
            .finish()
    }
}
