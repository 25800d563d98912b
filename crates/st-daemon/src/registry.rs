//! Registry of active tunnels, keyed by local port
//!
//! One mutex guards the whole collection. No I/O happens under the lock:
//! eviction removes the entry while locked and leaves closing the session
//! to the caller.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::ssh::SessionHandle;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Another tunnel already owns the port
    #[error("Local port {0} already has an active tunnel")]
    PortInUse(u16),
}

/// One active tunnel
#[derive(Debug, Clone)]
pub struct TunnelEntry {
    pub local_port: u16,
    pub handle: Arc<SessionHandle>,
    pub created_at: Instant,
}

impl TunnelEntry {
    /// Whether the tunnel is at least `ttl` old at `now`
    pub fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= ttl
    }
}

/// Thread-safe collection of active tunnels in creation order
pub struct TunnelRegistry {
    tunnels: Mutex<Vec<TunnelEntry>>,
    total: usize,
}

impl TunnelRegistry {
    /// Create a registry for a port range of `total` ports
    pub fn new(total: usize) -> Self {
        Self {
            tunnels: Mutex::new(Vec::new()),
            total,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TunnelEntry>> {
        self.tunnels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a session under its current local port
    pub fn insert(&self, handle: Arc<SessionHandle>) -> Result<(), RegistryError> {
        self.insert_at(handle, Instant::now())
    }

    pub(crate) fn insert_at(
        &self,
        handle: Arc<SessionHandle>,
        created_at: Instant,
    ) -> Result<(), RegistryError> {
        let local_port = handle.local_port();
        let mut tunnels = self.lock();

        if tunnels.iter().any(|t| t.local_port == local_port) {
            return Err(RegistryError::PortInUse(local_port));
        }

        tunnels.push(TunnelEntry {
            local_port,
            handle,
            created_at,
        });
        Ok(())
    }

    /// Remove the tunnel on `port`. Returns `false` if there was none.
    pub fn remove_by_port(&self, port: u16) -> bool {
        let mut tunnels = self.lock();
        match tunnels.iter().position(|t| t.local_port == port) {
            Some(index) => {
                tunnels.remove(index);
                true
            }
            None => false,
        }
    }

    /// Remove the entry belonging to this exact session.
    ///
    /// Unlike `remove_by_port`, this never drops a newer tunnel that has
    /// since been given the same port.
    pub fn remove_session(&self, handle: &Arc<SessionHandle>) -> bool {
        let mut tunnels = self.lock();
        match tunnels.iter().position(|t| Arc::ptr_eq(&t.handle, handle)) {
            Some(index) => {
                tunnels.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn find_by_port(&self, port: u16) -> Option<Arc<SessionHandle>> {
        self.lock()
            .iter()
            .find(|t| t.local_port == port)
            .map(|t| Arc::clone(&t.handle))
    }

    /// Remove and return the oldest-registered tunnel that has reached `ttl`.
    pub fn take_first_expired(&self, ttl: Duration) -> Option<TunnelEntry> {
        let now = Instant::now();
        let mut tunnels = self.lock();
        let index = tunnels.iter().position(|t| t.is_expired(ttl, now))?;
        Some(tunnels.remove(index))
    }

    /// Remove every tunnel, for shutdown
    pub fn drain(&self) -> Vec<TunnelEntry> {
        std::mem::take(&mut *self.lock())
    }

    /// Local ports with an active tunnel, in creation order
    pub fn ports(&self) -> Vec<u16> {
        self.lock().iter().map(|t| t.local_port).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Size of the configured port range
    pub fn total(&self) -> usize {
        self.total
    }

    /// Ports in the range not held by an active tunnel
    pub fn free_count(&self) -> usize {
        self.total.saturating_sub(self.len())
    }
}
