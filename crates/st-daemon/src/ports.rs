//! Local port allocation for tunnel listen sockets
//!
//! A single counter walks the configured range and wraps at the end. No
//! record is kept of which ports are still in use; collisions surface as
//! bind failures, which the session engine retries with a fresh port.

use std::sync::Mutex;

/// Hands out ports from `[min, max)` in order, wrapping around
pub struct PortAllocator {
    min: u16,
    max: u16,
    next: Mutex<u16>,
}

impl PortAllocator {
    /// Create an allocator over `[min, max)`.
    ///
    /// Callers validate the range first (`DaemonConfig::validate`).
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            next: Mutex::new(min),
        }
    }

    /// Take the next port in the range.
    pub fn next_port(&self) -> u16 {
        let mut next = self.next.lock().unwrap_or_else(|e| e.into_inner());

        if *next >= self.max || *next == 0 {
            tracing::info!(
                "Local port counter reached {}, restarting at {}",
                *next,
                self.min
            );
            *next = self.min;
        }

        let port = *next;
        *next = next.saturating_add(1);
        port
    }

    /// Number of ports in the range
    pub fn total(&self) -> usize {
        usize::from(self.max.saturating_sub(self.min))
    }

    /// Whether `port` lies inside `[min, max)`
    pub fn contains(&self, port: u16) -> bool {
        (self.min..self.max).contains(&port)
    }
}
