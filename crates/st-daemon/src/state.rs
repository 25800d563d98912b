//! Shared daemon context

use std::sync::Arc;

use st_core::config::DaemonConfig;

use crate::ports::PortAllocator;
use crate::registry::TunnelRegistry;
use crate::status::StatusManager;

/// State shared by the control server, the orchestrator, tunnel sessions
/// and the expiry monitor
pub struct DaemonState {
    /// Configuration
    pub config: DaemonConfig,
    /// Local port allocator
    pub ports: Arc<PortAllocator>,
    /// Active tunnels
    pub registry: Arc<TunnelRegistry>,
    /// Application status and shutdown signal
    pub status: Arc<StatusManager>,
}

impl DaemonState {
    /// Build the shared context. The config should already be validated.
    pub fn new(config: DaemonConfig) -> Self {
        let ports = PortAllocator::new(config.min_port_range, config.max_port_range);
        let registry = TunnelRegistry::new(ports.total());

        Self {
            config,
            ports: Arc::new(ports),
            registry: Arc::new(registry),
            status: Arc::new(StatusManager::new()),
        }
    }

    /// Close every registered tunnel. Returns how many were closed.
    pub fn close_all_tunnels(&self) -> usize {
        let tunnels = self.registry.drain();
        for tunnel in &tunnels {
            tunnel.handle.close();
        }
        tunnels.len()
    }
}
