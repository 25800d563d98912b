//! Background eviction of tunnels older than the configured TTL
//!
//! Each cycle closes at most one expired tunnel, then sleeps for the TTL.
//! Staleness is therefore bounded by roughly one TTL window per tunnel.

use std::sync::Arc;
use std::time::Duration;

use crate::state::DaemonState;

/// Run the expiry monitor until the daemon starts stopping.
pub async fn run_expiry_monitor(daemon: Arc<DaemonState>) {
    let ttl = daemon.config.tunnel_expiration;
    tracing::info!("Starting tunnel expiry monitor (ttl: {:?})", ttl);

    while !daemon.status.is_stopping() {
        evict_one_expired(&daemon, ttl);

        tokio::select! {
            _ = tokio::time::sleep(ttl) => {}
            _ = daemon.status.stopping() => break,
        }
    }

    tracing::info!("Tunnel expiry monitor shutting down");
}

/// Close the first tunnel that has reached `ttl`, if any.
///
/// The entry is removed under the registry lock; the session is closed
/// after the lock is released.
pub fn evict_one_expired(daemon: &DaemonState, ttl: Duration) -> Option<u16> {
    let expired = daemon.registry.take_first_expired(ttl)?;
    expired.handle.close();

    tracing::info!(
        "Host {} on client port {} has expired",
        expired.handle.ssh_host(),
        expired.local_port
    );
    tracing::info!(
        "Now {} of {} ports available",
        daemon.registry.free_count(),
        daemon.registry.total()
    );
    Some(expired.local_port)
}
