//! st-daemon: Local daemon forwarding ports to MySQL servers over SSH
//!
//! The daemon accepts JSON commands on a loopback port. For each
//! `CreateTunnel` it connects to an SSH server, has the client confirm the
//! host key fingerprint, authenticates, and listens on a local port whose
//! single client is forwarded to the MySQL server through a direct-tcpip
//! channel. Tunnels are closed on request, when either side disconnects,
//! or by the expiry monitor once they outlive the configured TTL.

pub mod control;
pub mod expiry;
pub mod orchestrator;
pub mod ports;
pub mod registry;
pub mod ssh;
pub mod state;
pub mod status;

pub use orchestrator::TunnelOrchestrator;
pub use state::DaemonState;
pub use status::{AppStatus, StatusManager};
