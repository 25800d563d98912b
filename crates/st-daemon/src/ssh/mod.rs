//! SSH session engine
//!
//! Connects to the SSH server, extracts the host key fingerprint,
//! authenticates, listens on a local port and pumps one client's bytes
//! through a direct-tcpip channel.

mod client;
mod error;
mod fingerprint;
mod handle;
mod pump;
mod session;
mod transport;

pub use client::{RusshConnector, RusshTransport};
pub use error::{ConnectError, SessionError};
pub use fingerprint::HostFingerprint;
pub use handle::SessionHandle;
pub use pump::{pump, ForwardSummary, PumpEnd};
pub use session::{SessionState, TunnelSession, TunnelTarget, MAX_BIND_ATTEMPTS};
pub use transport::{
    AuthMethod, AuthProbe, ForwardIo, ForwardStream, SshConnector, SshEndpoint, SshTransport,
};
