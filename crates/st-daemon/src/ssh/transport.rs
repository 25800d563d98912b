//! The seam between the tunnel session and the SSH library
//!
//! `TunnelSession` drives an [`SshTransport`] obtained from an
//! [`SshConnector`]. Production uses the russh implementation in
//! `ssh::client`; tests plug in an in-memory server.

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use super::error::{ConnectError, SessionError};
use super::fingerprint::HostFingerprint;

/// Byte stream carried by a forwarding channel
pub trait ForwardIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ForwardIo for T {}

/// An open direct-tcpip channel
pub type ForwardStream = Box<dyn ForwardIo>;

/// Where the SSH server lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    pub host: String,
    pub port: u16,
}

impl SshEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for SshEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Authentication methods a server can advertise
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    None,
    Password,
    PublicKey,
    HostBased,
    KeyboardInteractive,
}

/// What the server said when asked which methods it accepts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthProbe {
    /// The server let the user in without credentials
    Accepted,
    /// Methods the server will accept next
    Methods(Vec<AuthMethod>),
}

/// Opens SSH transports: resolve, connect, handshake, capture the host key.
#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn connect(&self, endpoint: &SshEndpoint) -> Result<Box<dyn SshTransport>, ConnectError>;
}

/// An SSH connection that has completed its handshake
#[async_trait]
pub trait SshTransport: Send {
    /// Fingerprint of the host key presented during the handshake
    fn fingerprint(&self) -> HostFingerprint;

    /// Ask which authentication methods the server accepts for `username`
    async fn auth_methods(&mut self, username: &str) -> Result<AuthProbe, SessionError>;

    /// Returns `Ok(false)` when the server rejects the password
    async fn authenticate_password(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<bool, SessionError>;

    /// Authenticate with an in-memory private key.
    ///
    /// Fails with `KeyPassphraseError`, `InvalidPublicKey` or
    /// `UsernameNotMatchedToPrivateKey` depending on where it went wrong.
    async fn authenticate_key(
        &mut self,
        username: &str,
        private_key: &str,
        passphrase: Option<&str>,
    ) -> Result<(), SessionError>;

    /// Open a direct-tcpip channel to `host:port` as seen from the server
    async fn open_direct_tcpip(
        &mut self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<ForwardStream, SessionError>;

    /// Politely end the connection. Errors are logged, not returned.
    async fn disconnect(&mut self);
}
