//! One tunnel: SSH connection, local listen socket, forwarded client
//!
//! A session moves through
//! `Disconnected -> FingerprintExtracted -> Authenticated -> Listening ->
//! Forwarding -> Closed`. TCP connect and the SSH handshake both happen
//! inside [`SshConnector::connect`], so the first visible step is a
//! handshaken transport with its host key fingerprint. `Closed` can be
//! reached from any state.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use st_core::Credential;
use tokio::net::{TcpListener, TcpSocket};

use super::error::{ConnectError, SessionError};
use super::fingerprint::HostFingerprint;
use super::handle::SessionHandle;
use super::pump::{pump, ForwardSummary};
use super::transport::{AuthMethod, AuthProbe, SshConnector, SshEndpoint, SshTransport};
use crate::state::DaemonState;

/// Bind attempts before giving up on a local port
pub const MAX_BIND_ATTEMPTS: u32 = 3;

const LISTEN_BACKLOG: u32 = 128;

/// Lifecycle of a tunnel session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    FingerprintExtracted,
    Authenticated,
    Listening,
    Forwarding,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::FingerprintExtracted => "fingerprint-extracted",
            SessionState::Authenticated => "authenticated",
            SessionState::Listening => "listening",
            SessionState::Forwarding => "forwarding",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Everything needed to build one tunnel
#[derive(Debug, Clone)]
pub struct TunnelTarget {
    pub ssh: SshEndpoint,
    pub username: String,
    pub credential: Credential,
    pub mysql_host: String,
    pub mysql_port: u16,
}

/// An SSH session plus the single-use local listener it forwards from.
///
/// Owned by the task that created it. Other tasks reach it only through
/// its [`SessionHandle`].
pub struct TunnelSession {
    target: TunnelTarget,
    daemon: Arc<DaemonState>,
    connector: Arc<dyn SshConnector>,
    handle: Arc<SessionHandle>,
    state: SessionState,
    transport: Option<Box<dyn SshTransport>>,
    listener: Option<TcpListener>,
    fingerprint: Option<HostFingerprint>,
}

impl TunnelSession {
    /// Create a session that will listen on `local_port` (or a later
    /// port if binding fails).
    pub fn new(
        daemon: Arc<DaemonState>,
        connector: Arc<dyn SshConnector>,
        target: TunnelTarget,
        local_port: u16,
    ) -> Self {
        let handle = Arc::new(SessionHandle::new(
            target.ssh.host.clone(),
            local_port,
            &daemon.registry,
            &daemon.status.shutdown_token(),
        ));

        Self {
            target,
            daemon,
            connector,
            handle,
            state: SessionState::Disconnected,
            transport: None,
            listener: None,
            fingerprint: None,
        }
    }

    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn local_port(&self) -> u16 {
        self.handle.local_port()
    }

    pub fn fingerprint(&self) -> Option<HostFingerprint> {
        self.fingerprint
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(
            "Tunnel {} (local port {}): {} -> {}",
            self.target.ssh,
            self.handle.local_port(),
            self.state,
            next
        );
        self.state = next;
    }

    /// Resolve, connect and handshake, returning the host key fingerprint.
    pub async fn connect_and_fingerprint(&mut self) -> Result<HostFingerprint, ConnectError> {
        tracing::info!(
            "Connecting to SSH server {} as {}",
            self.target.ssh,
            self.target.username
        );

        let transport = self.connector.connect(&self.target.ssh).await?;
        let fingerprint = transport.fingerprint();
        tracing::info!("Host key fingerprint for {}: {}", self.target.ssh, fingerprint);

        self.transport = Some(transport);
        self.fingerprint = Some(fingerprint);
        self.transition(SessionState::FingerprintExtracted);
        Ok(fingerprint)
    }

    /// Authenticate, then open the local listen socket.
    ///
    /// Returns the local port clients should connect to.
    pub async fn authenticate_and_forward(&mut self) -> Result<u16, SessionError> {
        if self.state != SessionState::FingerprintExtracted {
            return Err(SessionError::InvalidState("not connected"));
        }

        self.authenticate().await?;
        self.transition(SessionState::Authenticated);

        let port = self.bind_listener()?;
        self.transition(SessionState::Listening);
        Ok(port)
    }

    async fn authenticate(&mut self) -> Result<(), SessionError> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(SessionError::InvalidState("not connected"))?;
        let username = self.target.username.as_str();

        tracing::debug!(
            "Authenticating {} on {} with {}",
            username,
            self.target.ssh,
            self.target.credential.kind()
        );

        let probe = transport.auth_methods(username).await?;
        if probe == AuthProbe::Accepted {
            tracing::info!("{} accepted {} without credentials", self.target.ssh, username);
            return Ok(());
        }

        match &self.target.credential {
            Credential::Password(password) => {
                if let AuthProbe::Methods(methods) = &probe {
                    if !methods.contains(&AuthMethod::Password) {
                        tracing::warn!(
                            "{} does not offer password authentication (offers {:?})",
                            self.target.ssh,
                            methods
                        );
                        return Err(SessionError::PasswordAuthNotSupported);
                    }
                }

                if !transport.authenticate_password(username, password).await? {
                    tracing::warn!("Password authentication failed for {}", username);
                    return Err(SessionError::PasswordAuthFailed);
                }
            }
            Credential::PrivateKey { key, passphrase } => {
                transport
                    .authenticate_key(username, key, passphrase.as_deref())
                    .await
                    .map_err(|e| {
                        tracing::warn!("Public key authentication failed for {}: {}", username, e);
                        e
                    })?;
            }
        }

        tracing::info!("Authenticated {} on {}", username, self.target.ssh);
        Ok(())
    }

    /// Bind the local listener, drawing a fresh port after each failed bind.
    fn bind_listener(&mut self) -> Result<u16, SessionError> {
        let bind_address = &self.daemon.config.tunnel_bind_address;
        let ip: IpAddr = bind_address
            .parse()
            .map_err(|_| SessionError::LocalListenDetailsFailed(bind_address.clone()))?;

        let mut attempts = 0;
        loop {
            let port = self.handle.local_port();
            let address = SocketAddr::new(ip, port);

            let socket = match ip {
                IpAddr::V4(_) => TcpSocket::new_v4(),
                IpAddr::V6(_) => TcpSocket::new_v6(),
            }
            .map_err(SessionError::SocketCreationFailed)?;
            socket
                .set_reuseaddr(true)
                .map_err(SessionError::SocketCreationFailed)?;

            match socket.bind(address) {
                Ok(()) => {
                    let listener = socket
                        .listen(LISTEN_BACKLOG)
                        .map_err(SessionError::SocketListenFailed)?;
                    tracing::info!("Waiting for TCP connection on {}", address);
                    self.listener = Some(listener);
                    return Ok(port);
                }
                Err(e) => {
                    attempts += 1;
                    tracing::warn!(
                        "Failed to bind {} (attempt {}/{}): {}",
                        address,
                        attempts,
                        MAX_BIND_ATTEMPTS,
                        e
                    );
                    if attempts >= MAX_BIND_ATTEMPTS {
                        return Err(SessionError::SocketBindFailed { attempts });
                    }
                    self.handle.set_local_port(self.daemon.ports.next_port());
                }
            }
        }
    }

    /// Accept one local client and forward it until either side closes or
    /// the session is closed.
    pub async fn accept_and_forward(&mut self) -> Result<ForwardSummary, SessionError> {
        let listener = self
            .listener
            .as_ref()
            .ok_or(SessionError::InvalidState("not listening"))?;

        let (mut client, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = self.handle.cancelled() => return Err(SessionError::Closed),
        };
        tracing::info!(
            "Accepted {} on local port {}",
            peer,
            self.handle.local_port()
        );
        if let Err(e) = client.set_nodelay(true) {
            tracing::debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
        }

        let transport = self
            .transport
            .as_mut()
            .ok_or(SessionError::InvalidState("not connected"))?;

        let mut channel = tokio::select! {
            opened = transport.open_direct_tcpip(&self.target.mysql_host, self.target.mysql_port, peer) => opened?,
            _ = self.handle.cancelled() => return Err(SessionError::Closed),
        };
        self.transition(SessionState::Forwarding);
        tracing::info!(
            "Forwarding {} -> {} -> {}:{}",
            peer,
            self.target.ssh,
            self.target.mysql_host,
            self.target.mysql_port
        );

        let summary = pump(
            &mut client,
            &mut *channel,
            &self.handle,
            self.daemon.config.buffer_size,
        )
        .await?;

        tracing::info!(
            "Forwarding on local port {} ended ({:?}): {} bytes out, {} bytes in",
            self.handle.local_port(),
            summary.ended_by,
            summary.to_remote,
            summary.to_local
        );
        Ok(summary)
    }

    /// Tear the session down. Safe to call more than once; resources are
    /// released the first time only.
    pub async fn close(&mut self) {
        self.handle.close();

        let had_listener = self.listener.take().is_some();
        let transport = self.transport.take();
        if let Some(mut transport) = transport {
            transport.disconnect().await;
        }

        if self.state != SessionState::Closed {
            tracing::info!(
                "Closed tunnel to {} (local port {}, listener released: {})",
                self.target.ssh,
                self.handle.local_port(),
                had_listener
            );
            self.transition(SessionState::Closed);
        }
    }
}

impl fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("target", &self.target)
            .field("state", &self.state)
            .field("local_port", &self.handle.local_port())
            .finish_non_exhaustive()
    }
}
