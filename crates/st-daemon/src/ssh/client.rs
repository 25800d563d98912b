//! russh-backed SSH transport

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, AuthResult};
use russh::keys::ssh_key::{PrivateKey, PublicKey};
use russh::keys::{self, PrivateKeyWithHashAlg};
use russh::{Disconnect, MethodKind};
use tokio::net::TcpStream;

use super::error::{ConnectError, SessionError};
use super::fingerprint::HostFingerprint;
use super::transport::{AuthMethod, AuthProbe, ForwardStream, SshConnector, SshEndpoint, SshTransport};

/// Client handler that records the server's host key.
///
/// Every key is accepted at this stage; trust is decided by the user
/// confirming the fingerprint before any credentials are sent.
struct HostKeyCapture {
    fingerprint: Arc<OnceLock<HostFingerprint>>,
}

impl client::Handler for HostKeyCapture {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match server_public_key.to_bytes() {
            Ok(blob) => {
                let _ = self.fingerprint.set(HostFingerprint::from_key_blob(&blob));
                Ok(true)
            }
            Err(e) => {
                tracing::warn!("Could not encode server host key: {}", e);
                Ok(false)
            }
        }
    }
}

impl From<MethodKind> for AuthMethod {
    fn from(kind: MethodKind) -> Self {
        match kind {
            MethodKind::None => AuthMethod::None,
            MethodKind::Password => AuthMethod::Password,
            MethodKind::PublicKey => AuthMethod::PublicKey,
            MethodKind::HostBased => AuthMethod::HostBased,
            MethodKind::KeyboardInteractive => AuthMethod::KeyboardInteractive,
        }
    }
}

/// Connects to real SSH servers over TCP
pub struct RusshConnector {
    config: Arc<client::Config>,
    connect_timeout: Duration,
}

impl RusshConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        let config = client::Config {
            inactivity_timeout: None,
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            connect_timeout,
        }
    }

    async fn resolve(endpoint: &SshEndpoint) -> Result<Vec<SocketAddr>, ConnectError> {
        let dns_error = |reason: String| ConnectError::DnsResolutionFailed {
            host: endpoint.host.clone(),
            reason,
        };

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| dns_error(e.to_string()))?
            .collect();

        if addrs.is_empty() {
            return Err(dns_error("no addresses returned".to_string()));
        }
        Ok(addrs)
    }

    /// Try each resolved address in turn; report the last failure.
    async fn connect_any(addrs: &[SocketAddr]) -> std::io::Result<TcpStream> {
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    tracing::debug!("Connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no address to connect to")
        }))
    }
}

#[async_trait]
impl SshConnector for RusshConnector {
    async fn connect(&self, endpoint: &SshEndpoint) -> Result<Box<dyn SshTransport>, ConnectError> {
        let address = endpoint.to_string();
        let addrs = Self::resolve(endpoint).await?;

        let connect_failed = |reason: String| ConnectError::SshConnectFailed {
            address: address.clone(),
            reason,
        };
        let stream = tokio::time::timeout(self.connect_timeout, Self::connect_any(&addrs))
            .await
            .map_err(|_| connect_failed("timed out".to_string()))?
            .map_err(|e| connect_failed(e.to_string()))?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not set TCP_NODELAY on SSH socket: {}", e);
        }
        tracing::debug!("TCP connection established to {}", address);

        let fingerprint = Arc::new(OnceLock::new());
        let handler = HostKeyCapture {
            fingerprint: Arc::clone(&fingerprint),
        };

        let system_fault = |reason: String| ConnectError::SystemFault {
            address: address.clone(),
            reason,
        };
        let handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect_stream(Arc::clone(&self.config), stream, handler),
        )
        .await
        .map_err(|_| system_fault("handshake timed out".to_string()))?
        .map_err(|e| system_fault(e.to_string()))?;

        let fingerprint = fingerprint
            .get()
            .copied()
            .ok_or_else(|| system_fault("server presented no host key".to_string()))?;

        Ok(Box::new(RusshTransport {
            handle,
            fingerprint,
            address,
        }))
    }
}

/// A handshaken russh client session
pub struct RusshTransport {
    handle: client::Handle<HostKeyCapture>,
    fingerprint: HostFingerprint,
    address: String,
}

impl RusshTransport {
    fn decode_key(private_key: &str, passphrase: Option<&str>) -> Result<PrivateKey, SessionError> {
        match keys::decode_secret_key(private_key, None) {
            Ok(key) => Ok(key),
            Err(keys::Error::KeyIsEncrypted) => {
                let passphrase = passphrase.ok_or(SessionError::KeyPassphraseError)?;
                keys::decode_secret_key(private_key, Some(passphrase)).map_err(|e| {
                    tracing::debug!("Private key decryption failed: {}", e);
                    SessionError::KeyPassphraseError
                })
            }
            Err(e) => Err(SessionError::InvalidPublicKey(e.to_string())),
        }
    }
}

#[async_trait]
impl SshTransport for RusshTransport {
    fn fingerprint(&self) -> HostFingerprint {
        self.fingerprint
    }

    async fn auth_methods(&mut self, username: &str) -> Result<AuthProbe, SessionError> {
        match self.handle.authenticate_none(username).await? {
            AuthResult::Success => Ok(AuthProbe::Accepted),
            AuthResult::Failure {
                remaining_methods, ..
            } => Ok(AuthProbe::Methods(
                remaining_methods.iter().cloned().map(AuthMethod::from).collect(),
            )),
        }
    }

    async fn authenticate_password(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<bool, SessionError> {
        let result = self.handle.authenticate_password(username, password).await?;
        Ok(result.success())
    }

    async fn authenticate_key(
        &mut self,
        username: &str,
        private_key: &str,
        passphrase: Option<&str>,
    ) -> Result<(), SessionError> {
        let key = Self::decode_key(private_key, passphrase)?;
        let hash_alg = self.handle.best_supported_rsa_hash().await?.flatten();

        let result = self
            .handle
            .authenticate_publickey(username, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
            .await?;

        if result.success() {
            Ok(())
        } else {
            Err(SessionError::UsernameNotMatchedToPrivateKey)
        }
    }

    async fn open_direct_tcpip(
        &mut self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<ForwardStream, SessionError> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(
                host,
                u32::from(port),
                originator.ip().to_string(),
                u32::from(originator.port()),
            )
            .await
            .map_err(|e| SessionError::ChannelOpenFailed {
                target: format!("{}:{}", host, port),
                reason: e.to_string(),
            })?;

        Ok(Box::new(channel.into_stream()))
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "Client disconnecting normally", "en")
            .await
        {
            tracing::debug!("SSH disconnect from {} failed: {}", self.address, e);
        }
    }
}
