//! Failures of the SSH session engine and their control-protocol form

use st_core::ControlResponse;
use thiserror::Error;

/// Failures while reaching the SSH server
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The SSH host name did not resolve
    #[error("Failed to resolve {host}: {reason}")]
    DnsResolutionFailed { host: String, reason: String },

    /// No TCP connection could be made
    #[error("Failed to connect to {address}: {reason}")]
    SshConnectFailed { address: String, reason: String },

    /// The SSH handshake (or local socket setup) failed
    #[error("SSH handshake with {address} failed: {reason}")]
    SystemFault { address: String, reason: String },
}

impl ConnectError {
    /// Response token reported to the client
    pub fn token(&self) -> &'static str {
        match self {
            Self::DnsResolutionFailed { .. } => "DNSResolutionFailed",
            Self::SshConnectFailed { .. } => "SSHConnectFailed",
            Self::SystemFault { .. } => "SSH_SystemFaultOccurred",
        }
    }

    pub fn to_response(&self) -> ControlResponse {
        ControlResponse::tunnel_error(self.token())
    }
}

/// Failures after the transport is up: authentication, local listen
/// socket setup and forwarding.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No password or private key was supplied")]
    NoValidAuthMethod,

    #[error("Server does not offer password authentication")]
    PasswordAuthNotSupported,

    #[error("Password rejected by server")]
    PasswordAuthFailed,

    #[error("Private key passphrase missing or wrong")]
    KeyPassphraseError,

    #[error("Server rejected the private key for this user")]
    UsernameNotMatchedToPrivateKey,

    #[error("Private key could not be decoded: {0}")]
    InvalidPublicKey(String),

    #[error("Host key fingerprint does not match the confirmed one")]
    FingerprintNotMatched,

    #[error("Bind address {0:?} is not a valid IP address")]
    LocalListenDetailsFailed(String),

    #[error("Failed to create listen socket: {0}")]
    SocketCreationFailed(#[source] std::io::Error),

    #[error("No free local port after {attempts} bind attempts")]
    SocketBindFailed { attempts: u32 },

    #[error("Failed to listen on local port: {0}")]
    SocketListenFailed(#[source] std::io::Error),

    #[error("Failed to open forwarding channel to {target}: {reason}")]
    ChannelOpenFailed { target: String, reason: String },

    #[error("Forwarding I/O error: {0}")]
    Forward(#[from] std::io::Error),

    #[error("SSH transport error: {0}")]
    Transport(String),

    /// Session was closed before the operation finished
    #[error("Session closed")]
    Closed,

    /// An operation was called out of order
    #[error("Session is {0}")]
    InvalidState(&'static str),
}

impl SessionError {
    /// The response sent when this error ends tunnel setup
    pub fn to_response(&self) -> ControlResponse {
        match self {
            Self::NoValidAuthMethod => ControlResponse::auth_failure("NoValidAuthMethod"),
            Self::PasswordAuthNotSupported => {
                ControlResponse::auth_failure("PasswordAuthNotSupported")
            }
            Self::PasswordAuthFailed => ControlResponse::tunnel_error("PasswordAuthFailed"),
            Self::KeyPassphraseError => ControlResponse::tunnel_error("KeyPassphraseError"),
            Self::UsernameNotMatchedToPrivateKey => {
                ControlResponse::tunnel_error("UsernameNotMatchedToPrivateKey")
            }
            Self::InvalidPublicKey(_) => ControlResponse::tunnel_error("InvalidPublicKey"),
            Self::FingerprintNotMatched => ControlResponse::tunnel_error("FingerprintNotMatched"),
            Self::LocalListenDetailsFailed(_) => {
                ControlResponse::general_error("LocalListenDetailsFailed")
            }
            Self::SocketCreationFailed(_) => ControlResponse::general_error("SocketCreationFailed"),
            Self::SocketBindFailed { .. } => ControlResponse::general_error("SocketBindFailed"),
            Self::SocketListenFailed(_) => ControlResponse::general_error("SocketListenFailed"),
            Self::ChannelOpenFailed { .. } => ControlResponse::tunnel_error("ChannelOpenFailed"),
            Self::Forward(_) => ControlResponse::tunnel_error("ForwardingFailed"),
            Self::Transport(_) | Self::Closed | Self::InvalidState(_) => {
                ControlResponse::tunnel_error("StartTunnelFailed")
            }
        }
    }
}

impl From<russh::Error> for SessionError {
    fn from(e: russh::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
