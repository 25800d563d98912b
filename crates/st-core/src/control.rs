//! Control protocol between client applications and the daemon
//!
//! A client opens a loopback TCP connection, writes one JSON command and
//! reads one JSON response. Commands are discriminated by their `method`
//! field; responses carry an integer `result` code, a `message` token and
//! optional string-valued extras.
//!
//! ```json
//! {"method":"CloseTunnel","localPort":10004}
//! {"result":0,"message":""}
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CommandError;

/// Response key carrying the allocated local port
pub const LOCAL_TUNNEL_PORT: &str = "LocalTunnelPort";

/// Response key carrying the SSH host key fingerprint
pub const FINGERPRINT: &str = "fingerprint";

/// Value of `authMethod` selecting password authentication
pub const PASSWORD_AUTH: &str = "Password";

/// A decoded control command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum ControlCommand {
    /// Open a tunnel to a MySQL server through an SSH host
    CreateTunnel(CreateTunnel),
    /// Tear down the tunnel listening on a local port
    CloseTunnel(CloseTunnel),
}

impl ControlCommand {
    /// Decode a raw command, separating unknown methods from malformed input.
    pub fn parse(raw: &str) -> Result<Self, CommandError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| CommandError::malformed(&e))?;

        let method = value
            .get("method")
            .and_then(serde_json::Value::as_str)
            .ok_or(CommandError::MissingMethod)?
            .to_owned();

        let invalid = |e: serde_json::Error| CommandError::invalid_fields(&method, &e);

        match method.as_str() {
            "CreateTunnel" => serde_json::from_value(value)
                .map(Self::CreateTunnel)
                .map_err(invalid),
            "CloseTunnel" => serde_json::from_value(value)
                .map(Self::CloseTunnel)
                .map_err(invalid),
            _ => Err(CommandError::UnknownMethod(method.clone())),
        }
    }

    /// The wire name of this command
    pub fn method(&self) -> &'static str {
        match self {
            Self::CreateTunnel(_) => "CreateTunnel",
            Self::CloseTunnel(_) => "CloseTunnel",
        }
    }
}

/// Fields of a `CreateTunnel` command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTunnel {
    pub ssh_details: SshDetails,
    pub mysql_host: String,
    #[serde(rename = "remoteMySQLPort", with = "port_field")]
    pub remote_mysql_port: u16,
    /// Set once the user has accepted the fingerprint from a previous attempt
    #[serde(default)]
    pub fingerprint_confirmed: bool,
    /// The fingerprint the user accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// Fields of a `CloseTunnel` command
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CloseTunnel {
    #[serde(rename = "localPort", with = "port_field")]
    pub local_port: u16,
}

/// SSH connection details nested in `CreateTunnel`
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshDetails {
    /// `"Password"` selects password auth, anything else a private key
    pub auth_method: String,
    pub ssh_username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_password: Option<String>,
    #[serde(rename = "privateSSHKey", default, skip_serializing_if = "Option::is_none")]
    pub private_ssh_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_passphrase: Option<String>,
    pub ssh_host: String,
    #[serde(with = "port_field")]
    pub ssh_port: u16,
}

impl SshDetails {
    /// Pick the credential named by `authMethod`.
    ///
    /// Empty strings count as missing, so a password request without a
    /// password is rejected with [`CommandError::NoValidAuthMethod`].
    pub fn credential(&self) -> Result<Credential, CommandError> {
        fn present(value: &Option<String>) -> Option<String> {
            value.as_deref().filter(|s| !s.is_empty()).map(str::to_owned)
        }

        let credential = if self.auth_method == PASSWORD_AUTH {
            present(&self.ssh_password).map(Credential::Password)
        } else {
            present(&self.private_ssh_key).map(|key| Credential::PrivateKey {
                key,
                passphrase: present(&self.cert_passphrase),
            })
        };

        credential.ok_or(CommandError::NoValidAuthMethod)
    }
}

impl fmt::Debug for SshDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshDetails")
            .field("auth_method", &self.auth_method)
            .field("ssh_username", &self.ssh_username)
            .field("ssh_host", &self.ssh_host)
            .field("ssh_port", &self.ssh_port)
            .finish_non_exhaustive()
    }
}

/// Authentication material for one SSH session
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Password(String),
    /// OpenSSH or PEM encoded private key, with its passphrase if encrypted
    PrivateKey {
        key: String,
        passphrase: Option<String>,
    },
}

impl Credential {
    /// Short label used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Password(_) => "password",
            Self::PrivateKey { .. } => "public-key",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::PrivateKey { passphrase, .. } => f
                .debug_struct("PrivateKey")
                .field("key", &"<redacted>")
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

/// Integer result code of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ResultCode {
    Success = 0,
    GeneralError = 1,
    AuthFailure = 2,
    NotImplemented = 3,
    TunnelError = 4,
}

impl From<ResultCode> for u8 {
    fn from(code: ResultCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for ResultCode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Success),
            1 => Ok(Self::GeneralError),
            2 => Ok(Self::AuthFailure),
            3 => Ok(Self::NotImplemented),
            4 => Ok(Self::TunnelError),
            other => Err(format!("unknown result code {}", other)),
        }
    }
}

/// Response to a control command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub result: ResultCode,
    pub message: String,
    #[serde(flatten)]
    pub data: BTreeMap<String, String>,
}

impl ControlResponse {
    fn new(result: ResultCode, message: impl Into<String>) -> Self {
        Self {
            result,
            message: message.into(),
            data: BTreeMap::new(),
        }
    }

    /// Success with an empty message
    pub fn success() -> Self {
        Self::new(ResultCode::Success, "")
    }

    /// Success carrying the fingerprint the client must confirm
    pub fn fingerprint_pending(fingerprint: impl Into<String>) -> Self {
        Self::success().with(FINGERPRINT, fingerprint)
    }

    /// Success carrying the port the client should connect to
    pub fn tunnel_ready(local_port: u16) -> Self {
        Self::success().with(LOCAL_TUNNEL_PORT, local_port.to_string())
    }

    pub fn general_error(message: impl Into<String>) -> Self {
        Self::new(ResultCode::GeneralError, message)
    }

    pub fn auth_failure(message: impl Into<String>) -> Self {
        Self::new(ResultCode::AuthFailure, message)
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(ResultCode::NotImplemented, message)
    }

    pub fn tunnel_error(message: impl Into<String>) -> Self {
        Self::new(ResultCode::TunnelError, message)
    }

    /// Attach an extra string field
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.result == ResultCode::Success
    }

    /// Look up an extra field
    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    /// The `LocalTunnelPort` extra, parsed
    pub fn local_tunnel_port(&self) -> Option<u16> {
        self.get(LOCAL_TUNNEL_PORT)?.parse().ok()
    }
}

/// Ports arrive as JSON numbers from most clients, but `LocalTunnelPort` is
/// handed out as a string and some clients echo it back verbatim.
mod port_field {
    use serde::{de, Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    pub fn serialize<S>(port: &u16, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u16(*port)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u16, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Port::deserialize(deserializer)? {
            Port::Number(port) => Ok(port),
            Port::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| de::Error::custom(format!("invalid port {:?}", text))),
        }
    }
}
