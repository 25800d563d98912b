//! Shared fixtures: an in-memory SSH server and a control-protocol client

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use st_core::config::DaemonConfig;
use st_core::ControlResponse;
use st_daemon::control::ControlServer;
use st_daemon::ssh::{
    AuthMethod, AuthProbe, ConnectError, ForwardStream, HostFingerprint, SessionError,
    SshConnector, SshEndpoint, SshTransport,
};
use st_daemon::{DaemonState, TunnelOrchestrator};

pub const PASSWORD: &str = "correct horse";
pub const GOOD_KEY: &str = "good-key";
pub const ENCRYPTED_KEY: &str = "encrypted-key";
pub const KEY_PASSPHRASE: &str = "open sesame";
pub const UNRESOLVABLE_HOST: &str = "nowhere.invalid";
pub const HOST_KEY_BLOB: &[u8] = b"\x00\x00\x00\x0bssh-ed25519\x00\x00\x00\x20fake host key for tests";

/// Each test gets its own slice of local ports so parallel tests never
/// hand out the same port.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(0);

pub fn test_port_range(size: u16) -> (u16, u16) {
    let offset = PORT_COUNTER.fetch_add(size, Ordering::SeqCst);
    let min = 41000 + offset;
    (min, min + size)
}

pub fn test_config(ttl: Duration) -> DaemonConfig {
    let (min, max) = test_port_range(20);
    DaemonConfig {
        listen_port: 0,
        min_port_range: min,
        max_port_range: max,
        tunnel_expiration: ttl,
        debug_json_messages: true,
        ..Default::default()
    }
}

/// Counters shared between a fake server and the test
#[derive(Default)]
pub struct FakeStats {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub channels: Mutex<Vec<(String, u16)>>,
}

/// Behaviour of the in-memory SSH server
#[derive(Clone)]
pub struct FakeSshServer {
    pub methods: Vec<AuthMethod>,
    pub username: String,
    pub stats: Arc<FakeStats>,
}

impl FakeSshServer {
    pub fn new() -> Self {
        Self {
            methods: vec![AuthMethod::PublicKey, AuthMethod::Password],
            username: "deploy".to_string(),
            stats: Arc::new(FakeStats::default()),
        }
    }

    pub fn with_methods(mut self, methods: Vec<AuthMethod>) -> Self {
        self.methods = methods;
        self
    }

    pub fn fingerprint() -> HostFingerprint {
        HostFingerprint::from_key_blob(HOST_KEY_BLOB)
    }

    pub fn disconnects(&self) -> usize {
        self.stats.disconnects.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.stats.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SshConnector for FakeSshServer {
    async fn connect(&self, endpoint: &SshEndpoint) -> Result<Box<dyn SshTransport>, ConnectError> {
        if endpoint.host == UNRESOLVABLE_HOST {
            return Err(ConnectError::DnsResolutionFailed {
                host: endpoint.host.clone(),
                reason: "no such host".to_string(),
            });
        }
        if endpoint.port == 0 {
            return Err(ConnectError::SshConnectFailed {
                address: endpoint.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeTransport {
            server: self.clone(),
        }))
    }
}

pub struct FakeTransport {
    server: FakeSshServer,
}

#[async_trait]
impl SshTransport for FakeTransport {
    fn fingerprint(&self) -> HostFingerprint {
        FakeSshServer::fingerprint()
    }

    async fn auth_methods(&mut self, _username: &str) -> Result<AuthProbe, SessionError> {
        Ok(AuthProbe::Methods(self.server.methods.clone()))
    }

    async fn authenticate_password(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<bool, SessionError> {
        Ok(username == self.server.username && password == PASSWORD)
    }

    async fn authenticate_key(
        &mut self,
        username: &str,
        private_key: &str,
        passphrase: Option<&str>,
    ) -> Result<(), SessionError> {
        match private_key {
            GOOD_KEY => {}
            ENCRYPTED_KEY if passphrase == Some(KEY_PASSPHRASE) => {}
            ENCRYPTED_KEY => return Err(SessionError::KeyPassphraseError),
            other => return Err(SessionError::InvalidPublicKey(format!("{} bytes", other.len()))),
        }
        if username == self.server.username {
            Ok(())
        } else {
            Err(SessionError::UsernameNotMatchedToPrivateKey)
        }
    }

    async fn open_direct_tcpip(
        &mut self,
        host: &str,
        port: u16,
        _originator: SocketAddr,
    ) -> Result<ForwardStream, SessionError> {
        self.server
            .stats
            .channels
            .lock()
            .unwrap()
            .push((host.to_string(), port));

        // The "MySQL server" echoes everything back.
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (mut read, mut write) = tokio::io::split(theirs);
            let _ = tokio::io::copy(&mut read, &mut write).await;
            let _ = write.shutdown().await;
        });
        Ok(Box::new(ours))
    }

    async fn disconnect(&mut self) {
        self.server.stats.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

/// A daemon running against the fake SSH server
pub struct TestDaemon {
    pub address: String,
    pub state: Arc<DaemonState>,
    pub server: FakeSshServer,
    server_handle: JoinHandle<()>,
}

impl TestDaemon {
    pub async fn start(config: DaemonConfig, server: FakeSshServer) -> Self {
        let state = Arc::new(DaemonState::new(config));
        let orchestrator = Arc::new(TunnelOrchestrator::new(
            Arc::clone(&state),
            Arc::new(server.clone()),
        ));

        let control = ControlServer::new(orchestrator);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server_handle = tokio::spawn(async move {
            let _ = control.serve(listener).await;
        });

        Self {
            address,
            state,
            server,
            server_handle,
        }
    }

    pub async fn send(&self, command: serde_json::Value) -> ControlResponse {
        let line = send_raw(&self.address, &command.to_string()).await;
        serde_json::from_str(&line).expect("Failed to parse response")
    }

    pub async fn create_tunnel(&self, confirmed: bool, fingerprint: Option<&str>) -> ControlResponse {
        self.send(create_tunnel_command(
            json!({
                "authMethod": "Password",
                "sshUsername": "deploy",
                "sshPassword": PASSWORD,
                "privateSSHKey": "",
                "certPassphrase": null,
                "sshHost": "bastion.example.com",
                "sshPort": 22
            }),
            confirmed,
            fingerprint,
        ))
        .await
    }

    pub async fn close_tunnel(&self, local_port: u16) -> ControlResponse {
        self.send(json!({ "method": "CloseTunnel", "localPort": local_port }))
            .await
    }

    /// Poll until `check` holds or `limit` elapses
    pub async fn wait_for(&self, limit: Duration, check: impl Fn(&DaemonState) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if check(&self.state) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check(&self.state)
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}

pub fn create_tunnel_command(
    ssh_details: serde_json::Value,
    confirmed: bool,
    fingerprint: Option<&str>,
) -> serde_json::Value {
    let mut command = json!({
        "method": "CreateTunnel",
        "sshDetails": ssh_details,
        "mysqlHost": "db.internal",
        "remoteMySQLPort": 3306,
        "fingerprintConfirmed": confirmed
    });
    if let Some(fingerprint) = fingerprint {
        command["fingerprint"] = json!(fingerprint);
    }
    command
}

/// Send one raw line and return the raw response line
pub async fn send_raw(address: &str, line: &str) -> String {
    let stream = TcpStream::connect(address)
        .await
        .expect("Failed to connect to control server");
    let (reader, mut writer) = stream.into_split();

    let mut request = line.to_string();
    request.push('\n');
    writer
        .write_all(request.as_bytes())
        .await
        .expect("Failed to write request");
    writer.flush().await.expect("Failed to flush");

    let mut response = String::new();
    tokio::time::timeout(
        Duration::from_secs(5),
        BufReader::new(reader).read_line(&mut response),
    )
    .await
    .expect("Timed out waiting for response")
    .expect("Failed to read response");

    assert!(!response.is_empty(), "Server sent empty response (connection closed?)");
    response
}
