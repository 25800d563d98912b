//! End-to-end tests: control protocol over TCP against the in-memory SSH server

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use st_core::ResultCode;
use st_daemon::expiry::run_expiry_monitor;
use st_daemon::AppStatus;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use common::{
    create_tunnel_command, send_raw, test_config, FakeSshServer, TestDaemon, GOOD_KEY,
    UNRESOLVABLE_HOST,
};

const TTL: Duration = Duration::from_secs(30);

fn is_fingerprint(value: &str) -> bool {
    let pairs: Vec<&str> = value.split(':').collect();
    pairs.len() == 16
        && pairs.iter().all(|pair| {
            pair.len() == 2
                && pair
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
        })
}

#[tokio::test]
async fn test_unconfirmed_create_returns_fingerprint() {
    let daemon = TestDaemon::start(test_config(TTL), FakeSshServer::new()).await;

    let response = daemon.create_tunnel(false, None).await;

    assert_eq!(response.result, ResultCode::Success);
    let fingerprint = response.get("fingerprint").expect("fingerprint missing");
    assert!(is_fingerprint(fingerprint), "bad fingerprint {:?}", fingerprint);
    assert_eq!(fingerprint, FakeSshServer::fingerprint().to_string());
    assert!(response.local_tunnel_port().is_none());

    assert!(daemon.state.registry.is_empty());
    assert!(
        daemon
            .wait_for(Duration::from_secs(2), |_| daemon.server.disconnects() == 1)
            .await
    );
}

#[tokio::test]
async fn test_confirmed_create_returns_port() {
    let daemon = TestDaemon::start(test_config(TTL), FakeSshServer::new()).await;

    let pending = daemon.create_tunnel(false, None).await;
    let fingerprint = pending.get("fingerprint").unwrap().to_string();

    let response = daemon.create_tunnel(true, Some(&fingerprint)).await;
    assert_eq!(response.result, ResultCode::Success, "{:?}", response);
    let port = response.local_tunnel_port().expect("LocalTunnelPort missing");

    let config = &daemon.state.config;
    assert!(port >= config.min_port_range && port < config.max_port_range);
    assert!(daemon.state.registry.find_by_port(port).is_some());
    assert_eq!(daemon.state.registry.free_count(), daemon.state.registry.total() - 1);
}

#[tokio::test]
async fn test_confirmed_fingerprint_is_case_insensitive() {
    let daemon = TestDaemon::start(test_config(TTL), FakeSshServer::new()).await;
    let fingerprint = FakeSshServer::fingerprint().to_string().to_lowercase();

    let response = daemon.create_tunnel(true, Some(&fingerprint)).await;
    assert!(response.is_success(), "{:?}", response);
    assert!(response.local_tunnel_port().is_some());
}

#[tokio::test]
async fn test_fingerprint_mismatch() {
    let daemon = TestDaemon::start(test_config(TTL), FakeSshServer::new()).await;

    let response = daemon
        .create_tunnel(true, Some("00:11:22:33:44:55:66:77:88:99:AA:BB:CC:DD:EE:FF"))
        .await;

    assert_eq!(response.result, ResultCode::TunnelError);
    assert_eq!(response.message, "FingerprintNotMatched");
    assert_eq!(
        response.get("fingerprint"),
        Some(FakeSshServer::fingerprint().to_string().as_str())
    );
    assert!(daemon.state.registry.is_empty());
}

#[tokio::test]
async fn test_confirmed_without_fingerprint_is_mismatch() {
    let daemon = TestDaemon::start(test_config(TTL), FakeSshServer::new()).await;

    let response = daemon.create_tunnel(true, None).await;

    assert_eq!(response.result, ResultCode::TunnelError);
    assert_eq!(response.message, "FingerprintNotMatched");
    assert!(daemon.state.registry.is_empty());
}

#[tokio::test]
async fn test_close_tunnel() {
    let daemon = TestDaemon::start(test_config(TTL), FakeSshServer::new()).await;
    let fingerprint = FakeSshServer::fingerprint().to_string();

    let created = daemon.create_tunnel(true, Some(&fingerprint)).await;
    let port = created.local_tunnel_port().unwrap();

    let response = daemon.close_tunnel(port).await;
    assert_eq!(response.result, ResultCode::Success);
    assert!(daemon.state.registry.find_by_port(port).is_none());
    assert_eq!(daemon.state.registry.free_count(), daemon.state.registry.total());

    // The session task notices the close and disconnects from the server.
    assert!(
        daemon
            .wait_for(Duration::from_secs(2), |_| daemon.server.disconnects() == 1)
            .await
    );

    let again = daemon.close_tunnel(port).await;
    assert_eq!(again.result, ResultCode::GeneralError);
    assert_eq!(again.message, "TunnelNotFound");
}

#[tokio::test]
async fn test_close_tunnel_port_as_string() {
    let daemon = TestDaemon::start(test_config(TTL), FakeSshServer::new()).await;
    let fingerprint = FakeSshServer::fingerprint().to_string();

    let created = daemon.create_tunnel(true, Some(&fingerprint)).await;
    let port = created.get("LocalTunnelPort").unwrap().to_string();

    let response = daemon
        .send(json!({ "method": "CloseTunnel", "localPort": port }))
        .await;
    assert!(response.is_success());
    assert!(daemon.state.registry.is_empty());
}

#[tokio::test]
async fn test_expired_tunnel_is_evicted() {
    let daemon = TestDaemon::start(
        test_config(Duration::from_millis(200)),
        FakeSshServer::new(),
    )
    .await;
    let monitor = tokio::spawn(run_expiry_monitor(Arc::clone(&daemon.state)));
    let fingerprint = FakeSshServer::fingerprint().to_string();

    let created = daemon.create_tunnel(true, Some(&fingerprint)).await;
    let port = created.local_tunnel_port().unwrap();
    let total = daemon.state.registry.total();

    assert!(
        daemon
            .wait_for(Duration::from_secs(5), |state| state.registry.is_empty())
            .await,
        "tunnel on {} was never evicted",
        port
    );
    assert_eq!(daemon.state.registry.free_count(), total);
    assert!(
        daemon
            .wait_for(Duration::from_secs(2), |_| daemon.server.disconnects() == 1)
            .await
    );

    daemon.state.status.set(AppStatus::Stopping);
    tokio::time::timeout(Duration::from_secs(2), monitor)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_traffic_flows_through_tunnel() {
    let daemon = TestDaemon::start(test_config(TTL), FakeSshServer::new()).await;
    let fingerprint = FakeSshServer::fingerprint().to_string();

    let created = daemon.create_tunnel(true, Some(&fingerprint)).await;
    let port = created.local_tunnel_port().unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"\x0a5.7.42-handshake").await.unwrap();
    let mut echoed = vec![0u8; 17];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"\x0a5.7.42-handshake");

    drop(client);
    assert!(
        daemon
            .wait_for(Duration::from_secs(2), |state| state.registry.is_empty())
            .await
    );
    let channels = daemon.server.stats.channels.lock().unwrap().clone();
    assert_eq!(channels, vec![("db.internal".to_string(), 3306)]);
}

#[tokio::test]
async fn test_private_key_tunnel() {
    let daemon = TestDaemon::start(test_config(TTL), FakeSshServer::new()).await;
    let fingerprint = FakeSshServer::fingerprint().to_string();

    let command = create_tunnel_command(
        json!({
            "authMethod": "PrivateKey",
            "sshUsername": "deploy",
            "privateSSHKey": GOOD_KEY,
            "sshHost": "bastion.example.com",
            "sshPort": "22"
        }),
        true,
        Some(&fingerprint),
    );
    let response = daemon.send(command).await;
    assert!(response.is_success(), "{:?}", response);
    assert!(response.local_tunnel_port().is_some());
}

#[tokio::test]
async fn test_missing_credentials() {
    let daemon = TestDaemon::start(test_config(TTL), FakeSshServer::new()).await;

    let command = create_tunnel_command(
        json!({
            "authMethod": "Password",
            "sshUsername": "deploy",
            "sshPassword": "",
            "sshHost": "bastion.example.com",
            "sshPort": 22
        }),
        false,
        None,
    );
    let response = daemon.send(command).await;

    assert_eq!(response.result, ResultCode::AuthFailure);
    assert_eq!(response.message, "NoValidAuthMethod");
    assert_eq!(daemon.server.connects(), 0);
}

#[tokio::test]
async fn test_dns_failure() {
    let daemon = TestDaemon::start(test_config(TTL), FakeSshServer::new()).await;

    let command = create_tunnel_command(
        json!({
            "authMethod": "Password",
            "sshUsername": "deploy",
            "sshPassword": "pw",
            "sshHost": UNRESOLVABLE_HOST,
            "sshPort": 22
        }),
        false,
        None,
    );
    let response = daemon.send(command).await;

    assert_eq!(response.result, ResultCode::TunnelError);
    assert_eq!(response.message, "DNSResolutionFailed");
    assert!(daemon.state.registry.is_empty());
}

#[tokio::test]
async fn test_wrong_password_reported() {
    let daemon = TestDaemon::start(test_config(TTL), FakeSshServer::new()).await;
    let fingerprint = FakeSshServer::fingerprint().to_string();

    let command = create_tunnel_command(
        json!({
            "authMethod": "Password",
            "sshUsername": "deploy",
            "sshPassword": "wrong",
            "sshHost": "bastion.example.com",
            "sshPort": 22
        }),
        true,
        Some(&fingerprint),
    );
    let response = daemon.send(command).await;

    assert_eq!(response.result, ResultCode::TunnelError);
    assert_eq!(response.message, "PasswordAuthFailed");
    assert!(daemon.state.registry.is_empty());
}

#[tokio::test]
async fn test_malformed_and_unknown_commands() {
    let daemon = TestDaemon::start(test_config(TTL), FakeSshServer::new()).await;

    let malformed: st_core::ControlResponse =
        serde_json::from_str(&send_raw(&daemon.address, "{not json").await).unwrap();
    assert_eq!(malformed.result, ResultCode::GeneralError);
    assert_eq!(malformed.message, "InvalidCommand");

    let missing_fields = daemon.send(json!({ "method": "CreateTunnel" })).await;
    assert_eq!(missing_fields.result, ResultCode::GeneralError);
    assert_eq!(missing_fields.message, "InvalidCommand");

    let unknown = daemon.send(json!({ "method": "ListTunnels" })).await;
    assert_eq!(unknown.result, ResultCode::NotImplemented);
    assert_eq!(unknown.message, "UnknownMethod");

    assert_eq!(daemon.server.connects(), 0);
}

#[tokio::test]
async fn test_response_framing() {
    let daemon = TestDaemon::start(test_config(TTL), FakeSshServer::new()).await;

    let raw = send_raw(
        &daemon.address,
        &json!({ "method": "CloseTunnel", "localPort": 1 }).to_string(),
    )
    .await;

    assert!(raw.ends_with("\r\n"), "{:?}", raw);
    let value: serde_json::Value = serde_json::from_str(raw.trim_end()).unwrap();
    assert_eq!(value["result"], json!(1));
    assert_eq!(value["message"], json!("TunnelNotFound"));
}

#[tokio::test]
async fn test_oversized_request_rejected() {
    let mut config = test_config(TTL);
    config.max_request_bytes = 128;
    let daemon = TestDaemon::start(config, FakeSshServer::new()).await;

    let padding = "x".repeat(512);
    let raw = send_raw(
        &daemon.address,
        &json!({ "method": "CloseTunnel", "localPort": 1, "pad": padding }).to_string(),
    )
    .await;

    let response: st_core::ControlResponse = serde_json::from_str(&raw).unwrap();
    assert_eq!(response.result, ResultCode::GeneralError);
    assert_eq!(response.message, "RequestTooLarge");
}

#[tokio::test]
async fn test_silent_client_is_dropped() {
    let mut config = test_config(TTL);
    config.request_timeout = Duration::from_millis(200);
    let daemon = TestDaemon::start(config, FakeSshServer::new()).await;

    let mut stream = TcpStream::connect(&daemon.address).await.unwrap();
    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut buf))
        .await
        .expect("idle control connection was never closed")
        .unwrap();
    assert_eq!(read, 0);

    // The daemon keeps serving other clients.
    let response = daemon.close_tunnel(1).await;
    assert_eq!(response.message, "TunnelNotFound");
}

#[tokio::test]
async fn test_concurrent_tunnels_get_distinct_ports() {
    let daemon = Arc::new(TestDaemon::start(test_config(TTL), FakeSshServer::new()).await);
    let fingerprint = FakeSshServer::fingerprint().to_string();

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let daemon = Arc::clone(&daemon);
        let fingerprint = fingerprint.clone();
        tasks.push(tokio::spawn(async move {
            daemon.create_tunnel(true, Some(&fingerprint)).await
        }));
    }

    let mut ports = Vec::new();
    for task in tasks {
        let response = task.await.unwrap();
        assert!(response.is_success(), "{:?}", response);
        ports.push(response.local_tunnel_port().unwrap());
    }
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), 5);
    assert_eq!(daemon.state.registry.len(), 5);
}
