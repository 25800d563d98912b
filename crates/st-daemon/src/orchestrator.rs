//! Tunnel orchestrator
//!
//! Turns one decoded control command into actions on the session engine
//! and the registry, and produces exactly one response for it.
//!
//! # Create flow
//!
//! A `CreateTunnel` normally takes two round trips. The first connects,
//! reports the host key fingerprint and disconnects. The client shows the
//! fingerprint to the user and resubmits with `fingerprintConfirmed` set
//! and the accepted fingerprint echoed back. Only then are credentials
//! sent and a local port opened.
//!
//! The response is delivered through a oneshot channel as soon as the
//! tunnel is ready; the calling task then stays in
//! [`TunnelSession::accept_and_forward`] for the lifetime of the tunnel.

use std::sync::Arc;

use st_core::control::{CloseTunnel, CreateTunnel, FINGERPRINT};
use st_core::redact::redact_command;
use st_core::{CommandError, ControlCommand, ControlResponse};
use tokio::sync::oneshot;

use crate::ssh::{SessionError, SshConnector, SshEndpoint, TunnelSession, TunnelTarget};
use crate::state::DaemonState;

/// Where the single response for a command goes
pub type Reply = oneshot::Sender<ControlResponse>;

fn send_reply(reply: Reply, response: ControlResponse) {
    if reply.send(response).is_err() {
        tracing::debug!("Control client went away before the response was sent");
    }
}

/// Dispatches control commands
pub struct TunnelOrchestrator {
    daemon: Arc<DaemonState>,
    connector: Arc<dyn SshConnector>,
}

impl TunnelOrchestrator {
    pub fn new(daemon: Arc<DaemonState>, connector: Arc<dyn SshConnector>) -> Self {
        Self { daemon, connector }
    }

    pub fn daemon(&self) -> &Arc<DaemonState> {
        &self.daemon
    }

    /// Decode and run one raw command.
    ///
    /// Malformed input and unknown methods are answered without taking
    /// any action.
    pub async fn handle_line(&self, raw: &str, reply: Reply) {
        if self.daemon.config.debug_json_messages {
            tracing::info!("Received command: {}", redact_command(raw));
        }

        match ControlCommand::parse(raw) {
            Ok(command) => self.dispatch(command, reply).await,
            Err(CommandError::UnknownMethod(method)) => {
                tracing::warn!("Invalid JSON message: unknown method {:?}", method);
                send_reply(reply, ControlResponse::not_implemented("UnknownMethod"));
            }
            Err(e) => {
                tracing::warn!("Invalid JSON message: {}", e);
                send_reply(reply, ControlResponse::general_error("InvalidCommand"));
            }
        }
    }

    /// Run a decoded command
    pub async fn dispatch(&self, command: ControlCommand, reply: Reply) {
        tracing::debug!("Dispatching {}", command.method());

        match command {
            ControlCommand::CreateTunnel(request) => self.create_tunnel(request, reply).await,
            ControlCommand::CloseTunnel(CloseTunnel { local_port }) => {
                let response = if self.close_tunnel(local_port) {
                    ControlResponse::success()
                } else {
                    ControlResponse::general_error("TunnelNotFound")
                };
                send_reply(reply, response);
            }
        }
    }

    /// Set up a tunnel and, once it is ready, forward its single client.
    ///
    /// Returns when the tunnel has been torn down (or setup failed).
    pub async fn create_tunnel(&self, request: CreateTunnel, reply: Reply) {
        let local_port = self.daemon.ports.next_port();

        let credential = match request.ssh_details.credential() {
            Ok(credential) => credential,
            Err(e) => {
                tracing::warn!(
                    "Rejecting tunnel to {}: {}",
                    request.ssh_details.ssh_host,
                    e
                );
                send_reply(reply, SessionError::NoValidAuthMethod.to_response());
                return;
            }
        };

        let target = TunnelTarget {
            ssh: SshEndpoint::new(
                request.ssh_details.ssh_host.clone(),
                request.ssh_details.ssh_port,
            ),
            username: request.ssh_details.ssh_username.clone(),
            credential,
            mysql_host: request.mysql_host.clone(),
            mysql_port: request.remote_mysql_port,
        };
        let mut session = TunnelSession::new(
            Arc::clone(&self.daemon),
            Arc::clone(&self.connector),
            target,
            local_port,
        );

        let fingerprint = match session.connect_and_fingerprint().await {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                tracing::warn!("Failed to start tunnel: {}", e);
                send_reply(reply, e.to_response());
                session.close().await;
                return;
            }
        };

        if !request.fingerprint_confirmed {
            send_reply(reply, ControlResponse::fingerprint_pending(fingerprint.to_string()));
            session.close().await;
            return;
        }

        let confirmed = request
            .fingerprint
            .as_deref()
            .is_some_and(|confirmed| fingerprint.matches(confirmed));
        if !confirmed {
            tracing::warn!(
                "Fingerprint mismatch for {}: server presented {}, client confirmed {:?}",
                request.ssh_details.ssh_host,
                fingerprint,
                request.fingerprint
            );
            send_reply(
                reply,
                SessionError::FingerprintNotMatched
                    .to_response()
                    .with(FINGERPRINT, fingerprint.to_string()),
            );
            session.close().await;
            return;
        }

        let local_port = match session.authenticate_and_forward().await {
            Ok(port) => port,
            Err(e) => {
                tracing::warn!(
                    "Failed to set up tunnel through {}: {}",
                    request.ssh_details.ssh_host,
                    e
                );
                send_reply(reply, e.to_response());
                session.close().await;
                return;
            }
        };

        if let Err(e) = self.daemon.registry.insert(Arc::clone(session.handle())) {
            tracing::error!("Cannot register tunnel: {}", e);
            send_reply(reply, ControlResponse::general_error("LocalPortInUse"));
            session.close().await;
            return;
        }

        tracing::info!(
            "Tunnel ready on local port {} ({} of {} ports available)",
            local_port,
            self.daemon.registry.free_count(),
            self.daemon.registry.total()
        );
        send_reply(reply, ControlResponse::tunnel_ready(local_port));

        match session.accept_and_forward().await {
            Ok(_) => {}
            Err(SessionError::Closed) => {
                tracing::debug!("Tunnel on local port {} closed before a client connected", local_port);
            }
            Err(e) => {
                tracing::warn!("Tunnel on local port {} failed: {}", local_port, e);
            }
        }
        session.close().await;
    }

    /// Close the tunnel on `local_port`.
    ///
    /// Returns `false` if no tunnel is registered there, which callers
    /// should treat as already closed.
    pub fn close_tunnel(&self, local_port: u16) -> bool {
        match self.daemon.registry.find_by_port(local_port) {
            Some(handle) => {
                handle.close();
                tracing::info!(
                    "Closed tunnel to {} on local port {} by request",
                    handle.ssh_host(),
                    local_port
                );
                true
            }
            None => {
                tracing::info!("No active tunnel on local port {}", local_port);
                false
            }
        }
    }
}
