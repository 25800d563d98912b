//! Control server implementation
//!
//! Listens on 127.0.0.1 only. Every accepted connection is handled on its
//! own task, and the command itself runs on a further task so a failing
//! command can never take the listener down with it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use st_core::ControlResponse;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use crate::orchestrator::TunnelOrchestrator;
use crate::status::StatusManager;

/// Appended to every response
pub const RESPONSE_TERMINATOR: &str = "\r\n";

/// Pause after a failed accept so a persistent error does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long to discard the tail of a rejected oversized request
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone, Copy)]
struct Limits {
    buffer_size: usize,
    max_request_bytes: usize,
    request_timeout: Duration,
}

/// Control server for client applications
///
/// Listens on localhost only - not accessible from network.
pub struct ControlServer {
    /// Address to bind (127.0.0.1:port)
    pub address: String,
    orchestrator: Arc<TunnelOrchestrator>,
    status: Arc<StatusManager>,
    limits: Limits,
}

impl ControlServer {
    /// Create a server bound to the configured control address
    pub fn new(orchestrator: Arc<TunnelOrchestrator>) -> Self {
        let daemon = Arc::clone(orchestrator.daemon());
        Self {
            address: daemon.config.control_address(),
            status: Arc::clone(&daemon.status),
            limits: Limits {
                buffer_size: daemon.config.buffer_size,
                max_request_bytes: daemon.config.max_request_bytes,
                request_timeout: daemon.config.request_timeout,
            },
            orchestrator,
        }
    }

    /// Bind the listening socket
    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(&self.address)
            .await
            .with_context(|| format!("Failed to bind control server to {}", self.address))
    }

    /// Bind and serve until the daemon stops
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve an already-bound listener until the daemon stops
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!(
            "Control server listening on {}",
            listener.local_addr().context("Control listener has no address")?
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        if !peer_addr.ip().is_loopback() {
                            tracing::warn!("Rejected non-localhost connection from {}", peer_addr);
                            continue;
                        }

                        let orchestrator = Arc::clone(&self.orchestrator);
                        let limits = self.limits;
                        tokio::spawn(async move {
                            if let Err(e) = handle_client(stream, orchestrator, limits).await {
                                tracing::warn!("Control client {} error: {:#}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept control connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                _ = self.status.stopping() => {
                    tracing::info!("Control server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn handle_client(
    stream: TcpStream,
    orchestrator: Arc<TunnelOrchestrator>,
    limits: Limits,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader =
        BufReader::with_capacity(limits.buffer_size, reader).take(limits.max_request_bytes as u64);

    let mut request = Vec::new();
    let read = match tokio::time::timeout(
        limits.request_timeout,
        reader.read_until(b'\n', &mut request),
    )
    .await
    {
        Ok(read) => read.context("Failed to read command")?,
        Err(_) => {
            tracing::debug!(
                "Control client sent no command within {:?}, closing",
                limits.request_timeout
            );
            return Ok(());
        }
    };
    if read == 0 {
        tracing::debug!("Control client closed without sending a command");
        return Ok(());
    }

    let oversized = !request.ends_with(b"\n") && read >= limits.max_request_bytes;
    let response = if oversized {
        tracing::warn!(
            "Control command exceeds {} bytes, rejecting",
            limits.max_request_bytes
        );
        ControlResponse::general_error("RequestTooLarge")
    } else {
        match String::from_utf8(request) {
            Ok(text) if !text.trim().is_empty() => run_command(text, orchestrator).await,
            Ok(_) => ControlResponse::general_error("InvalidCommand"),
            Err(_) => {
                tracing::warn!("Control command is not valid UTF-8");
                ControlResponse::general_error("InvalidCommand")
            }
        }
    };

    write_response(&mut writer, &response).await?;
    writer.shutdown().await.ok();

    // Unread input would make the close a reset, which can discard the
    // response before the client reads it.
    if oversized {
        let mut rest = reader.into_inner();
        let mut sink = tokio::io::sink();
        let drain = tokio::io::copy(&mut rest, &mut sink);
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, drain).await;
    }
    Ok(())
}

/// Run the command on its own task and wait for its one response.
///
/// A `CreateTunnel` task keeps running after replying, for as long as the
/// tunnel lives.
async fn run_command(text: String, orchestrator: Arc<TunnelOrchestrator>) -> ControlResponse {
    let (reply_tx, reply_rx) = oneshot::channel();
    tokio::spawn(async move {
        orchestrator.handle_line(text.trim(), reply_tx).await;
    });

    match reply_rx.await {
        Ok(response) => response,
        Err(_) => {
            tracing::error!("Command handler ended without a response");
            ControlResponse::general_error("InternalError")
        }
    }
}

async fn write_response<W>(writer: &mut W, response: &ControlResponse) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut response_json = serde_json::to_string(response)?;
    response_json.push_str(RESPONSE_TERMINATOR);
    writer.write_all(response_json.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
