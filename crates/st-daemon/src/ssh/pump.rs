//! Bidirectional copy between the local client and the SSH channel

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::handle::SessionHandle;

/// Why the pump stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// The local client closed its side
    LocalClosed,
    /// The remote end sent EOF
    RemoteClosed,
    /// The session was closed from elsewhere
    Cancelled,
}

/// Byte counts for one forwarded connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardSummary {
    pub to_remote: u64,
    pub to_local: u64,
    pub ended_by: PumpEnd,
}

/// Copy bytes both ways until one side closes, an I/O error occurs or the
/// session is closed.
///
/// A zero-byte read from the local client is passed on as EOF to the
/// channel before returning. Writes are raced against the session token,
/// so a peer that stops reading cannot keep a closed session alive.
pub async fn pump<L, R>(
    local: &mut L,
    remote: &mut R,
    handle: &SessionHandle,
    buffer_size: usize,
) -> io::Result<ForwardSummary>
where
    L: AsyncRead + AsyncWrite + Unpin + ?Sized,
    R: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut local_buf = vec![0u8; buffer_size];
    let mut remote_buf = vec![0u8; buffer_size];
    let mut to_remote = 0u64;
    let mut to_local = 0u64;

    let ended_by = loop {
        if handle.is_closed() {
            break PumpEnd::Cancelled;
        }

        tokio::select! {
            read = local.read(&mut local_buf) => {
                let n = read?;
                if n == 0 {
                    let eof = tokio::select! {
                        biased;
                        _ = handle.cancelled() => break PumpEnd::Cancelled,
                        eof = remote.shutdown() => eof,
                    };
                    if let Err(e) = eof {
                        tracing::debug!("Failed to send EOF to channel: {}", e);
                    }
                    break PumpEnd::LocalClosed;
                }
                if !write_unless_cancelled(&mut *remote, &local_buf[..n], handle).await? {
                    break PumpEnd::Cancelled;
                }
                to_remote += n as u64;
            }
            read = remote.read(&mut remote_buf) => {
                let n = read?;
                if n == 0 {
                    break PumpEnd::RemoteClosed;
                }
                if !write_unless_cancelled(&mut *local, &remote_buf[..n], handle).await? {
                    break PumpEnd::Cancelled;
                }
                to_local += n as u64;
            }
            _ = handle.cancelled() => break PumpEnd::Cancelled,
        }
    };

    Ok(ForwardSummary {
        to_remote,
        to_local,
        ended_by,
    })
}

/// Write and flush `data`. Returns `Ok(false)` if the session was closed
/// first.
async fn write_unless_cancelled<W>(
    writer: &mut W,
    data: &[u8],
    handle: &SessionHandle,
) -> io::Result<bool>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    tokio::select! {
        biased;
        _ = handle.cancelled() => Ok(false),
        written = async {
            writer.write_all(data).await?;
            writer.flush().await
        } => written.map(|()| true),
    }
}
