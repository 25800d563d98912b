//! Process-wide application status
//!
//! Long-running loops (control accept loop, expiry monitor) watch this to
//! know when to stop. Moving to [`AppStatus::Stopping`] also cancels the
//! shutdown token so loops parked in `select!` wake immediately.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio_util::sync::CancellationToken;

/// Lifecycle stage of the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AppStatus {
    Starting = 0,
    Running = 1,
    Stopping = 2,
}

impl AppStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Starting,
            1 => Self::Running,
            _ => Self::Stopping,
        }
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppStatus::Starting => write!(f, "starting"),
            AppStatus::Running => write!(f, "running"),
            AppStatus::Stopping => write!(f, "stopping"),
        }
    }
}

/// Shared status flag plus the token cancelled on shutdown
pub struct StatusManager {
    status: AtomicU8,
    shutdown: CancellationToken,
}

impl StatusManager {
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(AppStatus::Starting as u8),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn get(&self) -> AppStatus {
        AppStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Move to `status`. `Stopping` is terminal and cannot be left.
    pub fn set(&self, status: AppStatus) {
        let previous = self
            .status
            .fetch_max(status as u8, Ordering::AcqRel);
        let previous = AppStatus::from_u8(previous);

        if previous != status && previous != AppStatus::Stopping {
            tracing::info!("Application status: {} -> {}", previous, status);
        }
        if status == AppStatus::Stopping {
            self.shutdown.cancel();
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.get() == AppStatus::Stopping
    }

    /// Resolves once the daemon starts stopping
    pub async fn stopping(&self) {
        self.shutdown.cancelled().await
    }

    /// Token cancelled on shutdown, for tasks that want their own child token
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

impl Default for StatusManager {
    fn default() -> Self {
        Self::new()
    }
}
