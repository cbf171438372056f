//! Tunnel-state gate: a process-wide boolean mirrored by a sentinel file's
//! presence on disk, so the desired state survives agent restarts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

const SENTINEL_FILE: &str = "tunnelactive.flag";

/// Tracks whether the tunnel should be active, with file-backed persistence.
///
/// Cloning shares the same underlying state (it's an `Arc` handle), the
/// usual pattern for state that's read and written from multiple tasks.
#[derive(Clone)]
pub struct TunnelGate {
    active: Arc<Mutex<bool>>,
    sentinel_path: Arc<PathBuf>,
}

/// Returned by [`TunnelGate::open`]/[`TunnelGate::close`] to tell the caller
/// which HTTP status to respond with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateTransition {
    /// The gate changed state; the HTTP handler should respond 200.
    Applied,
    /// The gate was already in the requested state; respond 500.
    NoOp,
}

impl TunnelGate {
    /// Initialize the in-memory flag from the sentinel file's presence, per
    /// the invariant that the flag and the sentinel converge before startup
    /// completes.
    pub fn from_sentinel() -> Self {
        Self::from_sentinel_at(Path::new(SENTINEL_FILE))
    }

    pub fn from_sentinel_at(path: &Path) -> Self {
        let active = path.exists();
        info!(active, path = %path.display(), "tunnel gate initialized from sentinel");
        Self {
            active: Arc::new(Mutex::new(active)),
            sentinel_path: Arc::new(path.to_path_buf()),
        }
    }

    pub async fn is_active(&self) -> bool {
        *self.active.lock().await
    }

    /// Activate the tunnel. Sentinel is created *before* the in-memory flag
    /// flips, so a crash between the two steps never advertises an active
    /// tunnel that can't be reopened on restart.
    pub async fn open(&self) -> GateTransition {
        let mut active = self.active.lock().await;
        if *active {
            return GateTransition::NoOp;
        }
        info!("opening tunnel");
        if let Err(e) = std::fs::File::create(self.sentinel_path.as_path()) {
            error!(error = %e, "failed to create sentinel file");
        }
        *active = true;
        GateTransition::Applied
    }

    /// Deactivate the tunnel. Sentinel is removed *before* the in-memory
    /// flag flips, matching the ordering guarantee that the remote pipeline
    /// observes the flag as inactive before it next attempts to reacquire.
    pub async fn close(&self) -> GateTransition {
        let mut active = self.active.lock().await;
        if !*active {
            return GateTransition::NoOp;
        }
        info!("closing tunnel");
        if let Err(e) = std::fs::remove_file(self.sentinel_path.as_path()) {
            warn!(error = %e, "failed to remove sentinel file");
        }
        *active = false;
        GateTransition::Applied
    }

    /// Block until the gate is active. Polls once per second; there is no
    /// wakeup signal (see the design notes' discussion of replacing this
    /// with a condition variable — not applied here since the literal
    /// busy-wait is the behavior under test).
    pub async fn wait_until_active(&self) {
        if self.is_active().await {
            return;
        }
        info!("tunnel inactive, waiting");
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            if self.is_active().await {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_then_close_round_trips_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SENTINEL_FILE);
        let gate = TunnelGate::from_sentinel_at(&path);

        assert!(!gate.is_active().await);
        assert_eq!(gate.open().await, GateTransition::Applied);
        assert!(path.exists());
        assert_eq!(gate.open().await, GateTransition::NoOp);

        assert_eq!(gate.close().await, GateTransition::Applied);
        assert!(!path.exists());
        assert_eq!(gate.close().await, GateTransition::NoOp);
    }

    #[tokio::test]
    async fn from_sentinel_initializes_active_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SENTINEL_FILE);
        std::fs::File::create(&path).unwrap();

        let gate = TunnelGate::from_sentinel_at(&path);
        assert!(gate.is_active().await);
    }
}
