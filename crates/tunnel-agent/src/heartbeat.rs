//! Heartbeat loop: periodically probes the live [`SecureChannel`] so a dead
//! relay connection is noticed even when no HTTP traffic is flowing. Sends
//! an SSH global request (`keepalive@openssh.com`, want_reply) every
//! interval, timed out and treated as fatal for the current pipeline run if
//! it doesn't complete in time.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::dialer::SecureChannel;
use crate::error::{AgentError, AgentResult};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(120);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends a single opaque global-request probe over `channel` and bounds it
/// with [`HEARTBEAT_TIMEOUT`]. Deliberately not a `channel_open_session`
/// round trip — that leaks a channel on relays that don't close it promptly.
async fn probe(channel: &SecureChannel) -> AgentResult<()> {
    let attempt = async { channel.handle().send_keepalive(true).await.map_err(AgentError::from) };

    tokio::time::timeout(HEARTBEAT_TIMEOUT, attempt)
        .await
        .map_err(|_| AgentError::HeartbeatTimeout(HEARTBEAT_TIMEOUT))??;
    Ok(())
}

/// Run the heartbeat loop until the channel dies, a probe fails, or
/// `stop` fires. `stop` is fired externally (by the listener task noticing
/// the relay connection is gone) so the two halves of a pipeline run can
/// tear each other down.
pub async fn run(channel: &SecureChannel, mut stop: watch::Receiver<bool>) -> AgentResult<()> {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.tick().await; // first tick fires immediately; skip it.

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = probe(channel).await {
                    warn!(error = %e, "heartbeat probe failed");
                    return Err(e);
                }
                info!("heartbeat ok");
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    info!("heartbeat stopped externally");
                    return Ok(());
                }
            }
        }
    }
}
