//! Close-notification client: fires a one-shot HTTPS GET when the tunnel
//! closes, for deployments that want an external signal (e.g. releasing a
//! load-balancer slot).
//!
//! Certificate verification is disabled for this request: the target is
//! frequently a self-signed internal endpoint, and availability of the
//! notification matters more than authenticating it (see DESIGN.md).

use std::time::Duration;

use tracing::{info, warn};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Fire-and-log a GET to `url`. Never returns an error to the caller —
/// a failed close-notification should never block or fail the tunnel
/// shutdown it's reporting.
pub async fn notify(url: &str) {
    let client = match reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .timeout(NOTIFY_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "failed to build close-notification client");
            return;
        }
    };

    match client.get(url).send().await {
        Ok(resp) => info!(url, status = %resp.status(), "close notification sent"),
        Err(e) => warn!(url, error = %e, "close notification failed"),
    }
}
