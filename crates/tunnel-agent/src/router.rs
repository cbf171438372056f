//! HTTP router shared by both the tunneled remote listener and the local
//! loopback listener: `/open` and `/close` control endpoints plus one
//! reverse-proxy route pair per configured [`ExposedUpstream`].
//!
//! Longest-prefix-wins falls out of `axum`'s underlying radix-tree router
//! rather than registration order, so the explicit sort below is a
//! readability aid, not a correctness requirement.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{any, get};
use axum::Router;
use std::time::Duration;
use tracing::info;

use crate::config::Configuration;
use crate::dialer::CurrentChannel;
use crate::gate::{GateTransition, TunnelGate};
use crate::notify;
use crate::proxy;

const PROXY_CLIENT_TIMEOUT: Duration = Duration::from_secs(65);

#[derive(Clone)]
struct ControlState {
    gate: TunnelGate,
    current_channel: CurrentChannel,
    http_get_on_close: Option<String>,
}

async fn open_handler(State(state): State<ControlState>) -> StatusCode {
    match state.gate.open().await {
        GateTransition::Applied => StatusCode::OK,
        GateTransition::NoOp => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `/close`: gate first (sentinel removed, then flag flipped inactive), then
/// close the live SecureChannel — which surfaces as an error from the
/// remote pipeline's accept loop or heartbeat, which is what causes the
/// supervisor to restart it.
async fn close_handler(State(state): State<ControlState>) -> StatusCode {
    let transition = state.gate.close().await;
    if transition == GateTransition::Applied {
        state.current_channel.close().await;
        if let Some(url) = state.http_get_on_close.clone() {
            tokio::spawn(async move { notify::notify(&url).await });
        }
    }
    match transition {
        GateTransition::Applied => StatusCode::OK,
        GateTransition::NoOp => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Build the full router: control endpoints plus every configured upstream.
pub fn build(gate: TunnelGate, current_channel: CurrentChannel, config: &Configuration) -> Router {
    let control_state = ControlState {
        gate,
        current_channel,
        http_get_on_close: config.http_get_on_close.clone(),
    };
    let mut router = Router::new()
        .route("/open", get(open_handler))
        .route("/close", get(close_handler))
        .with_state(control_state);

    let client = reqwest::Client::builder()
        .timeout(PROXY_CLIENT_TIMEOUT)
        .build()
        .expect("reverse-proxy client builds with default TLS config");

    let mut upstreams = config.exposed_http_servers.clone();
    upstreams.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

    for upstream in upstreams {
        let prefix = upstream.prefix.trim_matches('/').to_string();
        if prefix.is_empty() {
            continue;
        }
        info!(prefix = %prefix, url = %upstream.url, "registering upstream proxy route");
        let mut upstream_router = Router::new().route(&format!("/{prefix}/*rest"), any(proxy::handle));
        // The control routes own the bare `/open` and `/close` paths outright;
        // an upstream sharing one of those prefixes still gets its `/prefix/*`
        // subtree proxied, just not the exact-match path axum would otherwise
        // refuse to register twice.
        if prefix != "open" && prefix != "close" {
            upstream_router = upstream_router.route(&format!("/{prefix}"), any(proxy::handle));
        }
        let upstream_router = upstream_router.with_state((client.clone(), upstream));
        router = router.merge(upstream_router);
    }

    router
}
