//! Wires the individual components (dialer, reverse listener, heartbeat,
//! router) into the two long-lived pipelines the agent runs under
//! [`crate::supervisor::keepalive`]: the tunneled remote listener and the
//! local loopback listener.
//!
//! Both pipelines share the same accept-loop-spawn-per-connection shape:
//! accept, hand the stream to a spawned task, keep looping.

use axum::Router;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Configuration;
use crate::dialer::{self, CurrentChannel};
use crate::error::{AgentError, AgentResult};
use crate::gate::TunnelGate;
use crate::heartbeat;
use crate::reverse;
use tunnel_core::{sanitize_private_key, Endpoint};

async fn serve_connection<S>(stream: S, router: Router)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = TowerToHyperService::new(router);
    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .serve_connection(io, service)
        .await
    {
        warn!(error = %e, "connection error");
    }
}

/// Dial the relay, acquire the reverse listener, and serve `router` over it
/// until the heartbeat fails or the listener closes. One call handles one
/// connection lifetime; the supervisor is responsible for calling this
/// again after it returns.
///
/// `current_channel` is registered with the freshly dialed channel for the
/// duration of the run, so a `GET /close` on either listener — which has no
/// other path back to this specific channel — can tear it down and cause
/// this function to return, which is what drives the supervisor to restart
/// the pipeline and re-enter the gate wait.
pub async fn remote_pipeline(
    config: &Configuration,
    gate: TunnelGate,
    current_channel: CurrentChannel,
    router: Router,
) -> AgentResult<()> {
    gate.wait_until_active().await;

    let sanitized_key = sanitize_private_key(&config.ssh_private_key)?;
    let endpoint = Endpoint::new(
        config.server_host.clone(),
        config.server_port,
        config.server_public_key.clone(),
        config.server_public_key_type.clone(),
    );

    let mut channel = dialer::dial(&endpoint, &config.ssh_username, &sanitized_key).await?;
    current_channel.set(&channel).await;

    let mut listener = match reverse::acquire(&mut channel, config.ssh_listen_port, &config.ssh_username).await {
        Ok(listener) => listener,
        Err(e) => {
            channel.close().await;
            current_channel.clear().await;
            return Err(e);
        }
    };
    info!(endpoint = %endpoint, port = config.ssh_listen_port, "remote pipeline serving");

    let (_stop_tx, stop_rx) = watch::channel(false);

    let accept_loop = async {
        loop {
            match listener.accept().await {
                Some(stream) => {
                    let router = router.clone();
                    tokio::spawn(serve_connection(stream, router));
                }
                None => return Ok::<(), AgentError>(()),
            }
        }
    };

    let result = tokio::select! {
        hb = heartbeat::run(&channel, stop_rx) => hb,
        sv = accept_loop => sv,
    };

    channel.close().await;
    current_channel.clear().await;
    result
}

/// Normalize a Go-style host-less bind address (e.g. `:35300`) to one
/// `TcpListener::bind` accepts. Go's `net.Listen("tcp", ":35300")` binds all
/// interfaces; Rust's `ToSocketAddrs` has no such shorthand, so a leading
/// colon is rewritten to `0.0.0.0:<port>`.
fn normalize_bind_addr(addr: &str) -> std::borrow::Cow<'_, str> {
    match addr.strip_prefix(':') {
        Some(port) => std::borrow::Cow::Owned(format!("0.0.0.0:{port}")),
        None => std::borrow::Cow::Borrowed(addr),
    }
}

/// Serve `router` on the local loopback listener until a connection-level
/// error makes the listener unusable. Unlike the remote pipeline, there is
/// no gate wait and no heartbeat — the local listener is not tied to the
/// relay's lifecycle.
pub async fn local_pipeline(config: &Configuration, router: Router) -> AgentResult<()> {
    let addr = normalize_bind_addr(&config.local_server_addr);
    let listener = TcpListener::bind(addr.as_ref()).await?;
    info!(addr = %addr, "local pipeline serving");

    loop {
        let (stream, addr) = listener.accept().await?;
        let router = router.clone();
        tokio::spawn(async move {
            info!(remote = %addr, "local connection accepted");
            serve_connection(stream, router).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_rewrites_host_less_form() {
        assert_eq!(normalize_bind_addr(":35300").as_ref(), "0.0.0.0:35300");
    }

    #[test]
    fn normalize_bind_addr_leaves_explicit_host_alone() {
        assert_eq!(normalize_bind_addr("127.0.0.1:8080").as_ref(), "127.0.0.1:8080");
    }
}
