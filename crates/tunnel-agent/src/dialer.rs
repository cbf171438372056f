//! Secure-channel dialer: establishes an authenticated outbound SSH session
//! to the relay.
//!
//! 10s connect timeout, host key pinned when the endpoint carries one,
//! permissive otherwise.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use russh::client::{Handle, Msg};
use russh::keys::PrivateKey;
use russh::Channel;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use tunnel_core::Endpoint;

use crate::error::{AgentError, AgentResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const FORWARDED_CHANNEL_BUFFER: usize = 64;

/// Handler for the outbound client session: pins the relay's host key when
/// configured, and routes server-initiated forwarded-tcpip channels (the
/// connections arriving at the reverse-forwarded port) to an mpsc channel
/// the reverse-listen acquirer drains.
pub struct ClientHandler {
    expected_key: Option<russh::keys::PublicKey>,
    forwarded_tx: mpsc::Sender<Channel<Msg>>,
}

impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        match &self.expected_key {
            Some(expected) => Ok(expected == server_public_key),
            // Host verification disabled — documented risk.
            None => Ok(true),
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _connected_address: &str,
        _connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut russh::client::Session,
    ) -> Result<(), Self::Error> {
        if self.forwarded_tx.send(channel).await.is_err() {
            warn!("forwarded-tcpip channel dropped: acquirer is no longer listening");
        }
        Ok(())
    }
}

/// A live authenticated session to an [`Endpoint`]. At most one exists at a
/// time in the remote pipeline; owned by the current run of that pipeline
/// and destroyed on close, heartbeat failure, or listener error.
pub struct SecureChannel {
    handle: Arc<Handle<ClientHandler>>,
    endpoint: Endpoint,
    forwarded_rx: Option<mpsc::Receiver<Channel<Msg>>>,
}

impl SecureChannel {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn handle(&self) -> &Handle<ClientHandler> {
        self.handle.as_ref()
    }

    /// Takes ownership of the stream of server-initiated forwarded-tcpip
    /// channels. Only meaningful once, right after a successful
    /// `tcpip_forward` request — the reverse-listen acquirer calls this.
    pub fn take_forwarded_channels(&mut self) -> Option<mpsc::Receiver<Channel<Msg>>> {
        self.forwarded_rx.take()
    }

    pub async fn close(&self) {
        let _ = self.handle.disconnect(russh::Disconnect::ByApplication, "", "").await;
    }
}

/// Shared slot holding the live channel's handle, so a part of the system
/// with no direct ownership of the [`SecureChannel`] — namely the `/close`
/// HTTP control route — can still close it. At most one `SecureChannel` is
/// ever alive in the remote pipeline, so a single slot
/// suffices; this is the "current SecureChannel reference" the design notes
/// call out as the one genuinely cross-thread piece of state besides the
/// gate.
#[derive(Clone, Default)]
pub struct CurrentChannel {
    handle: Arc<Mutex<Option<Arc<Handle<ClientHandler>>>>>,
}

impl CurrentChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `channel` as the currently live one, for `/close` to reach.
    pub async fn set(&self, channel: &SecureChannel) {
        *self.handle.lock().await = Some(channel.handle.clone());
    }

    /// Forget the currently registered channel. Called once the pipeline
    /// that owns it has torn it down, so a stale handle is never closed
    /// twice or attributed to the wrong pipeline run.
    pub async fn clear(&self) {
        *self.handle.lock().await = None;
    }

    /// Close whichever channel is currently registered, if any.
    pub async fn close(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.disconnect(russh::Disconnect::ByApplication, "", "").await;
        }
    }
}

fn parse_pinned_key(key_type: &str, base64_key: &str) -> AgentResult<russh::keys::PublicKey> {
    let blob = base64::engine::general_purpose::STANDARD
        .decode(base64_key)
        .map_err(|e| AgentError::Other(format!("invalid host public key base64: {e}")))?;
    let key = russh::keys::PublicKey::from_bytes(&blob)
        .map_err(|e| AgentError::Other(format!("invalid host public key: {e}")))?;
    if key.algorithm().as_str() != key_type {
        return Err(AgentError::Other(format!(
            "host key algorithm mismatch: expected {key_type}, got {}",
            key.algorithm()
        )));
    }
    Ok(key)
}

/// Establish a secure channel to `endpoint`, authenticating as `username`
/// with `sanitized_key` (already validated by
/// [`tunnel_core::sanitize_private_key`]).
pub async fn dial(
    endpoint: &Endpoint,
    username: &str,
    sanitized_key: &str,
) -> AgentResult<SecureChannel> {
    let key = PrivateKey::from_openssh(sanitized_key)
        .map_err(|e| AgentError::MalformedKey(e.to_string()))?;

    let expected_key = if endpoint.is_pinned() {
        Some(parse_pinned_key(
            endpoint.public_key_type().unwrap(),
            endpoint.public_key().unwrap(),
        )?)
    } else {
        None
    };

    let (forwarded_tx, forwarded_rx) = mpsc::channel(FORWARDED_CHANNEL_BUFFER);
    let handler = ClientHandler {
        expected_key,
        forwarded_tx,
    };

    let config = Arc::new(russh::client::Config::default());
    let addr = endpoint.describe();

    info!(endpoint = %addr, "dialing relay");
    let connect = russh::client::connect(config, addr.clone(), handler);
    let mut handle = tokio::time::timeout(CONNECT_TIMEOUT, connect)
        .await
        .map_err(|_| AgentError::DialFailure(format!("{addr}: connect timed out")))?
        .map_err(|e| AgentError::DialFailure(format!("{addr}: {e}")))?;

    let key_with_alg = russh::keys::PrivateKeyWithHashAlg::new(Arc::new(key), None);
    let auth = handle
        .authenticate_publickey(username, key_with_alg)
        .await
        .map_err(|e| AgentError::AuthFailure(e.to_string()))?;

    if !auth.success() {
        return Err(AgentError::AuthFailure(format!(
            "{username}@{addr}: key rejected by relay"
        )));
    }

    info!(endpoint = %addr, username, "secure channel established");
    Ok(SecureChannel {
        handle: Arc::new(handle),
        endpoint: endpoint.clone(),
        forwarded_rx: Some(forwarded_rx),
    })
}
