use thiserror::Error;

/// Errors surfaced by the agent's connection-lifetime machinery.
///
/// Every variant here corresponds to one of the error kinds in the design's
/// propagation policy: recoverable kinds restart the owning pipeline,
/// `BindFatal` and `ConfigMissing` exit the process.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration missing required field: {0}")]
    ConfigMissing(String),

    #[error("malformed private key: {0}")]
    MalformedKey(String),

    #[error("dial failed: {0}")]
    DialFailure(String),

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// Carries the message the relay returned for a forward request it
    /// denied. Handled in-component by the reclaim loop; only escalates to
    /// `BindFatal` once reclaim's own prerequisites fail.
    #[error("forward request denied by peer: {0}")]
    ForwardDenied(String),

    /// Unable to bind the remote port after reclaim failed or was not
    /// applicable. The reference policy exits the process on this error.
    #[error("unable to bind port: {0}")]
    BindFatal(String),

    /// A retryable failure acquiring the reverse listener — the pipeline
    /// should be restarted by the supervisor rather than the process exiting.
    #[error("retryable: {0}")]
    Retryable(String),

    #[error("heartbeat timed out after {0:?}")]
    HeartbeatTimeout(std::time::Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    UnknownFault(String),

    #[error("{0}")]
    Other(String),
}

impl From<tunnel_core::TunnelError> for AgentError {
    fn from(e: tunnel_core::TunnelError) -> Self {
        match e {
            tunnel_core::TunnelError::MalformedKey(m) => AgentError::MalformedKey(m),
            tunnel_core::TunnelError::HostKeyMismatch(m) => AgentError::AuthFailure(m),
            tunnel_core::TunnelError::DialFailure(m) => AgentError::DialFailure(m),
            tunnel_core::TunnelError::AuthFailure(m) => AgentError::AuthFailure(m),
            tunnel_core::TunnelError::Io(e) => AgentError::Io(e),
            tunnel_core::TunnelError::Ssh(e) => AgentError::Ssh(e),
        }
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
