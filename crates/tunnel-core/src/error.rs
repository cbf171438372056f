use thiserror::Error;

/// Errors produced while describing or authenticating to a relay endpoint.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The supplied private key could not be parsed, even after sanitization.
    #[error("malformed private key: {0}")]
    MalformedKey(String),

    /// The relay host key does not match the pinned key for the endpoint.
    #[error("host key mismatch for {0}")]
    HostKeyMismatch(String),

    /// The SSH transport could not be established.
    #[error("dial failed: {0}")]
    DialFailure(String),

    /// The relay rejected the offered key.
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),
}

pub type TunnelResult<T> = Result<T, TunnelError>;
