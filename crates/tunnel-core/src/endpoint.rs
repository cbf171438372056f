use std::fmt;

/// Descriptor for a network peer: a relay host, reachable on a single port,
/// with optional host-key pinning material.
///
/// Immutable after construction. When both key fields are present, the
/// secure-channel dialer pins the peer's host key; when absent, host
/// verification is disabled (see [`Endpoint::is_pinned`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
    public_key: Option<String>,
    public_key_type: Option<String>,
}

impl Endpoint {
    /// Construct an endpoint. `public_key`/`public_key_type` should both be
    /// `Some` or both be `None` — partial pinning material is treated as
    /// absent by [`Endpoint::is_pinned`].
    pub fn new(
        host: impl Into<String>,
        port: u16,
        public_key: Option<String>,
        public_key_type: Option<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            public_key,
            public_key_type,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn public_key(&self) -> Option<&str> {
        self.public_key.as_deref()
    }

    pub fn public_key_type(&self) -> Option<&str> {
        self.public_key_type.as_deref()
    }

    /// Whether this endpoint carries enough material to pin the host key.
    pub fn is_pinned(&self) -> bool {
        self.public_key.is_some() && self.public_key_type.is_some()
    }

    /// `host:port`, matching the relay's `SocketAddr`-style dial target.
    pub fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.describe())
    }
}
