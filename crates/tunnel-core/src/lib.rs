//! Shared types for the reverse-tunnel agent.
//!
//! This crate has no knowledge of how a connection is used — it only
//! describes the peer (`Endpoint`), sanitizes private key material, and
//! defines the error kinds that cross the dialer/gate/supervisor boundary.

mod endpoint;
mod error;
mod keys;

pub use endpoint::Endpoint;
pub use error::{TunnelError, TunnelResult};
pub use keys::sanitize_private_key;
