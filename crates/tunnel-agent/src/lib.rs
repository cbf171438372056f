//! Connection-lifetime machinery for the reverse-tunnel agent: dialing the
//! relay, acquiring the reverse listener, serving HTTP over both the
//! tunneled and local listeners, and supervising the whole thing forever.

mod config;
mod dialer;
mod error;
mod gate;
mod heartbeat;
mod notify;
mod pipeline;
mod proxy;
mod reverse;
mod router;
mod supervisor;

pub use config::{Configuration, ExposedUpstream};
pub use dialer::CurrentChannel;
pub use error::{AgentError, AgentResult};
pub use gate::{GateTransition, TunnelGate};
pub use pipeline::{local_pipeline, remote_pipeline};
pub use router::build as build_router;
pub use supervisor::keepalive;
