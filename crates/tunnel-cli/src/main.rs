//! CLI entrypoint: wires the gate, configuration, router, and the two
//! supervised pipelines together, then runs forever.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tunnel_agent::{
    local_pipeline, remote_pipeline, keepalive, AgentError, Configuration, CurrentChannel, TunnelGate,
};

/// tunnel-agent — reverse-tunnel agent
#[derive(Parser, Debug)]
#[command(name = "tunnel-agent", version, about = "Reverse-tunnel agent: outbound SSH to a relay, reverse HTTP proxy back")]
struct Cli {
    /// Path to the settings.conf JSON defaults file
    #[arg(long, default_value = "settings.conf")]
    settings: PathBuf,

    /// Log level (trace, debug, info, warn, error); overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting tunnel-agent");

    let gate = TunnelGate::from_sentinel();

    let config = match Configuration::load_from(&cli.settings) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, "missing required configuration");
            std::process::exit(1);
        }
    };

    let current_channel = CurrentChannel::new();
    let router = tunnel_agent::build_router(gate.clone(), current_channel.clone(), &config);

    // The very first dial attempt treats a malformed key as fatal; every
    // subsequent restart surfaces the same error as an ordinary supervised
    // failure instead, since the key can't become valid between restarts
    // and the process has already committed to staying up past the startup
    // window.
    let first_remote_attempt = Arc::new(AtomicBool::new(true));

    // Local listener runs under its own supervisor on a spawned task; the
    // remote pipeline runs under the main thread's supervisor.
    let local_config = config.clone();
    let local_router = router.clone();
    let local_task = tokio::spawn(async move {
        keepalive(|| {
            let config = local_config.clone();
            let router = local_router.clone();
            async move { local_pipeline(&config, router).await }
        })
        .await;
    });

    let remote_config = config.clone();
    let remote_gate = gate.clone();
    let remote_channel = current_channel.clone();
    let remote_router = router.clone();
    let remote_first = first_remote_attempt.clone();
    keepalive(|| {
        let config = remote_config.clone();
        let gate = remote_gate.clone();
        let current_channel = remote_channel.clone();
        let router = remote_router.clone();
        let first = remote_first.clone();
        async move {
            let is_first_attempt = first.swap(false, Ordering::SeqCst);
            match remote_pipeline(&config, gate, current_channel, router).await {
                Err(AgentError::BindFatal(msg)) => {
                    error!(error = %msg, "unable to bind remote port, exiting");
                    std::process::exit(1);
                }
                Err(AgentError::MalformedKey(msg)) if is_first_attempt => {
                    error!(error = %msg, "malformed private key at startup, exiting");
                    std::process::exit(1);
                }
                other => other,
            }
        }
    })
    .await;

    // keepalive() never returns in normal operation; this is reachable only
    // if the local task panicked past its own fault barrier.
    let _ = local_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_settings_conf_and_info_log_level() {
        let cli = Cli::parse_from(["tunnel-agent"]);
        assert_eq!(cli.settings, PathBuf::from("settings.conf"));
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn accepts_overridden_settings_path_and_log_level() {
        let cli = Cli::parse_from(["tunnel-agent", "--settings", "/etc/tunnel/settings.conf", "--log-level", "debug"]);
        assert_eq!(cli.settings, PathBuf::from("/etc/tunnel/settings.conf"));
        assert_eq!(cli.log_level, "debug");
    }
}
