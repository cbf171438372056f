//! Settings loader: merges defaults, `settings.conf`, by-name files, and
//! environment variables into a [`Configuration`].
//!
//! Each scalar field has an explicit env var name and by-name file name;
//! there's no reflection-driven field discovery, so the resolution order is
//! visible at the call site for every field.

use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{AgentError, AgentResult};

/// One statically configured upstream HTTP service the router proxies to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExposedUpstream {
    /// Non-empty URL-safe path segment the router matches on.
    pub prefix: String,
    /// Absolute base URL of the upstream service.
    pub url: String,
}

/// Immutable, fully-resolved agent configuration. Built once at startup by
/// [`Configuration::load`].
#[derive(Debug, Clone)]
pub struct Configuration {
    pub server_host: String,
    pub server_port: u16,
    pub server_public_key: Option<String>,
    pub server_public_key_type: Option<String>,
    pub ssh_username: String,
    pub ssh_listen_port: u16,
    pub ssh_private_key: String,
    pub local_server_addr: String,
    pub http_get_on_close: Option<String>,
    pub exposed_http_servers: Vec<ExposedUpstream>,
}

/// Lowest-priority defaults loaded from a `settings.conf` JSON file, if
/// present. Any subset of fields may be supplied; everything else is
/// merged in from by-name files and then environment variables.
#[derive(Debug, Default, Deserialize)]
struct FileDefaults {
    #[serde(default)]
    server_host: Option<String>,
    #[serde(default)]
    server_port: Option<u16>,
    #[serde(default)]
    server_public_key: Option<String>,
    #[serde(default)]
    server_public_key_type: Option<String>,
    #[serde(default)]
    ssh_username: Option<String>,
    #[serde(default)]
    ssh_listen_port: Option<u16>,
    #[serde(default)]
    ssh_private_key: Option<String>,
    #[serde(default)]
    local_server_addr: Option<String>,
    #[serde(default)]
    http_get_on_close: Option<String>,
}

/// Resolve a single scalar field: env var (highest priority), then a local
/// file named exactly like the field, then the `settings.conf` default.
fn resolve_string(env_name: &str, file_name: &str, file_default: Option<String>) -> Option<String> {
    if let Ok(value) = std::env::var(env_name) {
        return Some(value);
    }
    if let Ok(contents) = std::fs::read_to_string(file_name) {
        return Some(contents.trim_end_matches(['\n', '\r']).to_string());
    }
    file_default
}

fn resolve_u16(env_name: &str, file_name: &str, file_default: Option<u16>) -> Option<u16> {
    resolve_string(env_name, file_name, file_default.map(|v| v.to_string()))
        .and_then(|s| s.parse::<u16>().ok())
}

/// Probe `EXPOSED_HTTPSERVERPREFIX{N}` / `EXPOSED_HTTPSERVERURL{N}` for
/// N = 1, 2, … until the first unset `URL` variable, matching the Go
/// original's list-field convention exactly.
fn resolve_exposed_upstreams() -> Vec<ExposedUpstream> {
    let mut upstreams = Vec::new();
    for n in 1.. {
        let url_var = format!("EXPOSED_HTTPSERVERURL{n}");
        let Ok(url) = std::env::var(&url_var) else {
            break;
        };
        let prefix_var = format!("EXPOSED_HTTPSERVERPREFIX{n}");
        let prefix = std::env::var(&prefix_var).unwrap_or_default();
        if prefix.is_empty() {
            warn!(var = %prefix_var, "exposed upstream has no prefix, skipping");
            continue;
        }
        debug!(n, prefix = %prefix, url = %url, "discovered exposed upstream");
        upstreams.push(ExposedUpstream { prefix, url });
    }
    upstreams
}

impl Configuration {
    /// Load configuration from `settings.conf` (lowest priority), by-name
    /// files, and environment variables (highest priority). Fails with
    /// [`AgentError::ConfigMissing`] if any required field is absent.
    pub fn load() -> AgentResult<Self> {
        Self::load_from(Path::new("settings.conf"))
    }

    pub fn load_from(settings_path: &Path) -> AgentResult<Self> {
        let defaults = if settings_path.exists() {
            info!(path = %settings_path.display(), "loading settings.conf");
            let contents = std::fs::read_to_string(settings_path)?;
            serde_json::from_str(&contents)
                .map_err(|e| AgentError::Other(format!("settings.conf parse error: {e}")))?
        } else {
            FileDefaults::default()
        };

        let require = |name: &str, value: Option<String>| -> AgentResult<String> {
            value.ok_or_else(|| AgentError::ConfigMissing(name.to_string()))
        };

        let server_host = require(
            "SERVER_HOST",
            resolve_string("SERVER_HOST", "ServerHost", defaults.server_host),
        )?;
        let server_port = resolve_u16("SERVER_PORT", "ServerPort", defaults.server_port)
            .ok_or_else(|| AgentError::ConfigMissing("SERVER_PORT".to_string()))?;
        let server_public_key = resolve_string(
            "SERVER_PUBLIC_KEY",
            "ServerPublicKey",
            defaults.server_public_key,
        );
        let server_public_key_type = resolve_string(
            "SERVER_PUBLIC_KEY_TYPE",
            "ServerPublicKeyType",
            defaults.server_public_key_type,
        );
        let ssh_username = require(
            "SSH_USERNAME",
            resolve_string("SSH_USERNAME", "SSHUsername", defaults.ssh_username),
        )?;
        let ssh_listen_port =
            resolve_u16("SSH_LISTEN_PORT", "SSHListenPort", defaults.ssh_listen_port)
                .ok_or_else(|| AgentError::ConfigMissing("SSH_LISTEN_PORT".to_string()))?;
        let ssh_private_key = require(
            "SSH_PRIVATE_KEY",
            resolve_string("SSH_PRIVATE_KEY", "SSHPrivateKey", defaults.ssh_private_key),
        )?;
        let local_server_addr = require(
            "LOCAL_SERVER_ADDR",
            resolve_string(
                "LOCAL_SERVER_ADDR",
                "LocalServerAddr",
                defaults.local_server_addr,
            ),
        )?;
        let http_get_on_close = resolve_string(
            "HTTP_GET_ON_CLOSE",
            "HTTPGetOnClose",
            defaults.http_get_on_close,
        );
        let exposed_http_servers = resolve_exposed_upstreams();

        Ok(Self {
            server_host,
            server_port,
            server_public_key,
            server_public_key_type,
            ssh_username,
            ssh_listen_port,
            ssh_private_key,
            local_server_addr,
            http_get_on_close,
            exposed_http_servers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch
    // them so they don't interleave with each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for (key, _) in std::env::vars() {
            if key.starts_with("SERVER_")
                || key.starts_with("SSH_")
                || key == "LOCAL_SERVER_ADDR"
                || key == "HTTP_GET_ON_CLOSE"
                || key.starts_with("EXPOSED_HTTPSERVER")
            {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn missing_required_field_fails() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let result = Configuration::load_from(&dir.path().join("settings.conf"));
        assert!(matches!(result, Err(AgentError::ConfigMissing(_))));
    }

    #[test]
    fn env_vars_take_priority_over_file() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let settings_path = dir.path().join("settings.conf");
        std::fs::write(
            &settings_path,
            r#"{"server_host":"from-file","server_port":2222,"ssh_username":"file-user","ssh_listen_port":9000,"ssh_private_key":"filekey","local_server_addr":":1"}"#,
        )
        .unwrap();

        std::env::set_var("SERVER_HOST", "from-env");
        let cfg = Configuration::load_from(&settings_path).unwrap();
        std::env::remove_var("SERVER_HOST");

        assert_eq!(cfg.server_host, "from-env");
        assert_eq!(cfg.server_port, 2222);
    }

    #[test]
    fn resolve_string_by_name_file_uses_the_field_name_not_the_env_name() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();

        // The env var's SCREAMING_SNAKE name must not be treated as a file name.
        std::fs::write("SERVER_HOST", "wrong-file").unwrap();
        std::fs::write("ServerHost", "right-file").unwrap();

        let resolved = resolve_string("SERVER_HOST", "ServerHost", None);

        std::env::set_current_dir(original_dir).unwrap();
        assert_eq!(resolved.as_deref(), Some("right-file"));
    }

    #[test]
    fn exposed_upstreams_stop_at_first_gap() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        std::env::set_var("EXPOSED_HTTPSERVERPREFIX1", "foo");
        std::env::set_var("EXPOSED_HTTPSERVERURL1", "http://127.0.0.1:9000");
        std::env::set_var("EXPOSED_HTTPSERVERPREFIX2", "bar");
        std::env::set_var("EXPOSED_HTTPSERVERURL2", "http://127.0.0.1:9001");
        // Gap at N=3 (no URL3) should stop discovery even though N=4 is set.
        std::env::set_var("EXPOSED_HTTPSERVERPREFIX4", "baz");
        std::env::set_var("EXPOSED_HTTPSERVERURL4", "http://127.0.0.1:9002");

        let upstreams = resolve_exposed_upstreams();

        std::env::remove_var("EXPOSED_HTTPSERVERPREFIX1");
        std::env::remove_var("EXPOSED_HTTPSERVERURL1");
        std::env::remove_var("EXPOSED_HTTPSERVERPREFIX2");
        std::env::remove_var("EXPOSED_HTTPSERVERURL2");
        std::env::remove_var("EXPOSED_HTTPSERVERPREFIX4");
        std::env::remove_var("EXPOSED_HTTPSERVERURL4");

        assert_eq!(upstreams.len(), 2);
        assert_eq!(upstreams[0].prefix, "foo");
        assert_eq!(upstreams[1].prefix, "bar");
    }
}
