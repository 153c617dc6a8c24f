use std::fs;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};

fn harden_secret_file_permissions(path: &str) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub gateway: GatewaySettings,
    pub backend: BackendConfig,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".into(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AuthConfig {
    /// HS256 secret shared with the token-issuing service.
    pub jwt_secret: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: generate_random_hex(64),
        }
    }
}

/// Timings and limits for the connection layer.
#[derive(Debug, Deserialize, Serialize)]
pub struct GatewaySettings {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_seconds: u64,
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,
    #[serde(default = "default_max_sessions_per_user")]
    pub max_sessions_per_user: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: default_heartbeat_interval(),
            heartbeat_timeout_seconds: default_heartbeat_timeout(),
            send_queue_capacity: default_send_queue_capacity(),
            max_sessions_per_user: default_max_sessions_per_user(),
        }
    }
}

impl GatewaySettings {
    pub fn to_gateway_config(&self) -> palaver_core::GatewayConfig {
        palaver_core::GatewayConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_seconds),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_seconds),
            send_queue_capacity: self.send_queue_capacity,
            max_sessions_per_user: self.max_sessions_per_user,
        }
    }
}

/// REST backend that owns message history, group membership and the
/// offline-notification pipeline.
#[derive(Debug, Deserialize, Serialize)]
pub struct BackendConfig {
    pub base_url: String,
    /// Bearer token for server-to-server calls.
    pub api_token: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9000".into(),
            api_token: None,
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Generate a cryptographically random hex string of the given length.
fn generate_random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let idx = rng.gen_range(0..16u8);
            char::from(if idx < 10 {
                b'0' + idx
            } else {
                b'a' + idx - 10
            })
        })
        .collect()
}

fn default_heartbeat_interval() -> u64 {
    30
}
fn default_heartbeat_timeout() -> u64 {
    90
}
fn default_send_queue_capacity() -> usize {
    256
}
fn default_max_sessions_per_user() -> usize {
    5
}
fn default_request_timeout() -> u64 {
    10
}

fn looks_like_placeholder_secret(raw: &str) -> bool {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return true;
    }
    normalized.contains("change_me")
        || normalized.contains("replace_me")
        || normalized.starts_with("example")
        || normalized == "secret"
}

fn validate_config(config: &Config) -> Result<()> {
    let jwt_secret = config.auth.jwt_secret.trim();
    if jwt_secret.len() < 32 || looks_like_placeholder_secret(jwt_secret) {
        anyhow::bail!(
            "Invalid auth.jwt_secret: use a strong random secret (at least 32 characters) and never leave placeholder values"
        );
    }
    if config.gateway.heartbeat_timeout_seconds <= config.gateway.heartbeat_interval_seconds {
        anyhow::bail!("gateway.heartbeat_timeout_seconds must exceed heartbeat_interval_seconds");
    }
    if config.gateway.send_queue_capacity == 0 || config.gateway.max_sessions_per_user == 0 {
        anyhow::bail!("gateway queue capacity and session cap must be at least 1");
    }
    Ok(())
}

/// Generate a commented config file template with the given values filled in.
fn generate_config_template(config: &Config) -> String {
    format!(
        r#"# Palaver Gateway Configuration
# Generated automatically on first run. Edit as needed.

[server]
bind_address = "{bind_address}"

[auth]
# Shared with the token-issuing auth service (HS256).
jwt_secret = "{jwt_secret}"

[gateway]
# Expected client ping cadence.
heartbeat_interval_seconds = {heartbeat_interval}
# Silence deadline before a session is dropped.
heartbeat_timeout_seconds = {heartbeat_timeout}
# Per-session outbound queue depth; overflow drops the slow session.
send_queue_capacity = {send_queue_capacity}
# Concurrent devices allowed per user.
max_sessions_per_user = {max_sessions}

[backend]
# REST service that owns message history, groups and push notifications.
base_url = "{backend_url}"
# api_token = "server-to-server bearer token"
request_timeout_seconds = {request_timeout}
"#,
        bind_address = config.server.bind_address,
        jwt_secret = config.auth.jwt_secret,
        heartbeat_interval = config.gateway.heartbeat_interval_seconds,
        heartbeat_timeout = config.gateway.heartbeat_timeout_seconds,
        send_queue_capacity = config.gateway.send_queue_capacity,
        max_sessions = config.gateway.max_sessions_per_user,
        backend_url = config.backend.base_url,
        request_timeout = config.backend.request_timeout_seconds,
    )
}

// ── Config Loading ───────────────────────────────────────────────────────────

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::info!("Config file not found at '{}', generating defaults...", path);
            let config = Config::default();

            if let Some(parent) = std::path::Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }

            fs::write(path, generate_config_template(&config))?;
            let _ = harden_secret_file_permissions(path);
            tracing::info!("Generated default config at '{}'", path);
            config
        };
        let _ = harden_secret_file_permissions(path);

        // Environment variable overrides
        if let Ok(value) = std::env::var("PALAVER_BIND_ADDRESS") {
            config.server.bind_address = value;
        }
        if let Ok(value) = std::env::var("PALAVER_JWT_SECRET") {
            config.auth.jwt_secret = value;
        }
        if let Ok(value) = std::env::var("PALAVER_BACKEND_URL") {
            config.backend.base_url = value;
        }
        if let Ok(value) = std::env::var("PALAVER_BACKEND_API_TOKEN") {
            config.backend.api_token = if value.trim().is_empty() {
                None
            } else {
                Some(value)
            };
        }
        if let Ok(value) = std::env::var("PALAVER_HEARTBEAT_INTERVAL_SECONDS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.gateway.heartbeat_interval_seconds = parsed;
            }
        }
        if let Ok(value) = std::env::var("PALAVER_HEARTBEAT_TIMEOUT_SECONDS") {
            if let Ok(parsed) = value.parse::<u64>() {
                config.gateway.heartbeat_timeout_seconds = parsed;
            }
        }
        if let Ok(value) = std::env::var("PALAVER_SEND_QUEUE_CAPACITY") {
            if let Ok(parsed) = value.parse::<usize>() {
                config.gateway.send_queue_capacity = parsed;
            }
        }
        if let Ok(value) = std::env::var("PALAVER_MAX_SESSIONS_PER_USER") {
            if let Ok(parsed) = value.parse::<usize>() {
                config.gateway.max_sessions_per_user = parsed;
            }
        }

        validate_config(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let config = Config::default();
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.gateway.max_sessions_per_user, 5);
    }

    #[test]
    fn generated_secret_is_not_a_placeholder() {
        let auth = AuthConfig::default();
        assert_eq!(auth.jwt_secret.len(), 64);
        assert!(!looks_like_placeholder_secret(&auth.jwt_secret));
    }

    #[test]
    fn rejects_placeholder_jwt_secret() {
        let config = Config {
            auth: AuthConfig {
                jwt_secret: "change_me_please_change_me_please_now".into(),
            },
            ..Config::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_timeout_not_exceeding_interval() {
        let config = Config {
            gateway: GatewaySettings {
                heartbeat_interval_seconds: 30,
                heartbeat_timeout_seconds: 30,
                ..GatewaySettings::default()
            },
            ..Config::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn first_run_writes_a_loadable_template() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config_path = temp.path().join("palaver-test.toml");
        let path = config_path.to_str().expect("config path utf8");
        let generated = Config::load(path).expect("generate config");
        // The written template parses back to the same settings.
        let reloaded = Config::load(path).expect("reload config");
        assert_eq!(generated.auth.jwt_secret, reloaded.auth.jwt_secret);
        assert_eq!(
            generated.gateway.heartbeat_timeout_seconds,
            reloaded.gateway.heartbeat_timeout_seconds
        );
    }

    #[test]
    fn gateway_settings_convert_to_durations() {
        let settings = GatewaySettings {
            heartbeat_interval_seconds: 10,
            heartbeat_timeout_seconds: 25,
            send_queue_capacity: 32,
            max_sessions_per_user: 2,
        };
        let config = settings.to_gateway_config();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(25));
        assert_eq!(config.send_queue_capacity, 32);
    }
}
