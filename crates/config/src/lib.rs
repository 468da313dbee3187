use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

const DEFAULT_CONFIG_FILES: &[&str] = &[
    "parley.toml",
    "config/parley.toml",
    "crates/config/parley.toml",
    "../parley.toml",
    "../config/parley.toml",
];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub relay: RelayConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub keys: KeysConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub address: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 7070,
        }
    }
}

/// Tuning knobs for the relay core and the per-connection loop.
///
/// ```
/// use parley_config::RelayConfig;
///
/// let relay = RelayConfig::default();
/// assert_eq!(relay.idle_timeout_seconds, 60);
/// assert_eq!(relay.typing_quiescence_seconds, 5);
/// assert!(relay.echo_to_sender);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "RelayConfig::default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "RelayConfig::default_typing_quiescence")]
    pub typing_quiescence_seconds: u64,
    #[serde(default = "RelayConfig::default_echo")]
    pub echo_to_sender: bool,
    #[serde(default = "RelayConfig::default_outbound_buffer")]
    pub outbound_buffer: usize,
    #[serde(default = "RelayConfig::default_verify_encrypted")]
    pub verify_encrypted: bool,
    #[serde(default = "RelayConfig::default_pending_batch")]
    pub pending_batch: u32,
}

impl RelayConfig {
    const fn default_idle_timeout() -> u64 {
        60
    }

    const fn default_typing_quiescence() -> u64 {
        5
    }

    const fn default_echo() -> bool {
        true
    }

    const fn default_outbound_buffer() -> usize {
        64
    }

    const fn default_verify_encrypted() -> bool {
        true
    }

    const fn default_pending_batch() -> u32 {
        50
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn typing_quiescence(&self) -> Duration {
        Duration::from_secs(self.typing_quiescence_seconds)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: Self::default_idle_timeout(),
            typing_quiescence_seconds: Self::default_typing_quiescence(),
            echo_to_sender: Self::default_echo(),
            outbound_buffer: Self::default_outbound_buffer(),
            verify_encrypted: Self::default_verify_encrypted(),
            pending_batch: Self::default_pending_batch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://parley.db".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub issuer: String,
    pub audience: String,
    #[serde(default = "AuthConfig::default_token_ttl")]
    pub token_ttl_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "default_secret_change_in_production".to_string(),
            issuer: "parley".to_string(),
            audience: "parley-clients".to_string(),
            token_ttl_seconds: Self::default_token_ttl(),
        }
    }
}

impl AuthConfig {
    fn default_token_ttl() -> u64 {
        86_400
    }
}

/// Room key material, by the key id stored on each room.
///
/// Values are base64-encoded 256-bit keys. A room whose key id is missing here is
/// relayed without integrity checks.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KeysConfig {
    #[serde(default)]
    pub keyring: HashMap<String, String>,
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Load the application configuration by combining defaults, files, and environment overrides.
///
/// ```
/// use parley_config::load;
///
/// std::env::remove_var("PARLEY_CONFIG");
///
/// let config = load().expect("configuration should load with defaults");
/// assert!(!config.http.address.is_empty());
/// ```
pub fn load() -> anyhow::Result<AppConfig> {
    let defaults = AppConfig::default();

    let builder = config::Config::builder()
        .set_default("http.address", defaults.http.address.clone())?
        .set_default("http.port", i64::from(defaults.http.port))?
        .set_default(
            "relay.idle_timeout_seconds",
            clamp_i64(defaults.relay.idle_timeout_seconds),
        )?
        .set_default(
            "relay.typing_quiescence_seconds",
            clamp_i64(defaults.relay.typing_quiescence_seconds),
        )?
        .set_default("relay.echo_to_sender", defaults.relay.echo_to_sender)?
        .set_default(
            "relay.outbound_buffer",
            clamp_i64(defaults.relay.outbound_buffer as u64),
        )?
        .set_default("relay.verify_encrypted", defaults.relay.verify_encrypted)?
        .set_default(
            "relay.pending_batch",
            i64::from(defaults.relay.pending_batch),
        )?
        .set_default("database.url", defaults.database.url.clone())?
        .set_default(
            "database.max_connections",
            i64::from(defaults.database.max_connections),
        )?
        .set_default("auth.jwt_secret", defaults.auth.jwt_secret.clone())?
        .set_default("auth.issuer", defaults.auth.issuer.clone())?
        .set_default("auth.audience", defaults.auth.audience.clone())?
        .set_default(
            "auth.token_ttl_seconds",
            clamp_i64(defaults.auth.token_ttl_seconds),
        )?;

    let mut builder = builder;
    let environment_overrides = config::Environment::with_prefix("PARLEY").separator("__");

    let mut config_file_attached = false;

    if let Ok(path) = std::env::var("PARLEY_CONFIG") {
        builder = builder.add_source(config::File::from(PathBuf::from(&path)));
        config_file_attached = true;
        debug!(path, "loading configuration via PARLEY_CONFIG");
    } else if let Ok(cwd) = std::env::current_dir() {
        let fallback = DEFAULT_CONFIG_FILES
            .iter()
            .map(|candidate| cwd.join(candidate))
            .find(|path| path.exists());

        if let Some(path) = fallback {
            debug!(path = %path.display(), "loading configuration file");
            builder = builder.add_source(config::File::from(path));
            config_file_attached = true;
        }
    }

    if !config_file_attached {
        debug!("no configuration file found, relying on defaults and environment overrides");
    }

    builder = builder.add_source(environment_overrides);

    let cfg = builder.build().context("unable to build configuration")?;

    let mut config = cfg
        .try_deserialize::<AppConfig>()
        .context("invalid configuration")?;

    if config.relay.outbound_buffer == 0 {
        config.relay.outbound_buffer = 1;
    }

    debug!(
        http = ?config.http,
        relay = ?config.relay,
        database = %config.database.url,
        "loaded relay configuration"
    );
    Ok(config)
}
