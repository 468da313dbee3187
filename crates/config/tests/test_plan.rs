//! Test plan for the `parley-config` crate.
//!
//! These tests exercise the configuration loader across default handling,
//! file discovery, environment overrides, and validation behaviour.

use std::fs;
use std::path::{Path, PathBuf};

use serial_test::serial;
use tempfile::TempDir;

use parley_config::{load, AppConfig, AuthConfig, HttpConfig, RelayConfig};

const ENV_VARS_TO_RESET: &[&str] = &[
    "PARLEY_CONFIG",
    "PARLEY__AUTH__AUDIENCE",
    "PARLEY__AUTH__ISSUER",
    "PARLEY__AUTH__JWT_SECRET",
    "PARLEY__AUTH__TOKEN_TTL_SECONDS",
    "PARLEY__DATABASE__MAX_CONNECTIONS",
    "PARLEY__DATABASE__URL",
    "PARLEY__HTTP__ADDRESS",
    "PARLEY__HTTP__PORT",
    "PARLEY__RELAY__ECHO_TO_SENDER",
    "PARLEY__RELAY__IDLE_TIMEOUT_SECONDS",
    "PARLEY__RELAY__OUTBOUND_BUFFER",
    "PARLEY__RELAY__PENDING_BATCH",
    "PARLEY__RELAY__TYPING_QUIESCENCE_SECONDS",
    "PARLEY__RELAY__VERIFY_ENCRYPTED",
];

struct TestContext {
    vars: Vec<(String, Option<String>)>,
    original_dir: Option<PathBuf>,
}

impl TestContext {
    fn new() -> Self {
        Self {
            vars: Vec::new(),
            original_dir: None,
        }
    }

    fn reset_environment(&mut self) {
        for key in ENV_VARS_TO_RESET {
            self.remove_var(key);
        }
    }

    fn set_var(&mut self, key: &str, value: impl AsRef<str>) {
        let previous = std::env::var(key).ok();
        std::env::set_var(key, value.as_ref());
        self.vars.push((key.to_string(), previous));
    }

    fn remove_var(&mut self, key: &str) {
        let previous = std::env::var(key).ok();
        std::env::remove_var(key);
        self.vars.push((key.to_string(), previous));
    }

    fn set_current_dir(&mut self, dir: &Path) {
        if self.original_dir.is_none() {
            self.original_dir =
                Some(std::env::current_dir().expect("failed to capture current directory"));
        }
        std::env::set_current_dir(dir).expect("failed to set current directory");
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        if let Some(original) = self.original_dir.take() {
            let _ = std::env::set_current_dir(original);
        }

        while let Some((key, value)) = self.vars.pop() {
            match value {
                Some(val) => std::env::set_var(&key, val),
                None => std::env::remove_var(&key),
            }
        }
    }
}

fn write_config_file(root: &Path, relative: &str, contents: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("failed to create config directories");
    }
    fs::write(path, contents).expect("failed to write config file");
}

#[test]
#[serial]
fn load_uses_default_values_when_no_files_found() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let mut ctx = TestContext::new();
    ctx.reset_environment();
    ctx.set_current_dir(temp_dir.path());

    let config = load().expect("configuration load should succeed without files");
    let defaults = AppConfig::default();

    assert_eq!(config.http.address, defaults.http.address);
    assert_eq!(config.http.port, defaults.http.port);
    assert_eq!(
        config.relay.idle_timeout_seconds,
        defaults.relay.idle_timeout_seconds
    );
    assert_eq!(config.relay.echo_to_sender, defaults.relay.echo_to_sender);
    assert_eq!(config.relay.outbound_buffer, defaults.relay.outbound_buffer);
    assert_eq!(config.relay.pending_batch, defaults.relay.pending_batch);
    assert_eq!(config.database.url, defaults.database.url);
    assert_eq!(
        config.database.max_connections,
        defaults.database.max_connections
    );
    assert_eq!(config.auth.issuer, defaults.auth.issuer);
    assert_eq!(config.auth.token_ttl_seconds, defaults.auth.token_ttl_seconds);
}

#[test]
#[serial]
fn load_picks_first_available_file_in_search_order() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let mut ctx = TestContext::new();
    ctx.reset_environment();
    ctx.set_current_dir(temp_dir.path());

    write_config_file(
        temp_dir.path(),
        "parley.toml",
        r#"
        [http]
        port = 4242
        "#,
    );
    write_config_file(
        temp_dir.path(),
        "config/parley.toml",
        r#"
        [http]
        port = 5151
        "#,
    );

    let config = load().expect("configuration load should pick the first file");
    assert_eq!(config.http.port, 4242);
}

#[test]
#[serial]
fn load_merges_partial_file_with_defaults() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let mut ctx = TestContext::new();
    ctx.reset_environment();
    ctx.set_current_dir(temp_dir.path());

    write_config_file(
        temp_dir.path(),
        "parley.toml",
        r#"
        [relay]
        idle_timeout_seconds = 15
        echo_to_sender = false

        [database]
        max_connections = 50
        "#,
    );

    let config = load().expect("configuration load should succeed");
    let defaults = AppConfig::default();

    assert_eq!(config.relay.idle_timeout_seconds, 15);
    assert!(!config.relay.echo_to_sender);
    assert_eq!(
        config.relay.typing_quiescence_seconds,
        defaults.relay.typing_quiescence_seconds
    );
    assert_eq!(config.database.max_connections, 50);
    assert_eq!(config.database.url, defaults.database.url);
    assert_eq!(config.http.port, defaults.http.port);
}

#[test]
#[serial]
fn load_reads_room_keyring_from_file() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let mut ctx = TestContext::new();
    ctx.reset_environment();
    ctx.set_current_dir(temp_dir.path());

    write_config_file(
        temp_dir.path(),
        "parley.toml",
        r#"
        [keys.keyring]
        ops-2024 = "AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8="
        "#,
    );

    let config = load().expect("configuration load should succeed");
    assert_eq!(config.keys.keyring.len(), 1);
    assert!(config.keys.keyring.contains_key("ops-2024"));
}

#[test]
#[serial]
fn load_reads_explicit_config_path() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let mut ctx = TestContext::new();
    ctx.reset_environment();

    write_config_file(
        temp_dir.path(),
        "elsewhere/relay.toml",
        r#"
        [auth]
        jwt_secret = "from-file"
        issuer = "custom-issuer"
        audience = "custom-audience"
        "#,
    );
    let path = temp_dir.path().join("elsewhere/relay.toml");
    ctx.set_var("PARLEY_CONFIG", path.display().to_string());

    let config = load().expect("configuration load should honour PARLEY_CONFIG");
    assert_eq!(config.auth.jwt_secret, "from-file");
    assert_eq!(config.auth.issuer, "custom-issuer");
    assert_eq!(config.auth.token_ttl_seconds, AuthConfig::default().token_ttl_seconds);
}

#[test]
#[serial]
fn load_applies_environment_overrides() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let mut ctx = TestContext::new();
    ctx.reset_environment();
    ctx.set_current_dir(temp_dir.path());

    write_config_file(
        temp_dir.path(),
        "parley.toml",
        r#"
        [http]
        port = 3030
        "#,
    );

    ctx.set_var("PARLEY__HTTP__PORT", "8080");
    ctx.set_var("PARLEY__RELAY__IDLE_TIMEOUT_SECONDS", "5");

    let config = load().expect("configuration load should honour env overrides");
    assert_eq!(config.http.port, 8080);
    assert_eq!(config.relay.idle_timeout_seconds, 5);
}

#[test]
#[serial]
fn load_supports_database_url_environment_variable() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let mut ctx = TestContext::new();
    ctx.reset_environment();
    ctx.set_current_dir(temp_dir.path());

    let url = "sqlite:///var/lib/parley/relay.db";
    ctx.set_var("PARLEY__DATABASE__URL", url);

    let config = load().expect("configuration load should read database env override");
    assert_eq!(config.database.url, url);
}

#[test]
#[serial]
fn load_raises_zero_outbound_buffer_to_one() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let mut ctx = TestContext::new();
    ctx.reset_environment();
    ctx.set_current_dir(temp_dir.path());

    write_config_file(
        temp_dir.path(),
        "parley.toml",
        r#"
        [relay]
        outbound_buffer = 0
        "#,
    );

    let config = load().expect("configuration load should succeed");
    assert_eq!(config.relay.outbound_buffer, 1);
}

#[test]
#[serial]
fn load_errors_on_invalid_toml_contents() {
    let temp_dir = TempDir::new().expect("failed to create temp dir");
    let mut ctx = TestContext::new();
    ctx.reset_environment();
    ctx.set_current_dir(temp_dir.path());

    write_config_file(
        temp_dir.path(),
        "parley.toml",
        r#"
        [http]
        port = "not-a-number
        "#,
    );

    let error = load().expect_err("invalid TOML should cause load to fail");
    let message = error.to_string();
    assert!(
        message.contains("invalid configuration") || message.contains("unable to build configuration"),
        "unexpected error message: {message}"
    );
}

#[test]
fn relay_config_durations_follow_seconds() {
    let relay = RelayConfig {
        idle_timeout_seconds: 90,
        typing_quiescence_seconds: 3,
        ..RelayConfig::default()
    };
    assert_eq!(relay.idle_timeout().as_secs(), 90);
    assert_eq!(relay.typing_quiescence().as_secs(), 3);
}

#[test]
fn http_config_defaults_match_expected_host_and_port() {
    let defaults = HttpConfig::default();
    assert_eq!(defaults.address, "127.0.0.1");
    assert_eq!(defaults.port, 7070);
}
