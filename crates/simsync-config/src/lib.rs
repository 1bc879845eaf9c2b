//! Configuration for the simsync CLI.
//!
//! TOML profiles, credential resolution (env + keyring + plaintext),
//! and translation to `simsync_core::{EngineConfig, ProviderConfig}`.
//! The CLI layers its `GlobalOpts` overrides on top.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use simsync_core::{EngineConfig, ProviderConfig, ReprovisioningRecord, TlsVerification};

/// Service name under which API keys live in the system keyring.
pub const KEYRING_SERVICE: &str = "simsync";

/// Overrides the config file location.
pub const CONFIG_PATH_ENV: &str = "SIMSYNC_CONFIG";

/// Overrides the directory holding reset records.
pub const STATE_DIR_ENV: &str = "SIMSYNC_STATE_DIR";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("profile '{profile}' is not defined")]
    UnknownProfile { profile: String },

    #[error("no API key configured for profile '{profile}'")]
    NoCredentials { profile: String },

    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("unreadable reset record: {0}")]
    Record(#[from] serde_json::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Default profile name.
    pub default_profile: Option<String>,

    /// Global defaults.
    #[serde(default)]
    pub defaults: Defaults,

    /// Named provider profiles.
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

impl Config {
    /// Look up `name`, falling back to the default profile.
    pub fn profile(&self, name: Option<&str>) -> Result<(String, &Profile), ConfigError> {
        let name = name
            .or(self.default_profile.as_deref())
            .unwrap_or("default")
            .to_owned();
        match self.profiles.get(&name) {
            Some(profile) => Ok((name, profile)),
            None => Err(ConfigError::UnknownProfile { profile: name }),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Defaults {
    #[serde(default = "default_output")]
    pub output: String,

    #[serde(default = "default_color")]
    pub color: String,

    #[serde(default)]
    pub insecure: bool,

    /// Per-request HTTP timeout, e.g. "30s".
    #[serde(default = "default_timeout")]
    pub timeout: String,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            output: default_output(),
            color: default_color(),
            insecure: false,
            timeout: default_timeout(),
        }
    }
}

fn default_output() -> String {
    "table".into()
}
fn default_color() -> String {
    "auto".into()
}
fn default_timeout() -> String {
    "30s".into()
}

/// A named provider profile. Durations use humantime syntax ("45s", "2m").
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct Profile {
    /// Provider API base URL.
    pub provider_url: String,

    /// API key (plaintext; prefer keyring or env var).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Environment variable name containing the API key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Path to custom CA certificate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,

    /// Override insecure TLS setting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,

    /// Override per-request HTTP timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_timeout: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mutation_timeout: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub saga_step_timeout: Option<String>,

    /// Background refresh period; "0s" disables it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_interval: Option<String>,
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path: `SIMSYNC_CONFIG`, then platform conventions.
pub fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    ProjectDirs::from("com", "simsync", "simsync").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("simsync");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load defaults ← TOML at `path` ← `SIMSYNC_*` environment.
///
/// Nested keys use a double underscore: `SIMSYNC_DEFAULTS__OUTPUT=json`.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("SIMSYNC_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

/// Load config, returning a default if the file is missing or invalid.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<PathBuf, ConfigError> {
    let path = config_path();
    save_config_to(cfg, &path)?;
    Ok(path)
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

// ── Reset records ───────────────────────────────────────────────────
//
// The engine keeps reprovisioning records in memory only. The CLI saves the
// record of each line here between invocations so a partial failure can be
// resumed or cleared later.

/// Directory for runtime state: `SIMSYNC_STATE_DIR`, then the platform data dir.
pub fn state_dir() -> PathBuf {
    if let Some(path) = std::env::var_os(STATE_DIR_ENV) {
        return PathBuf::from(path);
    }
    ProjectDirs::from("com", "simsync", "simsync").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".local");
            p.push("share");
            p.push("simsync");
            p
        },
        |dirs| dirs.data_dir().to_path_buf(),
    )
}

/// File holding the reset record of `line`.
pub fn reset_record_path(line: &str) -> PathBuf {
    let stem: String = line
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    state_dir().join("resets").join(format!("{stem}.json"))
}

/// Load the saved reset record of `line`, if any.
pub fn load_reset_record(line: &str) -> Result<Option<ReprovisioningRecord>, ConfigError> {
    let path = reset_record_path(line);
    match std::fs::read_to_string(&path) {
        Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Save the reset record of `line`; `None` removes it.
pub fn save_reset_record(line: &str, record: Option<&ReprovisioningRecord>) -> Result<(), ConfigError> {
    let path = reset_record_path(line);
    let Some(record) = record else {
        return match std::fs::remove_file(&path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        };
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let staged = path.with_extension("json.tmp");
    std::fs::write(&staged, serde_json::to_string_pretty(record)?)?;
    std::fs::rename(&staged, &path)?;
    Ok(())
}

// ── Credential resolution (without CLI flags) ───────────────────────

fn keyring_account(profile_name: &str) -> String {
    format!("{profile_name}/api-key")
}

/// Resolve an API key from the credential chain (no CLI flag step).
pub fn resolve_api_key(profile: &Profile, profile_name: &str) -> Result<SecretString, ConfigError> {
    // 1. Profile's api_key_env → env var lookup
    if let Some(ref env_name) = profile.api_key_env {
        if let Ok(val) = std::env::var(env_name) {
            return Ok(SecretString::from(val));
        }
    }

    // 2. System keyring
    if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, &keyring_account(profile_name)) {
        if let Ok(secret) = entry.get_password() {
            return Ok(SecretString::from(secret));
        }
    }

    // 3. Plaintext in config
    if let Some(ref key) = profile.api_key {
        return Ok(SecretString::from(key.clone()));
    }

    Err(ConfigError::NoCredentials {
        profile: profile_name.into(),
    })
}

/// Store a profile's API key in the system keyring.
pub fn store_api_key(profile_name: &str, key: &SecretString) -> Result<(), ConfigError> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, &keyring_account(profile_name))?;
    entry.set_password(key.expose_secret())?;
    Ok(())
}

// ── Translation to engine types ─────────────────────────────────────

/// Parse a humantime duration, naming the offending field on failure.
pub fn parse_duration(field: &str, raw: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(raw.trim()).map_err(|e| ConfigError::Validation {
        field: field.into(),
        reason: format!("'{raw}' is not a duration ({e})"),
    })
}

fn duration_or(field: &str, raw: Option<&String>, fallback: Duration) -> Result<Duration, ConfigError> {
    raw.map_or(Ok(fallback), |raw| parse_duration(field, raw))
}

/// Build engine tunables from a profile, keeping engine defaults for unset fields.
pub fn profile_to_engine_config(profile: &Profile) -> Result<EngineConfig, ConfigError> {
    let base = EngineConfig::default();
    Ok(EngineConfig {
        fetch_timeout: duration_or("fetch_timeout", profile.fetch_timeout.as_ref(), base.fetch_timeout)?,
        mutation_timeout: duration_or(
            "mutation_timeout",
            profile.mutation_timeout.as_ref(),
            base.mutation_timeout,
        )?,
        saga_step_timeout: duration_or(
            "saga_step_timeout",
            profile.saga_step_timeout.as_ref(),
            base.saga_step_timeout,
        )?,
        refresh_interval: duration_or(
            "refresh_interval",
            profile.refresh_interval.as_ref(),
            base.refresh_interval,
        )?,
    })
}

/// Build a `ProviderConfig` from a profile. No CLI flag overrides.
pub fn profile_to_provider_config(
    profile: &Profile,
    profile_name: &str,
    defaults: &Defaults,
) -> Result<ProviderConfig, ConfigError> {
    let api_key = resolve_api_key(profile, profile_name)?;
    provider_config_with_key(profile, defaults, api_key)
}

/// Build a `ProviderConfig` from a profile with an already resolved key.
pub fn provider_config_with_key(
    profile: &Profile,
    defaults: &Defaults,
    api_key: SecretString,
) -> Result<ProviderConfig, ConfigError> {
    let url: url::Url = profile
        .provider_url
        .parse()
        .map_err(|_| ConfigError::Validation {
            field: "provider_url".into(),
            reason: format!("invalid URL: {}", profile.provider_url),
        })?;

    let tls = if profile.insecure.unwrap_or(defaults.insecure) {
        TlsVerification::DangerAcceptInvalid
    } else if let Some(ref ca_path) = profile.ca_cert {
        TlsVerification::CustomCa(ca_path.clone())
    } else {
        TlsVerification::SystemDefaults
    };

    let raw_timeout = profile.timeout.as_ref().unwrap_or(&defaults.timeout);
    let request_timeout = parse_duration("timeout", raw_timeout)?;

    Ok(ProviderConfig {
        url,
        api_key,
        tls,
        request_timeout,
    })
}
