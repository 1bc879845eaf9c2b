//! Flag-aware configuration resolution.
//!
//! simsync-config owns the TOML profiles; this module applies the
//! `GlobalOpts` overrides and produces the engine and provider settings.

use secrecy::SecretString;

use simsync_config::{Config, Profile};
use simsync_core::{EngineConfig, ProviderConfig, TlsVerification};

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Everything needed to build an `Engine`.
pub struct Resolved {
    pub profile: String,
    pub engine: EngineConfig,
    pub provider: ProviderConfig,
}

/// Resolve the active profile name from CLI flags and config.
pub fn active_profile_name(global: &GlobalOpts, config: &Config) -> String {
    global
        .profile
        .clone()
        .or_else(|| config.default_profile.clone())
        .unwrap_or_else(|| "default".into())
}

/// Build engine and provider settings from the config file, profile, and flags.
pub fn resolve(global: &GlobalOpts) -> Result<Resolved, CliError> {
    let cfg = simsync_config::load_config_or_default();
    let profile_name = active_profile_name(global, &cfg);

    let profile = match cfg.profiles.get(&profile_name) {
        Some(profile) => profile.clone(),
        // An explicitly requested profile must exist.
        None if global.profile.is_some() => {
            return Err(CliError::ProfileNotFound {
                name: profile_name,
                available: available_profiles(&cfg),
            });
        }
        // No profile -- build from CLI flags / env vars alone
        None => {
            let provider_url = global.provider_url.clone().ok_or_else(|| CliError::NoConfig {
                path: simsync_config::config_path().display().to_string(),
            })?;
            Profile {
                provider_url,
                ..Profile::default()
            }
        }
    };

    resolve_profile(profile, &profile_name, &cfg, global)
}

fn resolve_profile(
    mut profile: Profile,
    profile_name: &str,
    cfg: &Config,
    global: &GlobalOpts,
) -> Result<Resolved, CliError> {
    // 1. Provider URL (flag > env > profile)
    if let Some(ref url) = global.provider_url {
        profile.provider_url.clone_from(url);
    }

    // 2. API key (flag > profile chain)
    let api_key = match global.api_key {
        Some(ref key) => SecretString::from(key.clone()),
        None => simsync_config::resolve_api_key(&profile, profile_name)?,
    };

    let mut provider = simsync_config::provider_config_with_key(&profile, &cfg.defaults, api_key)?;

    // 3. TLS and timeout overrides
    if global.insecure {
        provider.tls = TlsVerification::DangerAcceptInvalid;
    }
    if let Some(timeout) = global.timeout {
        provider.request_timeout = timeout;
    }

    let engine = simsync_config::profile_to_engine_config(&profile)?;

    Ok(Resolved {
        profile: profile_name.to_owned(),
        engine,
        provider,
    })
}

fn available_profiles(cfg: &Config) -> String {
    let mut names: Vec<&str> = cfg.profiles.keys().map(String::as_str).collect();
    if names.is_empty() {
        return "(none)".into();
    }
    names.sort_unstable();
    names.join(", ")
}
