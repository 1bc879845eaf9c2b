//! Config subcommand handlers.

use dialoguer::{Input, Select};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tabled::Tabled;

use simsync_config::{Config, Profile};

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts, OutputFormat};
use crate::config::active_profile_name;
use crate::error::CliError;
use crate::output;

// ── Helpers ─────────────────────────────────────────────────────────

/// Map a dialoguer / interactive I/O failure into CliError.
fn prompt_err(e: impl std::fmt::Display) -> CliError {
    CliError::Validation {
        field: "interactive".into(),
        reason: format!("prompt failed: {e}"),
    }
}

fn prompt_api_key() -> Result<SecretString, CliError> {
    let key = rpassword::prompt_password("API key: ").map_err(prompt_err)?;
    if key.trim().is_empty() {
        return Err(CliError::Validation {
            field: "api_key".into(),
            reason: "API key cannot be empty".into(),
        });
    }
    Ok(SecretString::from(key))
}

#[derive(Tabled, Serialize, Clone)]
struct ProfileRow {
    #[tabled(rename = "")]
    active: &'static str,
    #[tabled(rename = "Profile")]
    name: String,
    #[tabled(rename = "Provider URL")]
    provider_url: String,
    #[tabled(rename = "Key source")]
    key_source: &'static str,
}

fn key_source(profile: &Profile) -> &'static str {
    if profile.api_key_env.is_some() {
        "env"
    } else if profile.api_key.is_some() {
        "config"
    } else {
        "keyring"
    }
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Init => init(),
        ConfigCommand::Show => show(global),
        ConfigCommand::Path => {
            output::print_output(&simsync_config::config_path().display().to_string(), false);
            Ok(())
        }
        ConfigCommand::Profiles => profiles(global),
        ConfigCommand::SetApiKey => {
            let cfg = simsync_config::load_config_or_default();
            let profile_name = active_profile_name(global, &cfg);
            let key = prompt_api_key()?;
            simsync_config::store_api_key(&profile_name, &key)?;
            if !global.quiet {
                eprintln!("API key for profile '{profile_name}' stored in system keyring");
            }
            Ok(())
        }
    }
}

// ── Init: interactive wizard ────────────────────────────────────────

fn init() -> Result<(), CliError> {
    let config_path = simsync_config::config_path();
    eprintln!("simsync configuration wizard");
    eprintln!("   Config path: {}\n", config_path.display());

    let profile_name: String = Input::new()
        .with_prompt("Profile name")
        .default("default".into())
        .interact_text()
        .map_err(prompt_err)?;

    let provider_url: String = Input::new()
        .with_prompt("Provider API URL")
        .interact_text()
        .map_err(prompt_err)?;
    if url::Url::parse(&provider_url).is_err() {
        return Err(CliError::Validation {
            field: "provider_url".into(),
            reason: format!("'{provider_url}' is not a valid URL"),
        });
    }

    let key = prompt_api_key()?;

    let store_choices = &[
        "Store in system keyring (recommended)",
        "Save to config file (plaintext)",
    ];
    let store_selection = Select::new()
        .with_prompt("Where to store the API key?")
        .items(store_choices)
        .default(0)
        .interact()
        .map_err(prompt_err)?;

    let api_key = if store_selection == 0 {
        simsync_config::store_api_key(&profile_name, &key)?;
        eprintln!("   API key stored in system keyring");
        None
    } else {
        Some(key.expose_secret().to_owned())
    };

    let profile = Profile {
        provider_url,
        api_key,
        ..Profile::default()
    };

    // Keep other profiles of an existing file.
    let mut cfg: Config = simsync_config::load_config().unwrap_or_default();
    cfg.profiles.insert(profile_name.clone(), profile);
    cfg.default_profile = Some(profile_name.clone());

    let path = simsync_config::save_config(&cfg)?;

    eprintln!("\nConfiguration written to {}", path.display());
    eprintln!("  Active profile: {profile_name}");
    eprintln!("\n  Test it: simsync show <SIM>");
    Ok(())
}

// ── Show / Profiles ─────────────────────────────────────────────────

fn show(global: &GlobalOpts) -> Result<(), CliError> {
    let mut cfg = simsync_config::load_config()?;
    for profile in cfg.profiles.values_mut() {
        if profile.api_key.is_some() {
            profile.api_key = Some("********".into());
        }
    }
    let out = match global.output {
        OutputFormat::Table | OutputFormat::Plain => toml::to_string_pretty(&cfg)?,
        format => output::render_single(format, &cfg, |_| String::new(), |_| String::new())?,
    };
    output::print_output(&out, global.quiet);
    Ok(())
}

fn profiles(global: &GlobalOpts) -> Result<(), CliError> {
    let cfg = simsync_config::load_config_or_default();
    let active = active_profile_name(global, &cfg);

    let mut rows: Vec<ProfileRow> = cfg
        .profiles
        .iter()
        .map(|(name, profile)| ProfileRow {
            active: if *name == active { "*" } else { "" },
            name: name.clone(),
            provider_url: profile.provider_url.clone(),
            key_source: key_source(profile),
        })
        .collect();
    rows.sort_by(|a, b| a.name.cmp(&b.name));

    let out = output::render_list(global.output, &rows, ProfileRow::clone, |r| r.name.clone())?;
    output::print_output(&out, global.quiet);
    Ok(())
}
