// ── Runtime engine configuration ──
//
// These types describe how to reach the provisioning provider and how long
// to wait for it. They carry credentials but never touch disk; the CLI
// builds an `EngineConfig` (via simsync-config) and hands it in.

use std::time::Duration;

use secrecy::SecretString;
use url::Url;

/// TLS verification strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsVerification {
    /// System CA store (strict).
    #[default]
    SystemDefaults,
    /// Custom CA certificate file.
    CustomCa(std::path::PathBuf),
    /// Skip verification. Only for lab providers with self-signed certs.
    DangerAcceptInvalid,
}

/// How to reach the provider's HTTP API.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub url: Url,
    pub api_key: SecretString,
    pub tls: TlsVerification,
    /// Per-request HTTP timeout, applied by the client itself.
    pub request_timeout: Duration,
}

/// Engine tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on a full-state fetch.
    pub fetch_timeout: Duration,
    /// Upper bound before a mutation reports "possibly applied".
    pub mutation_timeout: Duration,
    /// Upper bound on each mutating reprovisioning step.
    pub saga_step_timeout: Duration,
    /// Background refresh period for tracked lines. Zero disables it.
    pub refresh_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(20),
            mutation_timeout: Duration::from_secs(30),
            saga_step_timeout: Duration::from_secs(60),
            refresh_interval: Duration::ZERO,
        }
    }
}
