//! Agent process: configuration, listener and liveness probe.

mod health;
mod server;

pub use health::*;
pub use server::*;

use crate::config::{ConfigError, EnvResolver, AGENT_ENV_PREFIX};
use crate::db::DEFAULT_AGENT_PORT;
use crate::transport::{parse_keys, KeyError, Network};

use ed25519_dalek::VerifyingKey;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use thiserror::Error;

/// Agent startup error types.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to load public keys: {0}")]
    Key(#[from] KeyError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Values given on the command line. They beat every environment source.
#[derive(Debug, Clone, Default)]
pub struct AgentFlags {
    pub key: Option<String>,
    pub listen: Option<String>,
}

/// Fully resolved agent settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub keys: Vec<VerifyingKey>,
    pub network: Network,
    pub listen: String,
    pub log_level: String,
    /// `None` keeps every sensor.
    pub sensors: Option<HashSet<String>>,
    pub extra_filesystems: Vec<String>,
    pub docker_host: Option<String>,
    pub fingerprint: String,
}

impl AgentConfig {
    pub fn load(flags: &AgentFlags) -> Result<Self, AgentError> {
        Self::load_from(&EnvResolver::new(AGENT_ENV_PREFIX), flags)
    }

    pub fn load_from(env: &EnvResolver, flags: &AgentFlags) -> Result<Self, AgentError> {
        let keys = load_public_keys(env, flags)?;
        let listen = listen_address(env, flags.listen.as_deref());

        let network = match env.resolve("NETWORK", None) {
            Some(r) => r.value.parse().map_err(|message| ConfigError::Invalid {
                key: "NETWORK".to_string(),
                message,
            })?,
            None => Network::detect(&listen),
        };

        let fingerprint = match env.resolve("FINGERPRINT", None) {
            Some(r) => r.value.trim().to_string(),
            None => host_fingerprint(),
        };

        Ok(Self {
            keys,
            network,
            listen,
            log_level: env
                .resolve("LOG_LEVEL", None)
                .map(|r| r.value.to_ascii_lowercase())
                .unwrap_or_else(|| "info".to_string()),
            sensors: env.resolve("SENSORS", None).map(|r| split_list(&r.value).into_iter().collect()),
            extra_filesystems: env
                .resolve("EXTRA_FILESYSTEMS", None)
                .map(|r| split_list(&r.value))
                .unwrap_or_default(),
            docker_host: env.resolve("DOCKER_HOST", None).map(|r| r.value),
            fingerprint,
        })
    }
}

/// Public keys from `--key`, then `KEY`, then the file named by `KEY_FILE`.
pub fn load_public_keys(env: &EnvResolver, flags: &AgentFlags) -> Result<Vec<VerifyingKey>, AgentError> {
    let resolved = env
        .resolve_with_file("KEY", flags.key.as_deref(), "KEY_FILE")?
        .ok_or(ConfigError::MissingKey(env.prefix()))?;
    tracing::debug!("Public keys loaded from {}", resolved.source);
    Ok(parse_keys(&resolved.value)?)
}

/// Listen address from `--listen`, then `LISTEN`, then the legacy `PORT`.
pub fn listen_address(env: &EnvResolver, flag: Option<&str>) -> String {
    if let Some(r) = env.resolve("LISTEN", flag) {
        return r.value;
    }
    match env.resolve("PORT", None) {
        Some(r) if r.value.starts_with(':') || r.value.contains('/') => r.value,
        Some(r) if r.value.chars().all(|c| c.is_ascii_digit()) => format!(":{}", r.value),
        Some(r) => r.value,
        None => format!(":{}", DEFAULT_AGENT_PORT),
    }
}

/// Stable identifier of this machine, reported to the hub for pinning.
pub fn host_fingerprint() -> String {
    let hostname = sysinfo::System::host_name().unwrap_or_default();
    let machine_id = std::fs::read_to_string("/etc/machine-id").unwrap_or_default();
    let digest = Sha256::digest(format!("{}{}", hostname, machine_id.trim()).as_bytes());
    format!("{:x}", digest)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
