//! Configuration module for fleetwatch.
//!
//! Every setting is resolved through an explicit, ordered list of sources:
//! command-line flag, prefixed environment variable (`FLEETWATCH_HUB_KEY`,
//! `FLEETWATCH_AGENT_KEY`), the legacy unprefixed variable (`KEY`), and for
//! a few keys a file whose path comes from the environment.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Environment prefix for hub settings.
pub const HUB_ENV_PREFIX: &str = "FLEETWATCH_HUB_";
/// Environment prefix for agent settings.
pub const AGENT_ENV_PREFIX: &str = "FLEETWATCH_AGENT_";

/// Where a resolved value came from, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Source {
    Flag,
    PrefixedEnv,
    LegacyEnv,
    File,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Source::Flag => "flag",
            Source::PrefixedEnv => "prefixed env",
            Source::LegacyEnv => "legacy env",
            Source::File => "file",
        };
        f.write_str(name)
    }
}

/// A configuration value and the source that supplied it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub value: String,
    pub source: Source,
}

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no key provided: must set --key flag, {0}KEY env var, or {0}KEY_FILE env var")]
    MissingKey(&'static str),
    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

type Lookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Resolves keys against flag > prefixed env > legacy env > file.
#[derive(Clone)]
pub struct EnvResolver {
    prefix: &'static str,
    lookup: Lookup,
}

impl EnvResolver {
    /// Resolver backed by the process environment.
    pub fn new(prefix: &'static str) -> Self {
        Self::with_lookup(prefix, |key| std::env::var(key).ok())
    }

    /// Resolver backed by an arbitrary lookup, e.g. a map in tests.
    pub fn with_lookup<F>(prefix: &'static str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            prefix,
            lookup: Arc::new(lookup),
        }
    }

    pub fn prefix(&self) -> &'static str {
        self.prefix
    }

    /// Look up `key` in the environment: prefixed name first, then the
    /// legacy unprefixed name.
    pub fn env(&self, key: &str) -> Option<Resolved> {
        if let Some(value) = (self.lookup)(&format!("{}{}", self.prefix, key)) {
            return Some(Resolved {
                value,
                source: Source::PrefixedEnv,
            });
        }
        (self.lookup)(key).map(|value| Resolved {
            value,
            source: Source::LegacyEnv,
        })
    }

    /// Resolve `key` with an optional flag value taking precedence. Empty
    /// values count as unset.
    pub fn resolve(&self, key: &str, flag: Option<&str>) -> Option<Resolved> {
        if let Some(value) = flag.filter(|v| !v.is_empty()) {
            return Some(Resolved {
                value: value.to_string(),
                source: Source::Flag,
            });
        }
        self.env(key).filter(|r| !r.value.is_empty())
    }

    /// Like [`resolve`](Self::resolve), falling back to the contents of the
    /// file named by `file_key`.
    pub fn resolve_with_file(
        &self,
        key: &str,
        flag: Option<&str>,
        file_key: &str,
    ) -> Result<Option<Resolved>, ConfigError> {
        if let Some(resolved) = self.resolve(key, flag) {
            return Ok(Some(resolved));
        }
        let Some(path) = self.env(file_key).filter(|r| !r.value.is_empty()) else {
            return Ok(None);
        };
        let value = std::fs::read_to_string(&path.value).map_err(|source| ConfigError::ReadFile {
            path: path.value.clone(),
            source,
        })?;
        Ok(Some(Resolved {
            value,
            source: Source::File,
        }))
    }

    /// Parse an environment value, keeping `default` when unset or invalid.
    pub fn parse_or<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        match self.env(key) {
            Some(r) => match r.value.trim().parse() {
                Ok(v) => v,
                Err(_) => {
                    tracing::warn!("Ignoring invalid {}{}={:?}", self.prefix, key, r.value);
                    default
                }
            },
            None => default,
        }
    }
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API (default: 8090)
    pub http_port: u16,
    /// Directory holding the database, key pair and config.yml
    pub data_dir: PathBuf,
    /// Public URL of the hub, used for notification links
    pub app_url: String,
    /// Time between polls of one host (default: 60s)
    pub poll_interval: Duration,
    /// Deadline for one complete poll exchange (default: 5s)
    pub poll_timeout: Duration,
    /// Upper bound on outstanding agent connections (default: 64)
    pub max_concurrent_polls: usize,
    /// Age after which raw records are deleted (default: 1h)
    pub raw_retention: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8090,
            data_dir: PathBuf::from("fleetwatch_data"),
            app_url: String::new(),
            poll_interval: Duration::from_secs(60),
            poll_timeout: Duration::from_secs(5),
            max_concurrent_polls: 64,
            raw_retention: Duration::from_secs(3600),
        }
    }
}

impl ServerConfig {
    /// Load configuration from the process environment.
    ///
    /// Environment variables (each also accepted without the
    /// `FLEETWATCH_HUB_` prefix):
    /// - `FLEETWATCH_HUB_HTTP_PORT`
    /// - `FLEETWATCH_HUB_DATA_DIR`
    /// - `FLEETWATCH_HUB_APP_URL`
    /// - `FLEETWATCH_HUB_POLL_INTERVAL` (seconds)
    /// - `FLEETWATCH_HUB_POLL_TIMEOUT` (seconds)
    /// - `FLEETWATCH_HUB_MAX_CONCURRENT_POLLS`
    /// - `FLEETWATCH_HUB_RAW_RETENTION` (seconds)
    pub fn load() -> Self {
        Self::load_from(&EnvResolver::new(HUB_ENV_PREFIX))
    }

    pub fn load_from(env: &EnvResolver) -> Self {
        let defaults = Self::default();

        let data_dir = env
            .resolve("DATA_DIR", None)
            .map(|r| PathBuf::from(r.value))
            .unwrap_or(defaults.data_dir);
        let app_url = env
            .resolve("APP_URL", None)
            .map(|r| r.value.trim_end_matches('/').to_string())
            .unwrap_or_default();

        Self {
            http_port: env.parse_or("HTTP_PORT", defaults.http_port),
            data_dir,
            app_url,
            poll_interval: Duration::from_secs(env.parse_or("POLL_INTERVAL", 60u64).max(1)),
            poll_timeout: Duration::from_secs(env.parse_or("POLL_TIMEOUT", 5u64).max(1)),
            max_concurrent_polls: env.parse_or("MAX_CONCURRENT_POLLS", 64usize).max(1),
            raw_retention: Duration::from_secs(env.parse_or("RAW_RETENTION", 3600u64)),
        }
    }

    /// Path to the SQLite database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("fleetwatch.db")
    }
}

#[cfg(test)]
pub(crate) fn map_lookup(
    pairs: &[(&str, &str)],
) -> impl Fn(&str) -> Option<String> + Send + Sync + 'static {
    let map: std::collections::HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}
