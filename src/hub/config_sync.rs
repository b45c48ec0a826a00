//! Host provisioning from `<DATA_DIR>/config.yml`.
//!
//! ```yaml
//! systems:
//!   - name: web-1
//!     host: 10.0.0.5
//!     port: 45876
//!     users:
//!       - ops@example.com
//! ```

use crate::db::{DbError, Host, Store, User, DEFAULT_AGENT_PORT};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

pub const CONFIG_FILE: &str = "config.yml";

/// Config sync error types.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config.yml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("database error: {0}")]
    Db(#[from] DbError),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub systems: Vec<SystemConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub users: Vec<String>,
}

fn default_port() -> u16 {
    DEFAULT_AGENT_PORT
}

/// What a sync pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Hosts missing from the file but kept because alert rules use them.
    pub kept: usize,
}

/// Apply `config.yml` from `data_dir` if it exists.
pub fn sync_from_dir(store: &Store, data_dir: &Path) -> Result<Option<SyncSummary>, SyncError> {
    let path = data_dir.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)?;
    let summary = sync_systems(store, &text)?;
    tracing::info!(
        "Synced {}: {} added, {} updated, {} deleted, {} kept",
        path.display(),
        summary.added,
        summary.updated,
        summary.deleted,
        summary.kept
    );
    Ok(Some(summary))
}

/// Make the stored hosts match a config document.
///
/// Hosts are matched by name. Users are created on first mention and linked
/// to their hosts. Hosts absent from the document are deleted unless alert
/// rules still reference them.
pub fn sync_systems(store: &Store, yaml: &str) -> Result<SyncSummary, SyncError> {
    let config: ConfigFile = serde_yaml::from_str(yaml)?;
    let mut summary = SyncSummary::default();

    let mut names = HashSet::new();
    for system in &config.systems {
        if system.name.is_empty() || system.host.is_empty() {
            return Err(SyncError::Invalid("every system needs a name and host".to_string()));
        }
        if !names.insert(system.name.as_str()) {
            return Err(SyncError::Invalid(format!("duplicate system name {}", system.name)));
        }
    }

    for system in &config.systems {
        let port = if system.port == 0 { DEFAULT_AGENT_PORT } else { system.port };
        let host_id = match store.get_host_by_name(&system.name)? {
            Some(mut existing) => {
                if existing.address != system.host || existing.port != port {
                    existing.address = system.host.clone();
                    existing.port = port;
                    store.update_host(&existing)?;
                    summary.updated += 1;
                }
                existing.id
            }
            None => {
                let mut host = Host {
                    name: system.name.clone(),
                    address: system.host.clone(),
                    port,
                    ..Default::default()
                };
                summary.added += 1;
                store.add_host(&mut host)?
            }
        };

        for email in &system.users {
            let user_id = match store.get_user_by_email(email)? {
                Some(user) => user.id,
                None => store.add_user(&mut User {
                    email: email.clone(),
                    ..Default::default()
                })?,
            };
            store.link_user(host_id, user_id)?;
        }
    }

    for host in store.get_hosts()? {
        if names.contains(host.name.as_str()) {
            continue;
        }
        match store.delete_host(host.id) {
            Ok(()) => {
                tracing::info!("Removed host {} (not in config)", host.name);
                summary.deleted += 1;
            }
            Err(DbError::InUse(reason)) => {
                tracing::warn!("Keeping host {} although it is not in config: {}", host.name, reason);
                summary.kept += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(summary)
}

/// Render the stored hosts as a provisioning document.
pub fn render_config_yaml(store: &Store) -> Result<String, SyncError> {
    let mut config = ConfigFile::default();
    for host in store.get_hosts()? {
        let users = store
            .get_host_users(host.id)?
            .into_iter()
            .map(|u| u.email)
            .collect();
        config.systems.push(SystemConfig {
            name: host.name,
            host: host.address,
            port: host.port,
            users,
        });
    }
    Ok(serde_yaml::to_string(&config)?)
}
