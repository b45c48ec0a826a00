//! Database model types.

use crate::stats::SystemInfo;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default agent port.
pub const DEFAULT_AGENT_PORT: u16 = 45876;

/// Connectivity state of a monitored host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Pending,
    Up,
    Down,
    Paused,
}

impl HostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostStatus::Pending => "pending",
            HostStatus::Up => "up",
            HostStatus::Down => "down",
            HostStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(HostStatus::Pending),
            "up" => Ok(HostStatus::Up),
            "down" => Ok(HostStatus::Down),
            "paused" => Ok(HostStatus::Paused),
            other => Err(format!("unknown host status: {}", other)),
        }
    }
}

/// A monitored host running an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: i64,
    pub name: String,
    /// Hostname/IP, or an absolute unix socket path.
    pub address: String,
    pub port: u16,
    pub status: HostStatus,
    /// Agent fingerprint pinned on the first successful poll.
    pub fingerprint: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub info: SystemInfo,
}

impl Default for Host {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            address: String::new(),
            port: DEFAULT_AGENT_PORT,
            status: HostStatus::Pending,
            fingerprint: String::new(),
            last_seen: None,
            info: SystemInfo::default(),
        }
    }
}

impl Host {
    /// Address the hub dials to reach this host's agent.
    pub fn agent_address(&self) -> String {
        if self.address.starts_with('/') {
            self.address.clone()
        } else if self.address.contains(':') && !self.address.starts_with('[') {
            // Bare IPv6 literal
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

/// A notification recipient.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub webhooks: Vec<String>,
}

/// A user-configured connectivity alert for one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: i64,
    pub host_id: i64,
    pub user_id: i64,
    pub name: String,
    /// Minimum sustained outage, in minutes, before a down notification.
    pub min_minutes: i64,
}

impl Default for AlertRule {
    fn default() -> Self {
        Self {
            id: 0,
            host_id: 0,
            user_id: 0,
            name: "Status".to_string(),
            min_minutes: 1,
        }
    }
}

/// Resolution tier of a stored stats record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordTier {
    #[serde(rename = "1m")]
    Raw,
    #[serde(rename = "10m")]
    TenMinutes,
    #[serde(rename = "20m")]
    TwentyMinutes,
    #[serde(rename = "120m")]
    TwoHours,
    #[serde(rename = "480m")]
    EightHours,
}

impl RecordTier {
    pub const ALL: [RecordTier; 5] = [
        RecordTier::Raw,
        RecordTier::TenMinutes,
        RecordTier::TwentyMinutes,
        RecordTier::TwoHours,
        RecordTier::EightHours,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordTier::Raw => "1m",
            RecordTier::TenMinutes => "10m",
            RecordTier::TwentyMinutes => "20m",
            RecordTier::TwoHours => "120m",
            RecordTier::EightHours => "480m",
        }
    }

    /// Width of one aggregated window. Raw rows have no window.
    pub fn window_seconds(&self) -> i64 {
        match self {
            RecordTier::Raw => 0,
            RecordTier::TenMinutes => 600,
            RecordTier::TwentyMinutes => 1200,
            RecordTier::TwoHours => 7200,
            RecordTier::EightHours => 28800,
        }
    }

    /// Tier an aggregated tier is built from.
    pub fn source(&self) -> Option<RecordTier> {
        match self {
            RecordTier::Raw => None,
            RecordTier::TenMinutes => Some(RecordTier::Raw),
            RecordTier::TwentyMinutes => Some(RecordTier::TenMinutes),
            RecordTier::TwoHours => Some(RecordTier::TwentyMinutes),
            RecordTier::EightHours => Some(RecordTier::TwoHours),
        }
    }

    /// How long rows of this tier are kept. Raw retention is configurable.
    pub fn default_retention(&self) -> ChronoDuration {
        match self {
            RecordTier::Raw => ChronoDuration::hours(1),
            RecordTier::TenMinutes => ChronoDuration::hours(12),
            RecordTier::TwentyMinutes => ChronoDuration::days(1),
            RecordTier::TwoHours => ChronoDuration::days(7),
            RecordTier::EightHours => ChronoDuration::days(30),
        }
    }
}

impl FromStr for RecordTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordTier::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown record tier: {}", s))
    }
}

/// Which stats collection a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    System,
    Container,
}

impl RecordKind {
    pub fn table(&self) -> &'static str {
        match self {
            RecordKind::System => "system_stats",
            RecordKind::Container => "container_stats",
        }
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(RecordKind::System),
            "container" => Ok(RecordKind::Container),
            other => Err(format!("unknown record kind: {}", other)),
        }
    }
}

/// A persisted time-series row. The payload is JSON: `SystemStats` for
/// system records, `Vec<ContainerStats>` for container records.
#[derive(Debug, Clone, Serialize)]
pub struct StatsRecord {
    pub host_id: i64,
    pub tier: RecordTier,
    pub time: DateTime<Utc>,
    pub payload: String,
}
