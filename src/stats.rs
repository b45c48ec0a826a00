//! Snapshot model shared by the agent (producer) and the hub (consumer).
//!
//! Sizes are in GB, rates in MB/s and percentages in the 0-100 range.
//! A `Snapshot` handed out by the collector is logically immutable: callers
//! that need to keep one past the next collection should clone it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One point-in-time bundle of host metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub info: SystemInfo,
    pub stats: SystemStats,
    /// Absent when no container runtime could be reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub containers: Option<Vec<ContainerStats>>,
}

/// Static host facts plus the headline numbers shown in host lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub kernel: String,
    pub cpu_model: String,
    pub cores: usize,
    pub uptime: u64,
    pub agent_version: String,
    pub cpu: f64,
    pub mem_pct: f64,
    pub disk_pct: f64,
    pub bandwidth: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub cpu: f64,
    pub mem_total: f64,
    pub mem_used: f64,
    pub mem_pct: f64,
    pub mem_buff_cache: f64,
    pub swap_total: f64,
    pub swap_used: f64,
    pub disk_total: f64,
    pub disk_used: f64,
    pub disk_pct: f64,
    pub disk_read: f64,
    pub disk_write: f64,
    pub net_sent: f64,
    pub net_recv: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_fs: BTreeMap<String, FsStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpus: Option<BTreeMap<String, GpuData>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperatures: Option<BTreeMap<String, f64>>,

    // Only populated on aggregated records.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cpu_max: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub bandwidth_max: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub disk_read_max: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub disk_write_max: f64,
}

/// Usage and throughput of a single filesystem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FsStats {
    pub disk_total: f64,
    pub disk_used: f64,
    pub disk_read: f64,
    pub disk_write: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuData {
    pub name: String,
    pub temperature: f64,
    pub mem_used: f64,
    pub mem_total: f64,
    pub usage: f64,
    pub power: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    pub name: String,
    pub cpu: f64,
    pub mem: f64,
    pub net_sent: f64,
    pub net_recv: f64,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

/// Round to two decimals, the precision every stored metric is kept at.
pub fn two_decimals(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
