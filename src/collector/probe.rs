//! Raw readings from the host, behind a trait so the collector's caching and
//! delta logic can run against a scripted source.

use super::docker::DockerClient;
use super::gpu::GpuProbe;
use crate::stats::GpuData;

use std::collections::{BTreeMap, HashMap, HashSet};
use sysinfo::{Components, Disks, Networks, System};

/// Static host facts.
#[derive(Debug, Clone, Default)]
pub struct HostReading {
    pub hostname: String,
    pub kernel: String,
    pub cpu_model: String,
    pub cores: usize,
    pub uptime: u64,
}

/// Memory figures in bytes.
#[derive(Debug, Clone, Default)]
pub struct MemoryReading {
    pub total: u64,
    pub used: u64,
    pub buff_cache: u64,
    pub swap_total: u64,
    pub swap_used: u64,
}

/// One mounted filesystem with cumulative I/O counters in bytes.
#[derive(Debug, Clone, Default)]
pub struct FsReading {
    /// Device name without `/dev/`, e.g. `sda1`.
    pub device: String,
    pub mount_point: String,
    pub total: u64,
    pub available: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Cumulative byte counters of one network interface.
#[derive(Debug, Clone, Default)]
pub struct NetReading {
    pub interface: String,
    pub sent: u64,
    pub recv: u64,
}

/// One running container.
#[derive(Debug, Clone, Default)]
pub struct ContainerReading {
    pub name: String,
    pub cpu: f64,
    pub mem_bytes: u64,
    pub net_sent: u64,
    pub net_recv: u64,
}

/// Source of raw host readings. Optional sections return `None` when the
/// underlying facility is unavailable.
pub trait SystemProbe: Send {
    fn host(&mut self) -> HostReading;
    fn cpu_percent(&mut self) -> f64;
    fn memory(&mut self) -> MemoryReading;
    fn filesystems(&mut self) -> Vec<FsReading>;
    fn network(&mut self) -> Vec<NetReading>;
    fn containers(&mut self) -> Option<Vec<ContainerReading>>;
    fn gpus(&mut self) -> Option<BTreeMap<String, GpuData>>;
    fn temperatures(&mut self) -> Option<BTreeMap<String, f64>>;
}

/// Interfaces that only carry container or loopback traffic.
const SKIPPED_INTERFACE_PREFIXES: [&str; 5] = ["lo", "docker", "veth", "br-", "virbr"];

/// Probe backed by sysinfo, `/proc/diskstats`, the Docker socket and
/// `nvidia-smi`.
pub struct SysinfoProbe {
    sys: System,
    disks: Disks,
    networks: Networks,
    components: Components,
    sensors: Option<HashSet<String>>,
    docker: Option<DockerClient>,
    gpu: Option<GpuProbe>,
}

impl SysinfoProbe {
    pub fn new(sensors: Option<HashSet<String>>, docker: Option<DockerClient>) -> Self {
        let mut sys = System::new();
        // Prime CPU usage so the first collection has a baseline.
        sys.refresh_cpu();

        let gpu = GpuProbe::detect();
        if gpu.is_none() {
            tracing::debug!("No GPU tooling found, GPU stats disabled");
        }

        Self {
            sys,
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            components: Components::new_with_refreshed_list(),
            sensors,
            docker,
            gpu,
        }
    }
}

impl SystemProbe for SysinfoProbe {
    fn host(&mut self) -> HostReading {
        HostReading {
            hostname: System::host_name().unwrap_or_default(),
            kernel: System::kernel_version().unwrap_or_default(),
            cpu_model: self
                .sys
                .cpus()
                .first()
                .map(|c| c.brand().trim().to_string())
                .unwrap_or_default(),
            cores: self.sys.cpus().len(),
            uptime: System::uptime(),
        }
    }

    fn cpu_percent(&mut self) -> f64 {
        self.sys.refresh_cpu();
        self.sys.global_cpu_info().cpu_usage() as f64
    }

    fn memory(&mut self) -> MemoryReading {
        self.sys.refresh_memory();
        let total = self.sys.total_memory();
        let used = self.sys.used_memory();
        let free = self.sys.free_memory();
        MemoryReading {
            total,
            used,
            buff_cache: total.saturating_sub(used).saturating_sub(free),
            swap_total: self.sys.total_swap(),
            swap_used: self.sys.used_swap(),
        }
    }

    fn filesystems(&mut self) -> Vec<FsReading> {
        self.disks.refresh_list();
        let io = read_diskstats();

        self.disks
            .iter()
            .map(|disk| {
                let device = disk
                    .name()
                    .to_string_lossy()
                    .trim_start_matches("/dev/")
                    .to_string();
                let (read_bytes, write_bytes) = io.get(&device).copied().unwrap_or_default();
                FsReading {
                    mount_point: disk.mount_point().to_string_lossy().to_string(),
                    total: disk.total_space(),
                    available: disk.available_space(),
                    read_bytes,
                    write_bytes,
                    device,
                }
            })
            .collect()
    }

    fn network(&mut self) -> Vec<NetReading> {
        self.networks.refresh_list();
        self.networks
            .iter()
            .filter(|(name, _)| !SKIPPED_INTERFACE_PREFIXES.iter().any(|p| name.starts_with(p)))
            .map(|(name, data)| NetReading {
                interface: name.clone(),
                sent: data.total_transmitted(),
                recv: data.total_received(),
            })
            .collect()
    }

    fn containers(&mut self) -> Option<Vec<ContainerReading>> {
        let docker = self.docker.as_mut()?;
        match docker.stats() {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::debug!("Error getting docker stats: {}", e);
                None
            }
        }
    }

    fn gpus(&mut self) -> Option<BTreeMap<String, GpuData>> {
        self.gpu.as_mut()?.read()
    }

    fn temperatures(&mut self) -> Option<BTreeMap<String, f64>> {
        self.components.refresh_list();
        let temps: BTreeMap<String, f64> = self
            .components
            .iter()
            .filter(|c| match &self.sensors {
                Some(allowed) => allowed.contains(c.label()),
                None => true,
            })
            .map(|c| (c.label().to_string(), c.temperature() as f64))
            .filter(|(_, t)| t.is_finite() && *t > 0.0)
            .collect();

        if temps.is_empty() {
            None
        } else {
            Some(temps)
        }
    }
}

/// Cumulative (read, written) bytes per block device from `/proc/diskstats`.
fn read_diskstats() -> HashMap<String, (u64, u64)> {
    std::fs::read_to_string("/proc/diskstats")
        .map(|s| parse_diskstats(&s))
        .unwrap_or_default()
}

fn parse_diskstats(content: &str) -> HashMap<String, (u64, u64)> {
    const SECTOR: u64 = 512;
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                return None;
            }
            let read: u64 = fields[5].parse().ok()?;
            let written: u64 = fields[9].parse().ok()?;
            Some((fields[2].to_string(), (read * SECTOR, written * SECTOR)))
        })
        .collect()
}
