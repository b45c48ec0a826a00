//! Container stats from the Docker Engine API over the local unix socket.

use super::probe::ContainerReading;

use bollard::container::{CPUStats, ListContainersOptions, MemoryStatsStats, Stats, StatsOptions};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use tokio::runtime::Handle;

const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

/// Seconds before a Docker API request is abandoned.
const REQUEST_TIMEOUT: u64 = 2;

/// Docker client that remembers the previous CPU counters of each
/// container so one-shot stats can be turned into a usage percentage.
///
/// Collection runs on a blocking thread, so requests are driven through the
/// runtime handle captured at construction.
pub struct DockerClient {
    docker: Docker,
    runtime: Handle,
    prev_cpu: HashMap<String, (u64, u64)>,
}

impl DockerClient {
    /// Build a client from a `DOCKER_HOST` style value. Returns `None` when
    /// the socket does not exist, the host is not a unix socket, or no tokio
    /// runtime is running.
    pub fn from_host(docker_host: Option<&str>) -> Option<Self> {
        let socket = match docker_host {
            Some(host) => host.strip_prefix("unix://")?,
            None => DEFAULT_SOCKET,
        };
        if !Path::new(socket).exists() {
            tracing::debug!("Docker socket {} not found, container stats disabled", socket);
            return None;
        }
        let runtime = Handle::try_current().ok()?;
        let docker = match Docker::connect_with_socket(
            socket,
            REQUEST_TIMEOUT,
            bollard::API_DEFAULT_VERSION,
        ) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("Docker socket {} unusable: {}", socket, e);
                return None;
            }
        };
        Some(Self {
            docker,
            runtime,
            prev_cpu: HashMap::new(),
        })
    }

    /// Stats for every running container. Must not be called from an async
    /// context.
    pub fn stats(&mut self) -> Result<Vec<ContainerReading>, bollard::errors::Error> {
        let docker = self.docker.clone();
        let samples = self.runtime.block_on(fetch_all(docker))?;

        let mut readings = Vec::with_capacity(samples.len());
        let mut seen = Vec::with_capacity(samples.len());
        for (id, name, stats) in samples {
            let cpu = cpu_percent(&mut self.prev_cpu, &id, &stats.cpu_stats);
            seen.push(id);
            readings.push(reading(name, cpu, &stats));
        }

        self.prev_cpu.retain(|id, _| seen.contains(id));
        Ok(readings)
    }
}

/// CPU usage since the container's previous sample, stored in `prev`.
fn cpu_percent(prev: &mut HashMap<String, (u64, u64)>, id: &str, cpu: &CPUStats) -> f64 {
    let current = (cpu.cpu_usage.total_usage, cpu.system_cpu_usage.unwrap_or(0));
    let Some((prev_container, prev_system)) = prev.insert(id.to_string(), current) else {
        return 0.0;
    };

    let container_delta = current.0.saturating_sub(prev_container) as f64;
    let system_delta = current.1.saturating_sub(prev_system) as f64;
    if system_delta <= 0.0 {
        return 0.0;
    }
    container_delta / system_delta * cpu.online_cpus.unwrap_or(1).max(1) as f64 * 100.0
}

/// List running containers and take one stats sample of each. A container
/// whose sample fails is skipped.
async fn fetch_all(docker: Docker) -> Result<Vec<(String, String, Stats)>, bollard::errors::Error> {
    let containers = docker
        .list_containers(Some(ListContainersOptions::<String>::default()))
        .await?;

    let mut samples = Vec::with_capacity(containers.len());
    for c in containers {
        let Some(id) = c.id else { continue };
        let name = container_name(c.names.as_deref(), &id);

        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let stream = docker.stats(&id, Some(options));
        tokio::pin!(stream);
        match stream.next().await {
            Some(Ok(stats)) => samples.push((id, name, stats)),
            Some(Err(e)) => tracing::debug!("Skipping container {}: {}", name, e),
            None => tracing::debug!("Skipping container {}: no stats", name),
        }
    }
    Ok(samples)
}

fn container_name(names: Option<&[String]>, id: &str) -> String {
    names
        .and_then(|n| n.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| id.chars().take(12).collect())
}

/// Memory excludes the page cache, as `docker stats` reports it.
fn reading(name: String, cpu: f64, stats: &Stats) -> ContainerReading {
    let cache = match &stats.memory_stats.stats {
        Some(MemoryStatsStats::V1(v1)) => v1.inactive_file.max(v1.cache),
        Some(MemoryStatsStats::V2(v2)) => v2.inactive_file,
        None => 0,
    };

    let (net_sent, net_recv) = stats
        .networks
        .iter()
        .flat_map(|n| n.values())
        .fold((0u64, 0u64), |(tx, rx), n| (tx + n.tx_bytes, rx + n.rx_bytes));

    ContainerReading {
        name,
        cpu,
        mem_bytes: stats.memory_stats.usage.unwrap_or(0).saturating_sub(cache),
        net_sent,
        net_recv,
    }
}
