//! Agent-side snapshot collection.
//!
//! One collection runs at a time per process. A snapshot is reused for
//! [`CACHE_TTL`] as long as the same requester asks again, so several hubs
//! polling one agent each get numbers measured over their own interval.

mod counters;
mod docker;
mod gpu;
mod probe;

pub use counters::*;
pub use docker::*;
pub use gpu::*;
pub use probe::*;

use crate::stats::{two_decimals, ContainerStats, FsStats, Snapshot, SystemInfo, SystemStats};

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a snapshot is served from cache to the same requester.
pub const CACHE_TTL: Duration = Duration::from_secs(60);

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Produces snapshots from a [`SystemProbe`], caching by requester identity.
pub struct Collector {
    state: Mutex<CollectorState>,
    cache_ttl: Duration,
}

struct CollectorState {
    probe: Box<dyn SystemProbe>,
    counters: CounterTracker,
    extra_filesystems: Vec<String>,
    last: Option<Arc<Snapshot>>,
    updated: Option<Instant>,
    requester: String,
}

impl Collector {
    /// `extra_filesystems` selects additional filesystems by mount point or
    /// device name.
    pub fn new(probe: Box<dyn SystemProbe>, extra_filesystems: Vec<String>) -> Self {
        Self::with_cache_ttl(probe, extra_filesystems, CACHE_TTL)
    }

    pub fn with_cache_ttl(
        probe: Box<dyn SystemProbe>,
        extra_filesystems: Vec<String>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(CollectorState {
                probe,
                counters: CounterTracker::new(),
                extra_filesystems,
                last: None,
                updated: None,
                requester: String::new(),
            }),
            cache_ttl,
        }
    }

    /// Return a snapshot for `requester`.
    ///
    /// The returned value is shared and must be treated as immutable. It is
    /// the exact same allocation when served from cache.
    pub fn gather(&self, requester: &str) -> Arc<Snapshot> {
        let mut state = self.state.lock();

        if let (Some(last), Some(updated)) = (&state.last, state.updated) {
            if updated.elapsed() < self.cache_ttl && state.requester == requester {
                tracing::debug!("Serving cached snapshot to {}", requester);
                return last.clone();
            }
        }

        let snapshot = Arc::new(state.collect(Instant::now()));
        state.last = Some(snapshot.clone());
        state.updated = Some(Instant::now());
        state.requester = requester.to_string();
        snapshot
    }
}

impl CollectorState {
    fn collect(&mut self, now: Instant) -> Snapshot {
        let host = self.probe.host();
        let cpu = two_decimals(self.probe.cpu_percent());
        let mem = self.probe.memory();
        let filesystems = self.probe.filesystems();
        let interfaces = self.probe.network();
        let containers = self.probe.containers();
        let gpus = self.probe.gpus();
        let temperatures = self.probe.temperatures();

        let mut seen: HashSet<String> = HashSet::new();
        let counters = &mut self.counters;
        let mut rate_mb = |key: String, value: u64| -> f64 {
            let rate = counters.rate(&key, value, now) / BYTES_PER_MB;
            seen.insert(key);
            two_decimals(rate)
        };

        let mut stats = SystemStats {
            cpu,
            mem_total: gb(mem.total),
            mem_used: gb(mem.used),
            mem_pct: percent(mem.used, mem.total),
            mem_buff_cache: gb(mem.buff_cache),
            swap_total: gb(mem.swap_total),
            swap_used: gb(mem.swap_used),
            ..Default::default()
        };

        let root = filesystems
            .iter()
            .find(|fs| fs.mount_point == "/")
            .or_else(|| filesystems.first());
        if let Some(root) = root {
            let used = root.total.saturating_sub(root.available);
            stats.disk_total = gb(root.total);
            stats.disk_used = gb(used);
            stats.disk_pct = percent(used, root.total);
            stats.disk_read = rate_mb(format!("disk:{}:read", root.device), root.read_bytes);
            stats.disk_write = rate_mb(format!("disk:{}:write", root.device), root.write_bytes);
        }

        for name in &self.extra_filesystems {
            let Some(fs) = filesystems
                .iter()
                .find(|fs| &fs.mount_point == name || &fs.device == name)
            else {
                tracing::debug!("Extra filesystem {} not found", name);
                continue;
            };
            stats.extra_fs.insert(
                name.clone(),
                FsStats {
                    disk_total: gb(fs.total),
                    disk_used: gb(fs.total.saturating_sub(fs.available)),
                    disk_read: rate_mb(format!("fs:{}:read", name), fs.read_bytes),
                    disk_write: rate_mb(format!("fs:{}:write", name), fs.write_bytes),
                },
            );
        }

        // Rates are taken per interface so one interface resetting does not
        // distort the total.
        for iface in &interfaces {
            stats.net_sent += rate_mb(format!("net:{}:sent", iface.interface), iface.sent);
            stats.net_recv += rate_mb(format!("net:{}:recv", iface.interface), iface.recv);
        }
        stats.net_sent = two_decimals(stats.net_sent);
        stats.net_recv = two_decimals(stats.net_recv);

        let containers = containers.map(|list| {
            list.into_iter()
                .map(|c| ContainerStats {
                    cpu: two_decimals(c.cpu),
                    mem: two_decimals(c.mem_bytes as f64 / BYTES_PER_MB),
                    net_sent: rate_mb(format!("ct:{}:sent", c.name), c.net_sent),
                    net_recv: rate_mb(format!("ct:{}:recv", c.name), c.net_recv),
                    name: c.name,
                })
                .collect::<Vec<_>>()
        });

        stats.gpus = gpus;
        stats.temperatures = temperatures.map(|t| {
            t.into_iter()
                .map(|(k, v)| (k, two_decimals(v)))
                .collect::<BTreeMap<_, _>>()
        });

        self.counters.retain_keys(|k| seen.contains(k));

        let info = SystemInfo {
            hostname: host.hostname,
            kernel: host.kernel,
            cpu_model: host.cpu_model,
            cores: host.cores,
            uptime: host.uptime,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            cpu: stats.cpu,
            mem_pct: stats.mem_pct,
            disk_pct: stats.disk_pct,
            bandwidth: two_decimals(stats.net_sent + stats.net_recv),
        };

        Snapshot {
            info,
            stats,
            containers,
        }
    }
}

fn gb(bytes: u64) -> f64 {
    two_decimals(bytes as f64 / BYTES_PER_GB)
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        two_decimals(part as f64 / total as f64 * 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::GpuData;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Scripted {
        net_sent: u64,
        disk_read: u64,
        containers: Option<Vec<ContainerReading>>,
    }

    struct FakeProbe {
        calls: Arc<AtomicUsize>,
        script: Arc<Mutex<Scripted>>,
    }

    impl SystemProbe for FakeProbe {
        fn host(&mut self) -> HostReading {
            self.calls.fetch_add(1, Ordering::SeqCst);
            HostReading {
                hostname: "web-1".to_string(),
                cores: 4,
                ..Default::default()
            }
        }

        fn cpu_percent(&mut self) -> f64 {
            12.3456
        }

        fn memory(&mut self) -> MemoryReading {
            MemoryReading {
                total: 8 * 1024 * 1024 * 1024,
                used: 2 * 1024 * 1024 * 1024,
                ..Default::default()
            }
        }

        fn filesystems(&mut self) -> Vec<FsReading> {
            let read = self.script.lock().disk_read;
            vec![
                FsReading {
                    device: "sdb1".to_string(),
                    mount_point: "/data".to_string(),
                    total: 100 * 1024 * 1024 * 1024,
                    available: 25 * 1024 * 1024 * 1024,
                    ..Default::default()
                },
                FsReading {
                    device: "sda1".to_string(),
                    mount_point: "/".to_string(),
                    total: 50 * 1024 * 1024 * 1024,
                    available: 40 * 1024 * 1024 * 1024,
                    read_bytes: read,
                    write_bytes: 0,
                },
            ]
        }

        fn network(&mut self) -> Vec<NetReading> {
            vec![NetReading {
                interface: "eth0".to_string(),
                sent: self.script.lock().net_sent,
                recv: 0,
            }]
        }

        fn containers(&mut self) -> Option<Vec<ContainerReading>> {
            self.script.lock().containers.clone()
        }

        fn gpus(&mut self) -> Option<BTreeMap<String, GpuData>> {
            None
        }

        fn temperatures(&mut self) -> Option<BTreeMap<String, f64>> {
            None
        }
    }

    fn collector(ttl: Duration) -> (Collector, Arc<AtomicUsize>, Arc<Mutex<Scripted>>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let script = Arc::new(Mutex::new(Scripted::default()));
        let probe = FakeProbe {
            calls: calls.clone(),
            script: script.clone(),
        };
        let collector = Collector::with_cache_ttl(Box::new(probe), vec!["/data".to_string()], ttl);
        (collector, calls, script)
    }

    #[test]
    fn test_same_requester_is_served_from_cache() {
        let (collector, calls, _) = collector(CACHE_TTL);

        let first = collector.gather("SHA256:hub-a");
        let second = collector.gather("SHA256:hub-a");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_different_requester_forces_collection() {
        let (collector, calls, _) = collector(CACHE_TTL);

        let first = collector.gather("SHA256:hub-a");
        let second = collector.gather("SHA256:hub-b");

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // hub-a lost the cache slot to hub-b.
        collector.gather("SHA256:hub-a");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_expired_cache_recollects() {
        let (collector, calls, _) = collector(Duration::ZERO);

        collector.gather("SHA256:hub-a");
        collector.gather("SHA256:hub-a");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_decreasing_counters_never_go_negative() {
        let (collector, _, script) = collector(Duration::ZERO);

        script.lock().net_sent = 500 * 1024 * 1024;
        script.lock().disk_read = 900 * 1024 * 1024;
        collector.gather("hub");

        // Agent host rebooted: counters start over.
        script.lock().net_sent = 1024;
        script.lock().disk_read = 0;
        let snapshot = collector.gather("hub");

        assert_eq!(snapshot.stats.net_sent, 0.0);
        assert_eq!(snapshot.stats.disk_read, 0.0);
        assert!(snapshot.info.bandwidth >= 0.0);
    }

    #[test]
    fn test_snapshot_contents() {
        let (collector, _, _) = collector(CACHE_TTL);
        let snapshot = collector.gather("hub");

        assert_eq!(snapshot.info.hostname, "web-1");
        assert_eq!(snapshot.stats.cpu, 12.35);
        assert_eq!(snapshot.stats.mem_total, 8.0);
        assert_eq!(snapshot.stats.mem_pct, 25.0);

        // Root is picked by mount point, not by position.
        assert_eq!(snapshot.stats.disk_total, 50.0);
        assert_eq!(snapshot.stats.disk_used, 10.0);
        assert_eq!(snapshot.stats.disk_pct, 20.0);

        let data = &snapshot.stats.extra_fs["/data"];
        assert_eq!(data.disk_used, 75.0);
    }

    #[test]
    fn test_missing_optional_sections_are_omitted() {
        let (collector, _, script) = collector(Duration::ZERO);

        let snapshot = collector.gather("hub");
        assert!(snapshot.containers.is_none());
        assert!(snapshot.stats.gpus.is_none());
        assert!(snapshot.stats.temperatures.is_none());

        script.lock().containers = Some(vec![ContainerReading {
            name: "nginx".to_string(),
            cpu: 1.5,
            mem_bytes: 64 * 1024 * 1024,
            ..Default::default()
        }]);
        let snapshot = collector.gather("hub");
        let containers = snapshot.containers.as_ref().unwrap();
        assert_eq!(containers[0].name, "nginx");
        assert_eq!(containers[0].mem, 64.0);
    }
}
