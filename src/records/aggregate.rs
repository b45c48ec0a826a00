//! Averaging of stats payloads into one longer record.

use crate::stats::{two_decimals, ContainerStats, FsStats, GpuData, SystemStats};

use std::collections::BTreeMap;

/// Average a window of system stats. Every numeric field is averaged;
/// the `*_max` fields keep the largest value seen, whether it came from a
/// raw sample or an already aggregated one.
pub fn average_system_stats(records: &[SystemStats]) -> SystemStats {
    if records.is_empty() {
        return SystemStats::default();
    }
    let n = records.len() as f64;
    let mut sum = SystemStats::default();

    let mut fs_sums: BTreeMap<String, (FsStats, f64)> = BTreeMap::new();
    let mut gpu_sums: BTreeMap<String, (GpuData, f64)> = BTreeMap::new();
    let mut temp_sums: BTreeMap<String, (f64, f64)> = BTreeMap::new();

    for r in records {
        sum.cpu += r.cpu;
        sum.mem_total += r.mem_total;
        sum.mem_used += r.mem_used;
        sum.mem_pct += r.mem_pct;
        sum.mem_buff_cache += r.mem_buff_cache;
        sum.swap_total += r.swap_total;
        sum.swap_used += r.swap_used;
        sum.disk_total += r.disk_total;
        sum.disk_used += r.disk_used;
        sum.disk_pct += r.disk_pct;
        sum.disk_read += r.disk_read;
        sum.disk_write += r.disk_write;
        sum.net_sent += r.net_sent;
        sum.net_recv += r.net_recv;

        sum.cpu_max = sum.cpu_max.max(r.cpu_max.max(r.cpu));
        sum.bandwidth_max = sum
            .bandwidth_max
            .max(r.bandwidth_max.max(r.net_sent + r.net_recv));
        sum.disk_read_max = sum.disk_read_max.max(r.disk_read_max.max(r.disk_read));
        sum.disk_write_max = sum.disk_write_max.max(r.disk_write_max.max(r.disk_write));

        for (name, fs) in &r.extra_fs {
            let (acc, count) = fs_sums.entry(name.clone()).or_default();
            acc.disk_total += fs.disk_total;
            acc.disk_used += fs.disk_used;
            acc.disk_read += fs.disk_read;
            acc.disk_write += fs.disk_write;
            *count += 1.0;
        }

        for (id, gpu) in r.gpus.iter().flatten() {
            let (acc, count) = gpu_sums.entry(id.clone()).or_default();
            acc.name = gpu.name.clone();
            acc.temperature += gpu.temperature;
            acc.mem_used += gpu.mem_used;
            acc.mem_total += gpu.mem_total;
            acc.usage += gpu.usage;
            acc.power += gpu.power;
            *count += 1.0;
        }

        for (name, temp) in r.temperatures.iter().flatten() {
            let (acc, count) = temp_sums.entry(name.clone()).or_default();
            *acc += temp;
            *count += 1.0;
        }
    }

    let avg = |v: f64| two_decimals(v / n);
    SystemStats {
        cpu: avg(sum.cpu),
        mem_total: avg(sum.mem_total),
        mem_used: avg(sum.mem_used),
        mem_pct: avg(sum.mem_pct),
        mem_buff_cache: avg(sum.mem_buff_cache),
        swap_total: avg(sum.swap_total),
        swap_used: avg(sum.swap_used),
        disk_total: avg(sum.disk_total),
        disk_used: avg(sum.disk_used),
        disk_pct: avg(sum.disk_pct),
        disk_read: avg(sum.disk_read),
        disk_write: avg(sum.disk_write),
        net_sent: avg(sum.net_sent),
        net_recv: avg(sum.net_recv),
        extra_fs: fs_sums
            .into_iter()
            .map(|(name, (fs, count))| {
                (
                    name,
                    FsStats {
                        disk_total: two_decimals(fs.disk_total / count),
                        disk_used: two_decimals(fs.disk_used / count),
                        disk_read: two_decimals(fs.disk_read / count),
                        disk_write: two_decimals(fs.disk_write / count),
                    },
                )
            })
            .collect(),
        gpus: (!gpu_sums.is_empty()).then(|| {
            gpu_sums
                .into_iter()
                .map(|(id, (gpu, count))| {
                    (
                        id,
                        GpuData {
                            name: gpu.name,
                            temperature: two_decimals(gpu.temperature / count),
                            mem_used: two_decimals(gpu.mem_used / count),
                            mem_total: two_decimals(gpu.mem_total / count),
                            usage: two_decimals(gpu.usage / count),
                            power: two_decimals(gpu.power / count),
                        },
                    )
                })
                .collect()
        }),
        temperatures: (!temp_sums.is_empty()).then(|| {
            temp_sums
                .into_iter()
                .map(|(name, (total, count))| (name, two_decimals(total / count)))
                .collect()
        }),
        cpu_max: sum.cpu_max,
        bandwidth_max: two_decimals(sum.bandwidth_max),
        disk_read_max: sum.disk_read_max,
        disk_write_max: sum.disk_write_max,
    }
}

/// Average container stats per container name over the samples in which
/// each container appeared.
pub fn average_container_stats(records: &[Vec<ContainerStats>]) -> Vec<ContainerStats> {
    let mut sums: BTreeMap<&str, (ContainerStats, f64)> = BTreeMap::new();

    for c in records.iter().flatten() {
        let (acc, count) = sums.entry(c.name.as_str()).or_default();
        acc.cpu += c.cpu;
        acc.mem += c.mem;
        acc.net_sent += c.net_sent;
        acc.net_recv += c.net_recv;
        *count += 1.0;
    }

    sums.into_iter()
        .map(|(name, (acc, count))| ContainerStats {
            name: name.to_string(),
            cpu: two_decimals(acc.cpu / count),
            mem: two_decimals(acc.mem / count),
            net_sent: two_decimals(acc.net_sent / count),
            net_recv: two_decimals(acc.net_recv / count),
        })
        .collect()
}
