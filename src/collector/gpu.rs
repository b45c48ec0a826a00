//! NVIDIA GPU readings via `nvidia-smi`.

use crate::stats::{two_decimals, GpuData};

use std::collections::BTreeMap;
use std::process::Command;

const QUERY: &str =
    "--query-gpu=index,name,temperature.gpu,memory.used,memory.total,utilization.gpu,power.draw";

/// Handle on a working `nvidia-smi`. Only built when the tool runs.
pub struct GpuProbe {
    binary: String,
}

impl GpuProbe {
    pub fn detect() -> Option<Self> {
        let binary = "nvidia-smi".to_string();
        let ok = Command::new(&binary)
            .arg("-L")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        ok.then_some(Self { binary })
    }

    pub fn read(&mut self) -> Option<BTreeMap<String, GpuData>> {
        let output = match Command::new(&self.binary)
            .args([QUERY, "--format=csv,noheader,nounits"])
            .output()
        {
            Ok(o) if o.status.success() => o,
            Ok(o) => {
                tracing::debug!("nvidia-smi exited with {}", o.status);
                return None;
            }
            Err(e) => {
                tracing::debug!("Failed to run nvidia-smi: {}", e);
                return None;
            }
        };

        let gpus = parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout));
        if gpus.is_empty() {
            None
        } else {
            Some(gpus)
        }
    }
}

/// Parse `nvidia-smi` CSV output. Unsupported fields (`[N/A]`) read as 0.
pub fn parse_nvidia_smi(out: &str) -> BTreeMap<String, GpuData> {
    fn num(field: &str) -> f64 {
        field.trim().parse().unwrap_or(0.0)
    }

    let mut gpus = BTreeMap::new();
    for line in out.lines() {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 7 || fields[0].is_empty() {
            continue;
        }
        gpus.insert(
            fields[0].to_string(),
            GpuData {
                name: fields[1].trim_start_matches("NVIDIA ").to_string(),
                temperature: num(fields[2]),
                mem_used: two_decimals(num(fields[3]) / 1024.0),
                mem_total: two_decimals(num(fields[4]) / 1024.0),
                usage: num(fields[5]),
                power: two_decimals(num(fields[6])),
            },
        );
    }
    gpus
}
