//! `flowplane cpu` — host CPU load from `/proc/stat`.
//!
//! Reads the aggregate `cpu` line and reports the busy fraction between two
//! scans. This is the observer the application servers run next to the
//! backends; it lives here so the whole telemetry loop can be exercised on
//! one host.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::time::Duration;

/// Jiffy counters from the aggregate `cpu` line, plus the previous scan's
/// rollups for the delta computation.
#[derive(Debug, Default, Clone)]
pub struct CpuLoad {
    user: u64,
    nice: u64,
    system: u64,
    idle: u64,
    iowait: u64,
    irq: u64,
    softirq: u64,
    steal: u64,
    prev_idle_sum: u64,
    prev_total: u64,
}

impl CpuLoad {
    /// Refresh the counters from `/proc/stat`.
    pub fn scan(&mut self) -> Result<()> {
        let text = std::fs::read_to_string("/proc/stat").context("read /proc/stat")?;
        let line = text
            .lines()
            .find(|l| l.starts_with("cpu "))
            .context("/proc/stat has no aggregate cpu line")?;
        self.parse_line(line)
    }

    fn parse_line(&mut self, line: &str) -> Result<()> {
        let mut fields = line.split_whitespace().skip(1).map(str::parse::<u64>);
        let mut next = |name: &str| -> Result<u64> {
            match fields.next() {
                Some(Ok(v)) => Ok(v),
                _ => bail!("malformed cpu line, missing field {name}"),
            }
        };
        self.user = next("user")?;
        self.nice = next("nice")?;
        self.system = next("system")?;
        self.idle = next("idle")?;
        // Present since Linux 2.6.33; default to 0 on older kernels.
        self.iowait = next("iowait").unwrap_or(0);
        self.irq = next("irq").unwrap_or(0);
        self.softirq = next("softirq").unwrap_or(0);
        self.steal = next("steal").unwrap_or(0);
        Ok(())
    }

    /// Total jiffies across all accounted states.
    pub fn total(&self) -> u64 {
        self.user + self.nice + self.system + self.idle + self.iowait + self.irq + self.softirq + self.steal
    }

    /// Jiffies spent idle or waiting for I/O.
    pub fn idle_sum(&self) -> u64 {
        self.idle + self.iowait
    }

    /// Busy fraction since the previous call, in [0, 1].
    ///
    /// The first call after construction has no baseline and reports the
    /// busy fraction since boot.
    pub fn load(&mut self) -> f64 {
        let total = self.total();
        let idle = self.idle_sum();
        let d_total = total.saturating_sub(self.prev_total);
        let d_idle = idle.saturating_sub(self.prev_idle_sum);
        self.prev_total = total;
        self.prev_idle_sum = idle;
        if d_total == 0 {
            return 0.0;
        }
        1.0 - d_idle as f64 / d_total as f64
    }
}

#[derive(Serialize)]
struct CpuLine {
    wall: String,
    load: f64,
}

pub fn run(interval: f64, count: u64) -> Result<()> {
    let mut cpu = CpuLoad::default();
    cpu.scan()?;
    cpu.load(); // establish the baseline
    for _ in 0..count {
        std::thread::sleep(Duration::from_secs_f64(interval));
        cpu.scan()?;
        let line = CpuLine {
            wall: chrono::Utc::now().to_rfc3339(),
            load: cpu.load(),
        };
        println!("{}", serde_json::to_string(&line)?);
    }
    Ok(())
}
