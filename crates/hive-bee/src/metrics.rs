//! Node metrics and the spike-driven heartbeat schedule.
//!
//! A heartbeat goes out when the interval has elapsed, or early when the
//! metrics moved by more than the spike threshold:
//!
//! ```text
//! ram_delta = |ram_now - ram_last| / ram_last
//! cpu_delta = |cpu_now - cpu_last| / 100
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

/// Metrics reported in handshakes and heartbeats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetrics {
    /// Free accelerator memory, MB
    pub vram_free: f64,
    /// Available RAM, MB
    pub ram_free: f64,
    /// CPU idle percentage, 0-100
    pub cpu_idle: f64,
    /// Network jitter, ms
    pub jitter: f64,
}

/// Source of metric samples.
pub trait MetricsSource: Send + Sync {
    fn sample(&self) -> NodeMetrics;
}

/// Samples RAM and CPU from procfs; VRAM is a configured figure.
///
/// Off Linux, RAM and CPU read as zero.
pub struct ProcMetrics {
    vram_free_mb: f64,
    /// Last `(idle, total)` jiffies from `/proc/stat`
    last_cpu: Mutex<Option<(u64, u64)>>,
}

impl ProcMetrics {
    pub fn new(vram_free_mb: f64) -> Self {
        Self {
            vram_free_mb,
            last_cpu: Mutex::new(None),
        }
    }

    fn ram_free_mb() -> f64 {
        std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|text| parse_meminfo_available_kb(&text))
            .map(|kb| kb as f64 / 1024.0)
            .unwrap_or(0.0)
    }

    fn cpu_idle(&self) -> f64 {
        let Some(now) = std::fs::read_to_string("/proc/stat")
            .ok()
            .and_then(|text| parse_stat_cpu(&text))
        else {
            return 0.0;
        };
        let mut last = self.last_cpu.lock();
        let idle = match *last {
            Some(prev) => idle_percent(prev, now),
            None => idle_percent((0, 0), now),
        };
        *last = Some(now);
        idle
    }
}

impl MetricsSource for ProcMetrics {
    fn sample(&self) -> NodeMetrics {
        NodeMetrics {
            vram_free: self.vram_free_mb,
            ram_free: Self::ram_free_mb(),
            cpu_idle: self.cpu_idle(),
            jitter: 0.0,
        }
    }
}

fn parse_meminfo_available_kb(text: &str) -> Option<u64> {
    text.lines()
        .find_map(|line| line.strip_prefix("MemAvailable:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

/// `(idle, total)` jiffies from the aggregate `cpu` line.
fn parse_stat_cpu(text: &str) -> Option<(u64, u64)> {
    let line = text.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some((idle, fields.iter().sum()))
}

fn idle_percent(prev: (u64, u64), now: (u64, u64)) -> f64 {
    let total = now.1.saturating_sub(prev.1);
    if total == 0 {
        return 100.0;
    }
    let idle = now.0.saturating_sub(prev.0);
    (idle as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

/// Decides when a heartbeat is due.
pub struct SpikeMonitor {
    source: Arc<dyn MetricsSource>,
    interval: Duration,
    threshold: f64,
    last_metrics: NodeMetrics,
    last_sent: Option<Instant>,
}

impl SpikeMonitor {
    pub fn new(source: Arc<dyn MetricsSource>, interval: Duration, threshold: f64) -> Self {
        let last_metrics = source.sample();
        Self {
            source,
            interval,
            threshold,
            last_metrics,
            last_sent: None,
        }
    }

    /// Sample for the handshake; counts as a send.
    pub fn handshake_metrics(&mut self) -> NodeMetrics {
        let metrics = self.source.sample();
        self.record(metrics, Instant::now());
        metrics
    }

    /// Metrics to send if a heartbeat is due now.
    pub fn should_pulse(&mut self) -> Option<NodeMetrics> {
        let metrics = self.source.sample();
        self.should_pulse_with(metrics, Instant::now())
    }

    /// [`SpikeMonitor::should_pulse`] for a given sample and time.
    pub fn should_pulse_with(&mut self, metrics: NodeMetrics, now: Instant) -> Option<NodeMetrics> {
        let overdue = match self.last_sent {
            Some(at) => now.saturating_duration_since(at) > self.interval,
            None => true,
        };
        if overdue {
            self.record(metrics, now);
            return Some(metrics);
        }

        let last = self.last_metrics;
        let base = if last.ram_free == 0.0 { 1.0 } else { last.ram_free };
        let ram_delta = (metrics.ram_free - last.ram_free).abs() / base;
        let cpu_delta = (metrics.cpu_idle - last.cpu_idle).abs() / 100.0;

        if ram_delta > self.threshold || cpu_delta > self.threshold {
            debug!(ram_delta, cpu_delta, "Metrics spike");
            self.record(metrics, now);
            return Some(metrics);
        }
        None
    }

    fn record(&mut self, metrics: NodeMetrics, now: Instant) {
        self.last_metrics = metrics;
        self.last_sent = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(NodeMetrics);

    impl MetricsSource for Fixed {
        fn sample(&self) -> NodeMetrics {
            self.0
        }
    }

    fn metrics(ram: f64, cpu: f64) -> NodeMetrics {
        NodeMetrics {
            vram_free: 8000.0,
            ram_free: ram,
            cpu_idle: cpu,
            jitter: 0.0,
        }
    }

    fn monitor() -> SpikeMonitor {
        SpikeMonitor::new(
            Arc::new(Fixed(metrics(1000.0, 50.0))),
            Duration::from_secs(60),
            0.05,
        )
    }

    #[test]
    fn first_check_is_due() {
        let mut m = monitor();
        assert!(m.should_pulse_with(metrics(1000.0, 50.0), Instant::now()).is_some());
    }

    #[test]
    fn quiet_metrics_wait_for_interval() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.should_pulse_with(metrics(1000.0, 50.0), t0);

        assert!(m.should_pulse_with(metrics(1010.0, 52.0), t0 + Duration::from_secs(10)).is_none());
        assert!(m.should_pulse_with(metrics(1010.0, 52.0), t0 + Duration::from_secs(61)).is_some());
    }

    #[test]
    fn ram_spike_forces_heartbeat() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.should_pulse_with(metrics(1000.0, 50.0), t0);
        // 6% drop
        assert!(m.should_pulse_with(metrics(940.0, 50.0), t0 + Duration::from_secs(1)).is_some());
    }

    #[test]
    fn cpu_spike_forces_heartbeat() {
        let mut m = monitor();
        let t0 = Instant::now();
        m.should_pulse_with(metrics(1000.0, 50.0), t0);
        assert!(m.should_pulse_with(metrics(1000.0, 44.0), t0 + Duration::from_secs(1)).is_some());
    }

    #[test]
    fn handshake_counts_as_send() {
        let mut m = monitor();
        m.handshake_metrics();
        assert!(m.should_pulse().is_none());
    }

    #[test]
    fn parses_procfs() {
        let meminfo = "MemTotal:       16000000 kB\nMemFree:  100 kB\nMemAvailable:    2048000 kB\n";
        assert_eq!(parse_meminfo_available_kb(meminfo), Some(2_048_000));

        let stat = "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 1 2 3 4\n";
        assert_eq!(parse_stat_cpu(stat), Some((800, 1000)));
        assert_eq!(idle_percent((800, 1000), (1600, 2000)), 80.0);
        assert_eq!(idle_percent((5, 5), (5, 5)), 100.0);
    }
}
