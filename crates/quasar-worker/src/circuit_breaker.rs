use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quasar_common::GpuStatus;
use tokio_util::sync::CancellationToken;

use crate::gpu::read_gpu_statuses;

pub const CIRCUIT_BREAKER_OPEN_MESSAGE: &str =
    "Circuit breaker is open, please check your memory and disk usage!";

/// Usage in basis points (1/100 of a percent) so it fits an atomic.
fn basis_points(used: u64, total: u64) -> u64 {
    if total == 0 {
        0
    } else {
        used.saturating_mul(10_000) / total
    }
}

/// Memory pressure breaker consulted before every model load.
///
/// A sampler task stores the latest usage; readers compare it against the
/// thresholds without taking a lock.
#[derive(Debug)]
pub struct CircuitBreaker {
    memory_threshold_bp: u64,
    gpu_threshold_bp: Option<u64>,
    memory_bp: AtomicU64,
    gpu_bp: AtomicU64,
}

impl CircuitBreaker {
    /// Thresholds are percentages. `gpu_threshold_percent = None` ignores GPU
    /// memory.
    pub fn new(memory_threshold_percent: f64, gpu_threshold_percent: Option<f64>) -> Self {
        let to_bp = |p: f64| (p.clamp(0.0, 100.0) * 100.0).round() as u64;
        Self {
            memory_threshold_bp: to_bp(memory_threshold_percent),
            gpu_threshold_bp: gpu_threshold_percent.map(to_bp),
            memory_bp: AtomicU64::new(0),
            gpu_bp: AtomicU64::new(0),
        }
    }

    pub fn record_memory(&self, used_bytes: u64, total_bytes: u64) {
        self.memory_bp
            .store(basis_points(used_bytes, total_bytes), Ordering::Relaxed);
    }

    /// Track the fullest GPU.
    pub fn record_gpus(&self, gpus: &[GpuStatus]) {
        let worst = gpus
            .iter()
            .map(|g| basis_points(g.memory_used_mb, g.memory_total_mb))
            .max()
            .unwrap_or(0);
        self.gpu_bp.store(worst, Ordering::Relaxed);
    }

    /// Reason the breaker is open, if it is.
    pub fn open_reason(&self) -> Option<String> {
        let memory = self.memory_bp.load(Ordering::Relaxed);
        if memory >= self.memory_threshold_bp {
            return Some(format!(
                "{CIRCUIT_BREAKER_OPEN_MESSAGE} memory usage {:.2}% >= {:.2}%",
                memory as f64 / 100.0,
                self.memory_threshold_bp as f64 / 100.0
            ));
        }
        if let Some(threshold) = self.gpu_threshold_bp {
            let gpu = self.gpu_bp.load(Ordering::Relaxed);
            if gpu >= threshold {
                return Some(format!(
                    "{CIRCUIT_BREAKER_OPEN_MESSAGE} gpu memory usage {:.2}% >= {:.2}%",
                    gpu as f64 / 100.0,
                    threshold as f64 / 100.0
                ));
            }
        }
        None
    }

    pub fn is_open(&self) -> bool {
        self.open_reason().is_some()
    }

    pub fn memory_usage_percent(&self) -> f64 {
        self.memory_bp.load(Ordering::Relaxed) as f64 / 100.0
    }
}

/// `(used, total)` bytes from `/proc/meminfo`.
pub async fn read_memory_usage() -> Option<(u64, u64)> {
    let raw = tokio::fs::read_to_string("/proc/meminfo").await.ok()?;
    parse_meminfo(&raw)
}

fn parse_meminfo(raw: &str) -> Option<(u64, u64)> {
    let field = |name: &str| {
        raw.lines()
            .find_map(|l| l.strip_prefix(name))
            .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
            .map(|kb| kb * 1024)
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    Some((total.saturating_sub(available), total))
}

/// Sample host memory and GPUs into `breaker` until cancelled.
pub async fn sample_loop(
    breaker: Arc<CircuitBreaker>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if let Some((used, total)) = read_memory_usage().await {
            breaker.record_memory(used, total);
        }
        breaker.record_gpus(&read_gpu_statuses().await);
        if let Some(reason) = breaker.open_reason() {
            tracing::warn!(%reason, "circuit breaker open");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_threshold() {
        let breaker = CircuitBreaker::new(85.0, None);
        breaker.record_memory(50, 100);
        assert!(!breaker.is_open());

        breaker.record_memory(90, 100);
        let reason = breaker.open_reason().unwrap();
        assert!(reason.starts_with(CIRCUIT_BREAKER_OPEN_MESSAGE));
        assert_eq!(breaker.memory_usage_percent(), 90.0);
    }

    #[test]
    fn test_gpu_threshold_optional() {
        let full_gpu = [GpuStatus {
            index: 0,
            memory_total_mb: 100,
            memory_used_mb: 99,
        }];

        let ignores_gpu = CircuitBreaker::new(85.0, None);
        ignores_gpu.record_gpus(&full_gpu);
        assert!(!ignores_gpu.is_open());

        let watches_gpu = CircuitBreaker::new(85.0, Some(95.0));
        watches_gpu.record_gpus(&full_gpu);
        assert!(watches_gpu.open_reason().unwrap().contains("gpu memory"));
    }

    #[test]
    fn test_parse_meminfo() {
        let raw = "MemTotal:       16000 kB\nMemFree:         1000 kB\nMemAvailable:    4000 kB\n";
        assert_eq!(parse_meminfo(raw), Some((12_000 * 1024, 16_000 * 1024)));
        assert_eq!(parse_meminfo("MemTotal: 1 kB\n"), None);
    }
}
