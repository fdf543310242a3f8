//! Host load monitoring.
//!
//! Reads aggregate CPU and memory usage from `/proc` and decides whether
//! the host is overloaded. Readings are cached for a short interval so that
//! admission checks under load do not hammer `/proc`.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::lock;

/// Default CPU threshold in percent.
pub const DEFAULT_CPU_THRESHOLD: f64 = 80.0;

/// Default memory threshold in percent.
pub const DEFAULT_MEMORY_THRESHOLD: f64 = 85.0;

/// How long a reading stays fresh.
const CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Base throttle delay once overloaded.
const THROTTLE_BASE: Duration = Duration::from_millis(500);

/// Throttle delay cap.
const THROTTLE_CAP: Duration = Duration::from_secs(5);

/// A point-in-time load reading.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadSnapshot {
    /// Aggregate CPU usage in percent.
    pub cpu_percent: f64,

    /// Memory usage in percent.
    pub memory_percent: f64,
}

#[derive(Debug)]
struct MonitorState {
    checked_at: Option<Instant>,
    overloaded: bool,
    snapshot: LoadSnapshot,
}

/// Monitors host resources and detects overload.
#[derive(Debug)]
pub struct ResourceMonitor {
    cpu_threshold: f64,
    memory_threshold: f64,
    state: Mutex<MonitorState>,
}

impl ResourceMonitor {
    /// Create a monitor with the default thresholds.
    #[must_use]
    pub fn new() -> Self {
        Self::with_thresholds(DEFAULT_CPU_THRESHOLD, DEFAULT_MEMORY_THRESHOLD)
    }

    /// Create a monitor with explicit thresholds.
    #[must_use]
    pub fn with_thresholds(cpu_threshold: f64, memory_threshold: f64) -> Self {
        Self {
            cpu_threshold,
            memory_threshold,
            state: Mutex::new(MonitorState {
                checked_at: None,
                overloaded: false,
                snapshot: LoadSnapshot::default(),
            }),
        }
    }

    /// Whether the host is currently overloaded, with the reading that
    /// decided it. Readings are refreshed at most every few seconds.
    pub fn check_overload(&self) -> (bool, LoadSnapshot) {
        let mut state = lock(&self.state);
        let fresh = state
            .checked_at
            .is_some_and(|at| at.elapsed() < CHECK_INTERVAL);
        if !fresh {
            let snapshot = LoadSnapshot {
                cpu_percent: read_cpu_percent(),
                memory_percent: read_memory_percent(),
            };
            state.checked_at = Some(Instant::now());
            state.overloaded = snapshot.cpu_percent > self.cpu_threshold
                || snapshot.memory_percent > self.memory_threshold;
            state.snapshot = snapshot;
        }
        (state.overloaded, state.snapshot)
    }

    /// Throttle delay for the current load: zero when healthy, otherwise a
    /// base delay scaled by how far past the threshold the host is.
    #[must_use]
    pub fn throttle_delay(&self) -> Duration {
        let (overloaded, snapshot) = self.check_overload();
        if !overloaded {
            return Duration::ZERO;
        }
        let cpu_over = (snapshot.cpu_percent - self.cpu_threshold).max(0.0);
        let memory_over = (snapshot.memory_percent - self.memory_threshold).max(0.0);
        delay_for_overage(cpu_over.max(memory_over))
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Delay grows with the overage and is capped.
pub(crate) fn delay_for_overage(overage: f64) -> Duration {
    let scaled = THROTTLE_BASE.as_secs_f64() + (overage / 20.0) * 4.5;
    Duration::from_secs_f64(scaled.min(THROTTLE_CAP.as_secs_f64()))
}

/// Aggregate CPU usage from the first line of `/proc/stat`.
#[cfg(target_os = "linux")]
fn read_cpu_percent() -> f64 {
    let Ok(raw) = std::fs::read_to_string("/proc/stat") else {
        return 0.0;
    };
    let Some(line) = raw.lines().next() else {
        return 0.0;
    };
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(4)
        .filter_map(|v| v.parse().ok())
        .collect();
    let [user, nice, system, idle] = fields.as_slice() else {
        return 0.0;
    };
    let total = user + nice + system + idle;
    if total == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    {
        ((user + nice + system) as f64 / total as f64) * 100.0
    }
}

/// Memory usage from `MemTotal` and `MemAvailable` in `/proc/meminfo`.
#[cfg(target_os = "linux")]
fn read_memory_percent() -> f64 {
    let Ok(raw) = std::fs::read_to_string("/proc/meminfo") else {
        return 0.0;
    };
    let field = |name: &str| -> Option<u64> {
        raw.lines()
            .find(|line| line.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let Some(total) = field("MemTotal:") else {
        return 0.0;
    };
    let available = field("MemAvailable:").or_else(|| field("MemFree:")).unwrap_or(0);
    if total == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    {
        ((total.saturating_sub(available)) as f64 / total as f64) * 100.0
    }
}

#[cfg(not(target_os = "linux"))]
fn read_cpu_percent() -> f64 {
    0.0
}

#[cfg(not(target_os = "linux"))]
fn read_memory_percent() -> f64 {
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_scales_with_overage() {
        assert_eq!(delay_for_overage(0.0), Duration::from_millis(500));
        assert!(delay_for_overage(10.0) > delay_for_overage(1.0));
        // Capped.
        assert_eq!(delay_for_overage(1000.0), Duration::from_secs(5));
    }

    #[test]
    fn test_check_overload_returns_snapshot() {
        let monitor = ResourceMonitor::new();
        let (_, snapshot) = monitor.check_overload();
        assert!(snapshot.cpu_percent >= 0.0);
        assert!(snapshot.memory_percent >= 0.0);
        assert!(snapshot.memory_percent <= 100.0);
    }

    #[test]
    fn test_impossible_thresholds_never_overload() {
        let monitor = ResourceMonitor::with_thresholds(200.0, 200.0);
        let (overloaded, _) = monitor.check_overload();
        assert!(!overloaded);
        assert_eq!(monitor.throttle_delay(), Duration::ZERO);
    }

    #[test]
    fn test_zero_thresholds_throttle() {
        let monitor = ResourceMonitor::with_thresholds(-1.0, -1.0);
        let (overloaded, _) = monitor.check_overload();
        assert!(overloaded);
        assert!(monitor.throttle_delay() >= Duration::from_millis(500));
    }
}
