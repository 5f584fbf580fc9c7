//! Resource pressure sampling and adaptive batch sizing.

use parking_lot::Mutex;

use crate::config::SchedulerConfig;

/// Source of a utilization signal in `[0, 1]`.
pub trait ResourceMonitor: Send + Sync {
    fn sample(&self) -> f64;
}

/// Host CPU and memory utilization via `sysinfo`. Pressure is the larger of the two.
pub struct SystemMonitor {
    sys: Mutex<sysinfo::System>,
}

impl SystemMonitor {
    pub fn new() -> Self {
        let mut sys = sysinfo::System::new();
        // First CPU reading is always zero; prime it.
        sys.refresh_cpu_usage();
        Self {
            sys: Mutex::new(sys),
        }
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceMonitor for SystemMonitor {
    fn sample(&self) -> f64 {
        let mut sys = self.sys.lock();
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        let cpu = f64::from(sys.global_cpu_usage()) / 100.0;
        let mem = match sys.total_memory() {
            0 => 0.0,
            total => sys.used_memory() as f64 / total as f64,
        };
        cpu.max(mem).clamp(0.0, 1.0)
    }
}

/// Monitor returning a settable value. Used by tests and by callers that feed in
/// utilization from elsewhere.
#[derive(Default)]
pub struct FixedMonitor {
    value: Mutex<f64>,
}

impl FixedMonitor {
    pub fn new(value: f64) -> Self {
        Self {
            value: Mutex::new(value),
        }
    }

    pub fn set(&self, value: f64) {
        *self.value.lock() = value;
    }
}

impl ResourceMonitor for FixedMonitor {
    fn sample(&self) -> f64 {
        *self.value.lock()
    }
}

/// Scales the drain batch between `min_batch` and `max_batch` from observed pressure.
///
/// At or above the high mark the batch drops straight to `min_batch`; at or below
/// the low mark it doubles each cycle until `max_batch`; in between it follows a
/// straight line from `max_batch` (low mark) to `min_batch` (high mark).
#[derive(Debug, Clone)]
pub struct BatchSizer {
    min: usize,
    max: usize,
    high: f64,
    low: f64,
    current: usize,
}

impl BatchSizer {
    pub fn new(config: &SchedulerConfig) -> Self {
        let min = config.min_batch.max(1);
        let max = config.max_batch.max(min);
        Self {
            min,
            max,
            high: config.high_pressure,
            low: config.low_pressure.min(config.high_pressure),
            current: min,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn next(&mut self, pressure: f64) -> usize {
        // An unreadable signal counts as saturated.
        let p = if pressure.is_nan() { 1.0 } else { pressure.clamp(0.0, 1.0) };
        self.current = if p >= self.high {
            self.min
        } else if p <= self.low {
            self.current.saturating_mul(2).clamp(self.min, self.max)
        } else {
            let t = (self.high - p) / (self.high - self.low);
            let span = (self.max - self.min) as f64;
            self.min + (t * span).round() as usize
        };
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizer() -> BatchSizer {
        BatchSizer::new(&SchedulerConfig {
            min_batch: 2,
            max_batch: 32,
            ..SchedulerConfig::default()
        })
    }

    #[test]
    fn high_pressure_shrinks_to_min() {
        let mut s = sizer();
        for _ in 0..10 {
            s.next(0.0);
        }
        assert_eq!(s.current(), 32);
        assert_eq!(s.next(0.85), 2);
        assert_eq!(s.next(f64::NAN), 2);
    }

    #[test]
    fn idle_grows_to_max() {
        let mut s = sizer();
        let sizes: Vec<usize> = (0..6).map(|_| s.next(0.1)).collect();
        assert_eq!(sizes, vec![4, 8, 16, 32, 32, 32]);
    }

    #[test]
    fn middle_interpolates() {
        let mut s = sizer();
        // halfway between 0.3 and 0.8
        assert_eq!(s.next(0.55), 17);
    }

    #[test]
    fn fixed_monitor_is_settable() {
        let m = FixedMonitor::new(0.2);
        assert_eq!(m.sample(), 0.2);
        m.set(0.9);
        assert_eq!(m.sample(), 0.9);
    }
}
