use std::time::{Duration, Instant};
use tracing::warn;

/// Process CPU usage as a percentage of the whole machine.
///
/// `instant` reports usage since the previous call; `average` is the mean of
/// every instant sample taken so far.
#[derive(Debug)]
pub struct CpuMonitor {
    last_wall: Instant,
    last_cpu: Duration,
    total: f64,
    samples: u64,
    processors: usize,
}

impl Default for CpuMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuMonitor {
    pub fn new() -> Self {
        Self {
            last_wall: Instant::now(),
            last_cpu: process_cpu_time(),
            total: 0.0,
            samples: 0,
            processors: num_cpus::get().max(1),
        }
    }

    /// Restart the measurement window.
    pub fn initialize(&mut self) {
        self.last_wall = Instant::now();
        self.last_cpu = process_cpu_time();
    }

    pub fn instant(&mut self) -> f64 {
        let now = Instant::now();
        let cpu = process_cpu_time();
        let wall = now.duration_since(self.last_wall);
        let mut percent = 0.0;
        if !wall.is_zero() && cpu >= self.last_cpu {
            percent = (cpu - self.last_cpu).as_secs_f64() / wall.as_secs_f64()
                / self.processors as f64
                * 100.0;
            self.last_wall = now;
            self.last_cpu = cpu;
        }
        self.total += percent;
        self.samples += 1;
        percent
    }

    pub fn average(&mut self) -> f64 {
        if self.samples == 0 {
            self.instant();
        }
        self.total / self.samples as f64
    }
}

/// User plus system CPU time consumed by this process.
fn process_cpu_time() -> Duration {
    // SAFETY: getrusage only writes into the zeroed struct we pass it.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) } != 0 {
        warn!(
            "getrusage failed: {}",
            std::io::Error::last_os_error()
        );
        return Duration::ZERO;
    }
    let to_duration = |tv: libc::timeval| {
        Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
    };
    to_duration(usage.ru_utime) + to_duration(usage.ru_stime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_process_reports_usage() {
        let mut monitor = CpuMonitor::new();
        monitor.initialize();
        let start = Instant::now();
        let mut acc = 0u64;
        while start.elapsed() < Duration::from_millis(50) {
            acc = std::hint::black_box(acc.wrapping_add(1));
        }
        let percent = monitor.instant();
        assert!(percent > 0.0);
        assert!(percent <= 100.0 + f64::EPSILON);
    }

    #[test]
    fn average_without_samples_takes_one() {
        let mut monitor = CpuMonitor::new();
        let average = monitor.average();
        assert!(average >= 0.0);
        assert_eq!(monitor.samples, 1);
    }
}
