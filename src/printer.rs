//! Legacy text records on stdout.
//!
//! Measurement records go to stdout so they can be piped and parsed; every
//! diagnostic goes through `tracing` to stderr.

use crate::metrics::{LatencyInterval, LatencySummary, ThroughputInterval, ThroughputSummary};
use std::io::{self, Write};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Printer {
    pub print_intervals: bool,
    pub show_cpu: bool,
}

impl Default for Printer {
    fn default() -> Self {
        Self {
            print_intervals: true,
            show_cpu: false,
        }
    }
}

fn cpu_suffix(cpu_percent: Option<f64>) -> String {
    cpu_percent
        .map(|cpu| format!(" CPU: {:.2}%", cpu))
        .unwrap_or_default()
}

fn write_line(out: &mut impl Write, line: &str) -> io::Result<()> {
    writeln!(out, "{}", line)?;
    out.flush()
}

/// Measurement output keeps going when stdout is gone (for example a closed
/// pipe); the failure is only logged.
fn emit(line: String) {
    let stdout = io::stdout();
    if let Err(e) = write_line(&mut stdout.lock(), &line) {
        debug!("Failed to write measurement record: {}", e);
    }
}

impl Printer {
    pub fn new(print_intervals: bool, show_cpu: bool) -> Self {
        Self {
            print_intervals,
            show_cpu,
        }
    }

    pub fn format_new_data_length(data_length: i32) -> String {
        format!("\n\n********** New data length is {}", data_length)
    }

    pub fn format_throughput_interval(interval: &ThroughputInterval) -> String {
        format!(
            "Packets: {:>8}  Packets/s: {:>7}  Packets/s(ave): {:>7.0}  Mbps: {:>7.1}  Mbps(ave): {:>7.1}  Lost: {:>5} ({:.2}%){}",
            interval.packets,
            interval.packets_per_sec,
            interval.packets_per_sec_ave,
            interval.mbps,
            interval.mbps_ave,
            interval.lost,
            interval.lost_percent,
            cpu_suffix(interval.cpu_percent),
        )
    }

    pub fn format_throughput_summary(summary: &ThroughputSummary) -> String {
        format!(
            "Length: {:>5}  Packets: {:>8}  Packets/s(ave): {:>7}  Mbps(ave): {:>7.1}  Lost: {:>5} ({:.2}%){}",
            summary.data_length,
            summary.packets,
            summary.packets_per_sec,
            summary.mbps,
            summary.lost,
            summary.lost_percent,
            cpu_suffix(summary.cpu_percent),
        )
    }

    pub fn format_latency_interval(interval: &LatencyInterval) -> String {
        format!(
            "One way Latency: {:>6} us  Ave {:>6.0} us  Std {:>6.1} us  Min {:>6} us  Max {:>6}{}",
            interval.latency_us,
            interval.ave_us,
            interval.std_us,
            interval.min_us,
            interval.max_us,
            cpu_suffix(interval.cpu_percent),
        )
    }

    pub fn format_latency_summary(summary: &LatencySummary) -> String {
        let p = &summary.percentiles;
        format!(
            "Length: {:>5}  Latency: Ave {:>6.0} us  Std {:>6.1} us  Min {:>6} us  Max {:>6} us  50% {:>6} us  90% {:>6} us  99% {:>6} us  99.99% {:>6} us  99.9999% {:>6} us{}",
            summary.data_length,
            summary.ave_us,
            summary.std_us,
            summary.min_us,
            summary.max_us,
            p.p50,
            p.p90,
            p.p99,
            p.p99_99,
            p.p99_9999,
            cpu_suffix(summary.cpu_percent),
        )
    }

    /// Printed by the throughput and latency listeners when a new size epoch
    /// starts, if intervals are enabled.
    pub fn new_data_length(&self, data_length: i32) {
        if self.print_intervals {
            emit(Self::format_new_data_length(data_length));
        }
    }

    pub fn throughput_interval(&self, interval: &ThroughputInterval) {
        if self.print_intervals {
            emit(Self::format_throughput_interval(interval));
        }
    }

    pub fn throughput_summary(&self, summary: &ThroughputSummary) {
        emit(Self::format_throughput_summary(summary));
    }

    pub fn latency_interval(&self, interval: &LatencyInterval) {
        if self.print_intervals {
            emit(Self::format_latency_interval(interval));
        }
    }

    pub fn latency_summary(&self, summary: &LatencySummary) {
        emit(Self::format_latency_summary(summary));
    }

    /// Rough average latency from a low-resolution clock.
    pub fn average_latency_estimate(&self, micros: u64) {
        emit(format!("Average Latency time = {} (us)", micros));
    }

    pub fn pulled_samples(&self, count: u64) {
        emit(format!("Pulled samples: {:>7}", count));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::LatencyPercentiles;

    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_errors_are_reported() {
        let mut out = Vec::new();
        write_line(&mut out, "Length: 100").unwrap();
        assert_eq!(out, b"Length: 100\n");

        let err = write_line(&mut ClosedPipe, "Length: 100").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn throughput_summary_line() {
        let line = Printer::format_throughput_summary(&ThroughputSummary {
            data_length: 100,
            packets: 1000,
            packets_per_sec: 500,
            mbps: 0.4,
            lost: 2,
            lost_percent: 0.2,
            cpu_percent: Some(12.5),
        });
        assert_eq!(
            line,
            "Length:   100  Packets:     1000  Packets/s(ave):     500  Mbps(ave):     0.4  Lost:     2 (0.20%) CPU: 12.50%"
        );
    }

    #[test]
    fn latency_summary_lists_all_percentiles() {
        let line = Printer::format_latency_summary(&LatencySummary {
            data_length: 100,
            count: 4,
            ave_us: 25.0,
            std_us: 11.2,
            min_us: 10,
            max_us: 40,
            percentiles: LatencyPercentiles {
                p50: 30,
                p90: 40,
                p99: 40,
                p99_99: 40,
                p99_9999: 40,
            },
            clock_skew_count: 0,
            cpu_percent: None,
        });
        assert!(line.starts_with("Length:   100  Latency: Ave     25 us"));
        assert!(line.contains("50%     30 us"));
        assert!(line.contains("99.9999%     40 us"));
        assert!(!line.contains("CPU"));
    }
}
