//! # Statistics Engine
//!
//! Running latency statistics with a full sample history for exact
//! percentiles, and the throughput arithmetic shared by interval and summary
//! records.
//!
//! Latency values are microseconds throughout.

use crate::error::PerftestError;
use crate::message::OVERHEAD_BYTES;
use serde::{Deserialize, Serialize};

/// Percentile `numerator / denominator` of a sorted history of `count`
/// samples, as an index: `floor(count * p)`.
pub fn percentile_index(count: usize, numerator: u64, denominator: u64) -> usize {
    ((count as u128 * numerator as u128) / denominator as u128) as usize
}

/// The five percentiles reported in a latency summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub p99_99: u64,
    pub p99_9999: u64,
}

impl LatencyPercentiles {
    /// Read the percentiles off an ascending history.
    pub fn from_sorted(sorted: &[u64]) -> Option<Self> {
        if sorted.is_empty() {
            return None;
        }
        let at = |numerator, denominator| {
            sorted[percentile_index(sorted.len(), numerator, denominator).min(sorted.len() - 1)]
        };
        Some(Self {
            p50: at(50, 100),
            p90: at(90, 100),
            p99: at(99, 100),
            p99_99: at(9_999, 10_000),
            p99_9999: at(999_999, 1_000_000),
        })
    }
}

/// One latency summary record, produced per data length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    /// Payload length plus overhead.
    pub data_length: i32,
    pub count: u64,
    pub ave_us: f64,
    pub std_us: f64,
    pub min_us: u64,
    pub max_us: u64,
    pub percentiles: LatencyPercentiles,
    pub clock_skew_count: u64,
    pub cpu_percent: Option<f64>,
}

/// One latency interval record, printed for every pong received.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyInterval {
    pub latency_us: u64,
    pub ave_us: f64,
    pub std_us: f64,
    pub min_us: u64,
    pub max_us: u64,
    pub cpu_percent: Option<f64>,
}

/// Running latency statistics for one size epoch plus the sample history.
///
/// The history is allocated once, up front, and never grows: recording more
/// samples than it was sized for is an error.
#[derive(Debug)]
pub struct LatencyStats {
    sum: u64,
    sum_square: u128,
    count: u64,
    min: Option<u64>,
    max: u64,
    clock_skew_count: u64,
    history: Vec<u64>,
    capacity: usize,
}

impl LatencyStats {
    pub fn with_capacity(capacity: usize) -> Result<Self, PerftestError> {
        let mut history = Vec::new();
        history
            .try_reserve_exact(capacity)
            .map_err(|_| PerftestError::LatencyHistoryAllocation {
                requested: capacity,
            })?;
        Ok(Self {
            sum: 0,
            sum_square: 0,
            count: 0,
            min: None,
            max: 0,
            clock_skew_count: 0,
            history,
            capacity,
        })
    }

    /// Clear running statistics and the history for a new epoch.
    pub fn reset(&mut self) {
        self.sum = 0;
        self.sum_square = 0;
        self.count = 0;
        self.min = None;
        self.max = 0;
        self.clock_skew_count = 0;
        self.history.clear();
    }

    /// Record a one-way latency sample.
    pub fn record(&mut self, latency_us: u64) -> Result<(), PerftestError> {
        if self.history.len() >= self.capacity {
            return Err(PerftestError::LatencyHistoryOverflow {
                capacity: self.capacity,
            });
        }
        self.history.push(latency_us);
        self.min = Some(self.min.map_or(latency_us, |min| min.min(latency_us)));
        self.max = self.max.max(latency_us);
        self.count += 1;
        self.sum += latency_us;
        self.sum_square += latency_us as u128 * latency_us as u128;
        Ok(())
    }

    pub fn record_clock_skew(&mut self) {
        self.clock_skew_count += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> u64 {
        self.sum
    }

    pub fn min(&self) -> Option<u64> {
        self.min
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn clock_skew_count(&self) -> u64 {
        self.clock_skew_count
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples recorded in this epoch, in arrival order until the next
    /// summary sorts them.
    pub fn history(&self) -> &[u64] {
        &self.history
    }

    pub fn average(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum as f64 / self.count as f64
    }

    /// `sqrt(sum_sq / count - ave^2)`, clamped at zero against rounding.
    pub fn std_dev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let ave = self.average();
        let variance = self.sum_square as f64 / self.count as f64 - ave * ave;
        variance.max(0.0).sqrt()
    }

    pub fn interval(&self, latency_us: u64, cpu_percent: Option<f64>) -> LatencyInterval {
        LatencyInterval {
            latency_us,
            ave_us: self.average(),
            std_us: self.std_dev(),
            min_us: self.min.unwrap_or(0),
            max_us: self.max,
            cpu_percent,
        }
    }

    /// Sort the history and build the summary for payload size
    /// `payload_size`. Returns `None` when no samples were recorded.
    pub fn summarize(&mut self, payload_size: i32, cpu_percent: Option<f64>) -> Option<LatencySummary> {
        if self.count == 0 {
            return None;
        }
        self.history.sort_unstable();
        let percentiles = LatencyPercentiles::from_sorted(&self.history)?;
        Some(LatencySummary {
            data_length: payload_size + OVERHEAD_BYTES,
            count: self.count,
            ave_us: self.average(),
            std_us: self.std_dev(),
            min_us: self.min.unwrap_or(0),
            max_us: self.max,
            percentiles,
            clock_skew_count: self.clock_skew_count,
            cpu_percent,
        })
    }
}

/// One throughput summary record, produced per data length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSummary {
    /// Payload length plus overhead.
    pub data_length: i32,
    pub packets: u64,
    pub packets_per_sec: u64,
    pub mbps: f64,
    pub lost: u64,
    pub lost_percent: f64,
    pub cpu_percent: Option<f64>,
}

impl ThroughputSummary {
    pub fn new(
        payload_size: i32,
        packets: u64,
        bytes: u64,
        lost: u64,
        elapsed_us: u64,
        cpu_percent: Option<f64>,
    ) -> Self {
        let elapsed_us = elapsed_us.max(1);
        Self {
            data_length: payload_size + OVERHEAD_BYTES,
            packets,
            packets_per_sec: packets * 1_000_000 / elapsed_us,
            mbps: bytes as f64 * 1_000_000.0 / elapsed_us as f64 * 8.0 / 1_000_000.0,
            lost,
            lost_percent: loss_percent(packets, lost),
            cpu_percent,
        }
    }
}

/// One throughput interval record from the subscriber monitoring loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputInterval {
    pub packets: u64,
    pub packets_per_sec: u64,
    pub packets_per_sec_ave: f64,
    pub mbps: f64,
    pub mbps_ave: f64,
    pub lost: u64,
    pub lost_percent: f64,
    pub cpu_percent: Option<f64>,
}

/// `lost * 100 / (received + lost)`, zero when nothing was expected.
pub fn loss_percent(received: u64, lost: u64) -> f64 {
    let expected = received + lost;
    if expected == 0 {
        return 0.0;
    }
    lost as f64 * 100.0 / expected as f64
}

/// Counters observed from a throughput listener at one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThroughputCounters {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub missing_packets: u64,
    pub last_data_length: Option<i32>,
}

/// Turns successive counter polls into interval records with running
/// averages. Averages restart whenever the data length changes.
#[derive(Debug, Default)]
pub struct IntervalTracker {
    last_data_length: Option<i32>,
    prev_packets: u64,
    prev_bytes: u64,
    samples: u64,
    packets_per_sec_ave: f64,
    bytes_per_sec_ave: f64,
}

impl IntervalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one poll taken `elapsed_us` after the previous one.
    ///
    /// Returns `None` for the poll that observes a new data length and for
    /// polls before any sample arrived.
    pub fn observe(
        &mut self,
        counters: ThroughputCounters,
        elapsed_us: u64,
    ) -> Option<ThroughputInterval> {
        if self.last_data_length != counters.last_data_length {
            self.last_data_length = counters.last_data_length;
            self.prev_packets = counters.packets_received;
            self.prev_bytes = counters.bytes_received;
            self.samples = 0;
            self.packets_per_sec_ave = 0.0;
            self.bytes_per_sec_ave = 0.0;
            return None;
        }
        let elapsed_us = elapsed_us.max(1);
        let packets = counters.packets_received.saturating_sub(self.prev_packets);
        let bytes = counters.bytes_received.saturating_sub(self.prev_bytes);
        self.prev_packets = counters.packets_received;
        self.prev_bytes = counters.bytes_received;

        let packets_per_sec = packets * 1_000_000 / elapsed_us;
        let bytes_per_sec = bytes * 1_000_000 / elapsed_us;
        self.samples += 1;
        self.packets_per_sec_ave +=
            (packets_per_sec as f64 - self.packets_per_sec_ave) / self.samples as f64;
        self.bytes_per_sec_ave +=
            (bytes_per_sec as f64 - self.bytes_per_sec_ave) / self.samples as f64;

        if counters.packets_received == 0 {
            return None;
        }
        Some(ThroughputInterval {
            packets: counters.packets_received,
            packets_per_sec,
            packets_per_sec_ave: self.packets_per_sec_ave,
            mbps: bytes_per_sec as f64 * 8.0 / 1_000_000.0,
            mbps_ave: self.bytes_per_sec_ave * 8.0 / 1_000_000.0,
            lost: counters.missing_packets,
            lost_percent: loss_percent(counters.packets_received, counters.missing_packets),
            cpu_percent: None,
        })
    }
}
