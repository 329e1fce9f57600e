//! Publisher-side processing of echoed pings.
//!
//! A pong carries the send timestamp of its ping; half the round trip is
//! recorded as the one-way latency. Samples whose timestamp lies in the
//! future are counted as clock skew and discarded.

use crate::cpu::CpuMonitor;
use crate::error::PerftestError;
use crate::message::{MessageKind, TestMessage};
use crate::metrics::{LatencyStats, LatencySummary};
use crate::printer::Printer;
use crate::sync::wall_clock_usec;
use crate::transport::{MessageHandler, MessagingWriter};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

struct LatencyState {
    stats: LatencyStats,
    last_data_length: Option<i32>,
    summaries: Vec<LatencySummary>,
    cpu: CpuMonitor,
    /// Pongs received over the whole run.
    total_pongs: u64,
}

pub struct LatencyListener {
    /// Writer whose ping wait is released on every pong, in latency-test mode.
    ping_writer: Option<Arc<dyn MessagingWriter>>,
    printer: Printer,
    latency_file: Option<PathBuf>,
    state: Mutex<LatencyState>,
}

impl LatencyListener {
    /// `history_capacity` bounds the pongs of one size epoch; the buffer is
    /// allocated here, once.
    pub fn new(
        history_capacity: usize,
        ping_writer: Option<Arc<dyn MessagingWriter>>,
        printer: Printer,
        latency_file: Option<PathBuf>,
    ) -> Result<Self, PerftestError> {
        let stats = LatencyStats::with_capacity(history_capacity).map_err(|e| {
            error!("{}", e);
            e
        })?;
        Ok(Self {
            ping_writer,
            printer,
            latency_file,
            state: Mutex::new(LatencyState {
                stats,
                last_data_length: None,
                summaries: Vec::new(),
                cpu: CpuMonitor::new(),
                total_pongs: 0,
            }),
        })
    }

    /// Clock-skew count and sample count of the current epoch.
    pub fn epoch_counts(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.stats.count(), state.stats.clock_skew_count())
    }

    /// Run a closure against the running statistics.
    pub fn with_stats<R>(&self, f: impl FnOnce(&LatencyStats) -> R) -> R {
        f(&self.state.lock().stats)
    }

    pub fn total_pongs(&self) -> u64 {
        self.state.lock().total_pongs
    }

    pub fn summaries(&self) -> Vec<LatencySummary> {
        self.state.lock().summaries.clone()
    }

    pub fn initialize_cpu(&self) {
        self.state.lock().cpu.initialize();
    }

    /// Summarize the current epoch, print it and reset the statistics.
    ///
    /// With `end_test`, an empty epoch is reported as a warning.
    pub fn print_summary(&self, end_test: bool) -> Option<LatencySummary> {
        let mut state = self.state.lock();
        self.summarize_locked(&mut state, end_test)
    }

    fn summarize_locked(&self, state: &mut LatencyState, end_test: bool) -> Option<LatencySummary> {
        if state.stats.count() == 0 {
            if end_test {
                warn!(
                    "No pong samples were received. Check that the subscribers are running, \
                     that only one publisher uses id 0 and that pings can reach this host."
                );
            }
            return None;
        }
        if state.stats.clock_skew_count() > 0 {
            warn!(
                "{} latency samples were discarded because of clock skew between hosts",
                state.stats.clock_skew_count()
            );
        }
        let payload_size = state.last_data_length.unwrap_or(0);
        if let Some(path) = &self.latency_file {
            if let Err(e) = append_history(path, payload_size, state.stats.history()) {
                error!("Failed to write latency samples to {}: {:#}", path.display(), e);
            }
        }
        let cpu = self.printer.show_cpu.then(|| state.cpu.average());
        let summary = state.stats.summarize(payload_size, cpu)?;
        self.printer.latency_summary(&summary);
        state.summaries.push(summary.clone());
        state.stats.reset();
        Some(summary)
    }

    fn notify(&self) {
        if let Some(writer) = &self.ping_writer {
            writer.notify_ping_response();
        }
    }
}

/// Append one epoch of raw samples to the latency CSV file.
fn append_history(path: &Path, payload_size: i32, history: &[u64]) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut out = BufWriter::new(file);
    writeln!(
        out,
        "Data length, {}",
        payload_size + crate::message::OVERHEAD_BYTES
    )?;
    writeln!(out, "Sample Number, Value")?;
    for (index, value) in history.iter().enumerate() {
        writeln!(out, "{}, {}", index, value)?;
    }
    out.flush()?;
    info!("Wrote {} latency samples to {}", history.len(), path.display());
    Ok(())
}

impl MessageHandler for LatencyListener {
    fn process_message(&self, message: &TestMessage) {
        let now = wall_clock_usec();
        let size = match message.kind() {
            MessageKind::Initialize | MessageKind::Finished => return,
            MessageKind::LengthChanged => {
                self.print_summary(false);
                return;
            }
            MessageKind::Data(size) => size,
        };

        {
            let mut state = self.state.lock();
            state.total_pongs += 1;

            if state.last_data_length != Some(size) {
                state.stats.reset();
                state.last_data_length = Some(size);
                self.printer.new_data_length(message.wire_size() as i32);
            }

            let sent = message.timestamp();
            if now < sent {
                state.stats.record_clock_skew();
                warn!(
                    "Clock skew: pong {} stamped {} us in the future",
                    message.seq_num,
                    sent - now
                );
            } else {
                let latency = (now - sent) / 2;
                match state.stats.record(latency) {
                    Ok(()) => {
                        if self.printer.print_intervals {
                            let cpu = self.printer.show_cpu.then(|| state.cpu.instant());
                            self.printer.latency_interval(&state.stats.interval(latency, cpu));
                        }
                    }
                    Err(e) => error!("Latency sample dropped: {}", e),
                }
            }
        }

        self.notify();
    }
}
