//! Run configuration.
//!
//! [`TestConfig`] is the validated, immutable form of the command line. All
//! startup checks live in [`TestConfig::validate`] so that embedding code
//! building a config by hand goes through the same rules as the CLI.

use crate::cli::{Args, PubRate, Transport};
use crate::defaults;
use crate::error::PerftestError;
use crate::message::{is_sentinel_size, MAX_CFT_VALUE, OVERHEAD_BYTES};
use crate::pacing::{Pacer, PacingMethod};
use crate::printer::Printer;
use crate::sync::calibrate_spins_per_usec;
use crate::transport::{tcp, ContentFilter, Role, TransportConfig};
use crate::utils::format_bytes;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Largest sample handled without fragmentation.
pub const MAX_SYNCHRONOUS_SIZE: u64 = 63_000;

/// Largest sample size the harness accepts.
pub const MAX_PERFTEST_SAMPLE_SIZE: u64 = 2_147_482_620;

/// How the publisher delays between samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingConfig {
    Unpaced,
    Fixed { spin: u64, sleep: Duration },
    Rate(PubRate),
}

impl PacingConfig {
    /// Build the pacer, calibrating the spin loop when a spin rate is asked for.
    pub fn pacer(&self) -> Result<Pacer, PerftestError> {
        match *self {
            PacingConfig::Unpaced => Ok(Pacer::unpaced()),
            PacingConfig::Fixed { spin, sleep } => Ok(Pacer::fixed(spin, sleep)),
            PacingConfig::Rate(PubRate { rate, method }) => {
                let spins_per_usec = match method {
                    PacingMethod::Spin => {
                        let spins = calibrate_spins_per_usec();
                        if spins == 0 {
                            return Err(PerftestError::Config(
                                "could not calibrate the spin loop; --pub-rate with spin cannot be used"
                                    .to_string(),
                            ));
                        }
                        spins
                    }
                    PacingMethod::Sleep => 1,
                };
                Ok(Pacer::rate(rate, method, spins_per_usec))
            }
        }
    }
}

/// Validated configuration of one run.
#[derive(Debug, Clone)]
pub struct TestConfig {
    pub transport: Transport,
    /// Publisher role for the TCP transport; the in-process transport runs both.
    pub publisher: bool,
    /// Sample size on the wire, header included.
    pub data_len: u64,
    pub num_iter: u64,
    pub latency_count: u64,
    pub latency_test: bool,
    /// Run length, per size when scanning.
    pub execution_time: Option<Duration>,
    pub scan: Option<Vec<u64>>,
    pub best_effort: bool,
    pub keyed: bool,
    pub instances: u32,
    pub batch_size: usize,
    pub num_publishers: usize,
    pub num_subscribers: usize,
    pub pid: i32,
    pub sid: i32,
    pub pacing: PacingConfig,
    pub initial_burst_size: Option<u64>,
    pub latency_file: Option<PathBuf>,
    pub low_resolution_clock: bool,
    pub writer_stats: bool,
    pub cft: Option<ContentFilter>,
    pub use_read_thread: bool,
    pub receive_affinity: Option<usize>,
    pub host: String,
    pub port: u16,
    pub buffer_size: usize,
    pub send_queue_size: usize,
    pub print_intervals: bool,
    pub show_cpu: bool,
    pub output_file: Option<PathBuf>,
    /// Poll period of every discovery wait and of the subscriber monitor loop.
    pub discovery_interval: Duration,
    /// Pause between the initial burst and the first measured sample.
    pub settle_time: Duration,
    /// Bound of each acknowledgement wait during handshakes.
    pub ack_timeout: Duration,
    /// FINISHED broadcasts attempted before giving up on silent subscribers.
    pub finished_retries: u32,
    /// Subscriber pause after FINISHED before tearing down.
    pub final_pause: Duration,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Intra,
            publisher: false,
            data_len: defaults::DATA_LEN,
            num_iter: defaults::NUM_ITER,
            latency_count: defaults::LATENCY_COUNT,
            latency_test: false,
            execution_time: None,
            scan: None,
            best_effort: false,
            keyed: false,
            instances: 1,
            batch_size: 0,
            num_publishers: 1,
            num_subscribers: 1,
            pid: 0,
            sid: 0,
            pacing: PacingConfig::Unpaced,
            initial_burst_size: None,
            latency_file: None,
            low_resolution_clock: false,
            writer_stats: false,
            cft: None,
            use_read_thread: false,
            receive_affinity: None,
            host: defaults::HOST.to_string(),
            port: defaults::PORT,
            buffer_size: defaults::BUFFER_SIZE,
            send_queue_size: defaults::SEND_QUEUE_SIZE,
            print_intervals: true,
            show_cpu: false,
            output_file: None,
            discovery_interval: defaults::DISCOVERY_INTERVAL,
            settle_time: defaults::SETTLE_TIME,
            ack_timeout: defaults::ACK_TIMEOUT,
            finished_retries: defaults::FINISHED_RETRIES,
            final_pause: defaults::FINAL_PAUSE,
        }
    }
}

impl TestConfig {
    /// Resolve defaults that depend on other options, then validate.
    pub fn from_args(args: &Args) -> Result<Self, PerftestError> {
        let scan = args.scan.as_ref().map(|sizes| sizes.0.clone());

        // Scanning sizes the buffers for the largest sample.
        let data_len = match &scan {
            Some(sizes) => sizes.iter().copied().max().unwrap_or(args.data_len),
            None => args.data_len,
        };

        let latency_count = match args.latency_count {
            Some(count) => count,
            None if args.latency_test => 1,
            None => defaults::LATENCY_COUNT,
        };

        let num_iter = match args.num_iter {
            Some(num_iter) => num_iter,
            None if args.latency_test => defaults::NUM_ITER_LATENCY_TEST,
            None => defaults::NUM_ITER,
        };

        let execution_time = match (args.execution_time, &scan) {
            (Some(secs), _) => Some(Duration::from_secs(secs)),
            (None, Some(_)) => Some(defaults::SCAN_EXECUTION_TIME),
            (None, None) => None,
        };

        let rate = match (args.pub_rate, args.pub_rate_bps) {
            (Some(rate), _) => Some(rate),
            (None, Some(bps)) => Some(PubRate {
                rate: (bps.rate / (8 * data_len.max(1))).max(1),
                method: bps.method,
            }),
            (None, None) => None,
        };

        let pacing = match rate {
            Some(rate) => {
                if args.spin.is_some() {
                    warn!("--spin is not compatible with --pub-rate; the rate controller sets the spin count");
                }
                if args.sleep.is_some() {
                    warn!("--sleep is not compatible with --pub-rate; the rate controller sets the sleep time");
                }
                PacingConfig::Rate(rate)
            }
            None if args.spin.is_some() || args.sleep.is_some() => PacingConfig::Fixed {
                spin: args.spin.unwrap_or(0),
                sleep: Duration::from_millis(args.sleep.unwrap_or(0)),
            },
            None => PacingConfig::Unpaced,
        };

        let batch_size = if args.latency_test && args.batch_size > 0 {
            warn!("Batching is disabled in latency test mode");
            0
        } else {
            args.batch_size
        };

        let config = Self {
            transport: args.transport,
            publisher: args.publisher,
            data_len,
            num_iter,
            latency_count,
            latency_test: args.latency_test,
            execution_time,
            scan,
            best_effort: args.best_effort,
            keyed: args.keyed,
            instances: args.instances,
            batch_size,
            num_publishers: args.num_publishers,
            num_subscribers: args.num_subscribers,
            pid: args.pid,
            sid: args.sid,
            pacing,
            initial_burst_size: args.initial_burst_size,
            latency_file: args.latency_file.clone(),
            low_resolution_clock: args.low_resolution_clock,
            writer_stats: args.writer_stats,
            cft: args.cft.map(|cft| ContentFilter {
                start: cft.start,
                end: cft.end,
            }),
            use_read_thread: args.use_read_thread,
            receive_affinity: args.receive_affinity,
            host: args.host.clone(),
            port: args.port,
            buffer_size: args.buffer_size,
            send_queue_size: args.send_queue_size,
            print_intervals: !args.no_print_intervals,
            show_cpu: args.cpu,
            output_file: args.output_file.clone(),
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Startup checks. Every failure is fatal to the run.
    pub fn validate(&self) -> Result<(), PerftestError> {
        check_sample_size(self.data_len, "--data-len")?;
        if self.transport == Transport::Tcp {
            let largest = self
                .scan
                .iter()
                .flatten()
                .copied()
                .fold(self.data_len, u64::max);
            if largest > tcp::MAX_SAMPLE_SIZE {
                return config_error(format!(
                    "samples of {} bytes exceed the tcp frame limit of {} bytes",
                    largest,
                    tcp::MAX_SAMPLE_SIZE
                ));
            }
        }

        if self.num_publishers == 0 || self.num_subscribers == 0 {
            return config_error("at least one publisher and one subscriber are required");
        }
        if self.pid < 0 || self.pid as usize >= self.num_publishers {
            return config_error(format!(
                "publisher id {} must be in [0, {})",
                self.pid, self.num_publishers
            ));
        }
        if self.sid < 0 || self.sid as usize >= self.num_subscribers {
            return config_error(format!(
                "subscriber id {} must be in [0, {})",
                self.sid, self.num_subscribers
            ));
        }
        if self.latency_test && self.pid != 0 {
            return config_error("only the publisher with id 0 can run the latency test");
        }
        if self.latency_count == 0 {
            return config_error("--latency-count must be greater than 0");
        }
        if self.num_iter < self.latency_count {
            return config_error(format!(
                "--num-iter ({}) must be greater than --latency-count ({})",
                self.num_iter, self.latency_count
            ));
        }
        if self.instances == 0 {
            return config_error("--instances must be greater than 0");
        }
        if let Some(cft) = self.cft {
            if cft.start > cft.end {
                return config_error("--cft <start> cannot be bigger than <end>");
            }
            if cft.end >= MAX_CFT_VALUE {
                return config_error(format!("--cft values must be below {}", MAX_CFT_VALUE));
            }
        }
        if let Some(sizes) = &self.scan {
            if sizes.is_empty() {
                return config_error("--scan needs at least one size");
            }
            for size in sizes {
                check_sample_size(*size, "--scan")?;
            }
            if sizes.windows(2).any(|pair| pair[0] >= pair[1]) {
                return config_error("--scan sizes must be in increasing order");
            }
            let small = sizes.iter().any(|size| *size <= MAX_SYNCHRONOUS_SIZE);
            let large = sizes.iter().any(|size| *size > MAX_SYNCHRONOUS_SIZE);
            if small && large {
                return config_error(format!(
                    "--scan sizes cannot mix values below and above {}",
                    MAX_SYNCHRONOUS_SIZE
                ));
            }
        }
        if self.low_resolution_clock {
            if self.latency_count != 1 {
                return config_error("--low-resolution-clock can only be used with a latency count of 1");
            }
            if self.pacing != PacingConfig::Unpaced {
                return config_error("--low-resolution-clock cannot be used with --sleep, --spin or --pub-rate");
            }
        }
        Ok(())
    }

    /// Payload length carried in `size` for a given wire length.
    pub fn payload_size(data_len: u64) -> i32 {
        (data_len as i64 - OVERHEAD_BYTES as i64) as i32
    }

    /// Samples that fit in one batch of `data_len`-byte samples.
    pub fn samples_per_batch(&self, data_len: u64) -> u64 {
        let batch = self.batch_size as u64;
        if batch > data_len {
            batch / data_len.max(1)
        } else {
            1
        }
    }

    /// Pings expected per size, which bounds the latency history.
    pub fn latency_history_capacity(&self) -> usize {
        let samples_per_batch = self.samples_per_batch(self.data_len);
        let batches = self.num_iter / samples_per_batch;
        let mut pings = batches / self.latency_count;
        if batches % self.latency_count > 0 {
            pings += 1;
        }
        if samples_per_batch > 1 {
            pings += 1;
        }
        pings as usize
    }

    pub fn printer(&self) -> Printer {
        Printer::new(self.print_intervals, self.show_cpu)
    }

    /// Per-endpoint settings handed to the messaging backend.
    pub fn transport_config(&self, role: Role) -> TransportConfig {
        TransportConfig {
            role,
            reliable: !self.best_effort,
            batch_size: self.batch_size,
            instances: if self.keyed { self.instances } else { 1 },
            content_filter: match role {
                Role::Subscriber { .. } => self.cft,
                Role::Publisher { .. } => None,
            },
            send_queue_size: self.send_queue_size,
            discovery_interval: self.discovery_interval,
            host: self.host.clone(),
            port: self.port,
            buffer_size: self.buffer_size,
            num_publishers: self.num_publishers,
        }
    }

    /// Log the effective settings at startup.
    pub fn log_summary(&self) {
        info!("Transport: {}", self.transport);
        if self.transport == Transport::Tcp {
            info!(
                "Peers: {}:{} and up, {} socket buffers",
                self.host,
                self.port,
                format_bytes(self.buffer_size as u64)
            );
        }
        info!(
            "Reliability: {}",
            if self.best_effort { "best effort" } else { "reliable" }
        );
        info!(
            "Publishers: {}, subscribers: {}",
            self.num_publishers, self.num_subscribers
        );
        match &self.scan {
            Some(sizes) => info!("Scanning sizes {:?}", sizes),
            None => info!("Data length: {}", self.data_len),
        }
        match self.execution_time {
            Some(time) => info!("Execution time: {}s", time.as_secs()),
            None => info!("Number of samples: {}", self.num_iter),
        }
        info!(
            "Latency count: 1 out of every {} {}",
            self.latency_count,
            if self.batch_size > 0 { "batches" } else { "samples" }
        );
        if self.batch_size > 0 {
            info!("Batch size: {} bytes", self.batch_size);
        }
        if self.keyed {
            info!("Keyed data with {} instances", self.instances);
        }
        if let Some(cft) = self.cft {
            info!("Content filter: keys {} to {}", cft.start, cft.end);
        }
        match self.pacing {
            PacingConfig::Rate(PubRate { rate, method }) => {
                info!("Publication rate: {} samples/s ({:?})", rate, method)
            }
            PacingConfig::Fixed { spin, sleep } => {
                info!("Fixed pacing: {} spins, {:?} sleep", spin, sleep)
            }
            PacingConfig::Unpaced => {}
        }
    }
}

fn config_error<T>(message: impl Into<String>) -> Result<T, PerftestError> {
    Err(PerftestError::Config(message.into()))
}

fn check_sample_size(data_len: u64, option: &str) -> Result<(), PerftestError> {
    if data_len < OVERHEAD_BYTES as u64 || data_len > MAX_PERFTEST_SAMPLE_SIZE {
        return config_error(format!(
            "{} value {} must be in [{}, {}]",
            option, data_len, OVERHEAD_BYTES, MAX_PERFTEST_SAMPLE_SIZE
        ));
    }
    if is_sentinel_size(TestConfig::payload_size(data_len)) {
        return config_error(format!(
            "{} value {} collides with a control message size",
            option, data_len
        ));
    }
    Ok(())
}
