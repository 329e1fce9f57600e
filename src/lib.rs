//! # Pub/Sub Perftest Library
//!
//! A throughput and latency test harness for publish-subscribe middleware.
//! One or more publishers send a stream of sequence-numbered samples to one
//! or more subscribers; every Nth sample is a ping that one subscriber echoes
//! back, so the ping originator can measure one-way latency as half the round
//! trip while the subscribers measure throughput and loss.
//!
//! ## Protocol
//!
//! Three logical topics carry the test:
//!
//! - **Throughput**: measured samples, plus INITIALIZE / LENGTH_CHANGED /
//!   FINISHED control samples distinguished by reserved `size` values
//! - **Latency**: pongs echoed by subscribers to publisher 0
//! - **Announcement**: subscriber readiness and termination handshakes
//!
//! ## Architecture Overview
//!
//! - `transport`: the messaging traits and the in-process and TCP backends
//! - `listeners`: the throughput, latency and announcement processors
//! - `publisher` / `subscriber`: the two orchestrator loops
//! - `metrics` / `printer`: statistics and the text records on stdout
//! - `config` / `cli`: argument parsing and startup validation
//! - `runner`: single-role and in-process run entry points
//! - `results`: the optional JSON report
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use pubsub_perftest::{run_in_process, TestConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = TestConfig {
//!         num_iter: 100_000,
//!         latency_count: 1_000,
//!         num_subscribers: 2,
//!         ..TestConfig::default()
//!     };
//!     let report = run_in_process(&config)?;
//!     for summary in report.throughput() {
//!         println!("{} samples received", summary.packets);
//!     }
//!     Ok(())
//! }
//! ```

/// Command-line interface
///
/// Clap argument definitions and the value parsers for scan lists, rates
/// and content-filter ranges.
pub mod cli;

/// Validated run configuration and startup checks
pub mod config;

/// Process CPU usage sampling
pub mod cpu;

pub mod error;

/// Protocol message processors
pub mod listeners;

/// Diagnostic log setup
pub mod logging;

/// The test message and the reserved control sizes
pub mod message;

/// Latency and throughput statistics
///
/// Running sums, the fixed-capacity latency history and the percentile
/// extraction performed on every summary.
pub mod metrics;

pub mod pacing;

/// Text records written to stdout
pub mod printer;

/// Publisher orchestrator
pub mod publisher;

/// JSON run reports
pub mod results;

/// Process-level run entry points
pub mod runner;

/// Subscriber orchestrator
pub mod subscriber;

pub mod sync;

/// Messaging abstraction and backends
///
/// The traits every orchestrator and listener is written against, an
/// in-process bus and a peer-to-peer TCP backend.
pub mod transport;

pub mod utils;

pub use cli::{Args, Transport};
pub use config::TestConfig;
pub use error::PerftestError;
pub use message::TestMessage;
pub use metrics::{LatencySummary, ThroughputSummary};
pub use publisher::{Publisher, PublisherReport};
pub use results::{ResultsManager, RunReport};
pub use runner::{run, run_in_process};
pub use subscriber::{Subscriber, SubscriberReport};

/// The current version of the harness, recorded in every JSON report.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Sample size on the wire, header included
    pub const DATA_LEN: u64 = 100;

    /// Samples sent per run (or per size when scanning without a timer)
    pub const NUM_ITER: u64 = 100_000_000;

    /// Smaller default for latency tests, which keep every pong in memory
    pub const NUM_ITER_LATENCY_TEST: u64 = 10_000_000;

    /// One ping every this many samples
    pub const LATENCY_COUNT: u64 = 10_000;

    /// Sizes visited by a bare `--scan`
    pub const SCAN_SIZES: &str = "32:64:128:256:512:1024:2048:4096:8192:16384:32768:63000";

    /// Time spent on each size when scanning
    pub const SCAN_EXECUTION_TIME: Duration = Duration::from_secs(60);

    /// File written by a bare `--latency-file`
    pub const LATENCY_FILE: &str = "LatencySamples.csv";

    /// Poll period of discovery waits and of the subscriber monitor loop
    pub const DISCOVERY_INTERVAL: Duration = Duration::from_millis(1000);

    /// Pause between the initial burst and the first measured sample
    pub const SETTLE_TIME: Duration = Duration::from_secs(1);

    /// Bound of each acknowledgement wait during handshakes
    pub const ACK_TIMEOUT: Duration = Duration::from_millis(100);

    /// FINISHED broadcasts before giving up on silent subscribers
    pub const FINISHED_RETRIES: u32 = 50;

    /// Ping wait in best-effort latency tests, where the pong may be lost
    pub const PING_TIMEOUT: Duration = Duration::from_millis(200);

    /// Subscriber pause after FINISHED so in-flight echoes can drain
    pub const FINAL_PAUSE: Duration = Duration::from_secs(2);

    /// INITIALIZE samples sent before measuring
    pub const INITIAL_BURST_SIZE: u64 = 50;

    /// Depth of each best-effort reader queue
    pub const SEND_QUEUE_SIZE: usize = 50;

    pub const HOST: &str = "127.0.0.1";

    /// Publisher N listens on this port plus N
    pub const PORT: u16 = 7400;

    /// Socket send and receive buffer size
    pub const BUFFER_SIZE: usize = 1 << 20;
}
