use crate::pacing::PacingMethod;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Pub/Sub Perftest - throughput and latency harness for publish-subscribe middleware
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Run as a publisher
    #[clap(long = "pub", conflicts_with = "subscriber", help_heading = "Core Options")]
    pub publisher: bool,

    /// Run as a subscriber (default)
    #[clap(long = "sub", help_heading = "Core Options")]
    pub subscriber: bool,

    /// Messaging backend. `intra` runs the publishers and subscribers as threads of this process
    #[clap(long, value_enum, default_value_t = Transport::Tcp, help_heading = "Core Options")]
    pub transport: Transport,

    /// Sample size on the wire in bytes, including the fixed header
    #[clap(long, default_value_t = crate::defaults::DATA_LEN, help_heading = "Core Options")]
    pub data_len: u64,

    /// Number of samples to send
    #[clap(long, help_heading = "Core Options")]
    pub num_iter: Option<u64>,

    /// Number of samples (or batches) between pings
    #[clap(long, help_heading = "Core Options")]
    pub latency_count: Option<u64>,

    /// Wait for each pong before sending the next ping
    #[clap(long, default_value_t = false, help_heading = "Core Options")]
    pub latency_test: bool,

    /// Stop after this many seconds instead of after --num-iter samples (per size when scanning)
    #[clap(long, help_heading = "Core Options")]
    pub execution_time: Option<u64>,

    /// Run once per sample size, colon-separated (e.g. 32:64:1024)
    #[clap(long, num_args = 0..=1, default_missing_value = crate::defaults::SCAN_SIZES, value_parser = parse_scan, help_heading = "Core Options")]
    pub scan: Option<ScanSizes>,

    /// Use best-effort delivery for the throughput and latency topics
    #[clap(long, default_value_t = false, help_heading = "Core Options")]
    pub best_effort: bool,

    /// Use keyed samples
    #[clap(long, default_value_t = false, help_heading = "Core Options")]
    pub keyed: bool,

    /// Number of instance keys a keyed writer rotates through
    #[clap(long, default_value_t = 1, help_heading = "Core Options")]
    pub instances: u32,

    /// Bytes to coalesce per batch; 0 disables batching
    #[clap(long, default_value_t = 0, help_heading = "Core Options")]
    pub batch_size: usize,

    /// Number of publishers in the test
    #[clap(long, default_value_t = 1, help_heading = "Core Options")]
    pub num_publishers: usize,

    /// Number of subscribers in the test
    #[clap(long, default_value_t = 1, help_heading = "Core Options")]
    pub num_subscribers: usize,

    /// Publisher id; only publisher 0 sends pings
    #[clap(long, default_value_t = 0, help_heading = "Publisher Options")]
    pub pid: i32,

    /// Publication rate as <samples/s>:<spin|sleep>
    #[clap(long, value_parser = parse_pub_rate, help_heading = "Publisher Options")]
    pub pub_rate: Option<PubRate>,

    /// Publication rate as <bits/s>:<spin|sleep>
    #[clap(long, value_parser = parse_pub_rate, conflicts_with = "pub_rate", help_heading = "Publisher Options")]
    pub pub_rate_bps: Option<PubRate>,

    /// Busy-wait this many spin iterations after each sample
    #[clap(long, help_heading = "Publisher Options")]
    pub spin: Option<u64>,

    /// Sleep this many milliseconds after each sample
    #[clap(long, help_heading = "Publisher Options")]
    pub sleep: Option<u64>,

    /// Number of INITIALIZE samples sent before measuring
    #[clap(long, help_heading = "Publisher Options")]
    pub initial_burst_size: Option<u64>,

    /// Append raw latency samples of every size to a CSV file
    #[clap(long, num_args = 0..=1, default_missing_value = crate::defaults::LATENCY_FILE, help_heading = "Publisher Options")]
    pub latency_file: Option<PathBuf>,

    /// Estimate the average latency from the total run time
    #[clap(long, default_value_t = false, help_heading = "Publisher Options")]
    pub low_resolution_clock: bool,

    /// Print the writer's pulled sample count
    #[clap(long, default_value_t = false, help_heading = "Publisher Options")]
    pub writer_stats: bool,

    /// Subscriber id
    #[clap(long, default_value_t = 0, help_heading = "Subscriber Options")]
    pub sid: i32,

    /// Only receive samples whose key lies in <start>[:<end>]
    #[clap(long, value_parser = parse_cft, help_heading = "Subscriber Options")]
    pub cft: Option<CftRange>,

    /// Pull samples on a dedicated thread instead of a callback
    #[clap(long, default_value_t = false, help_heading = "Subscriber Options")]
    pub use_read_thread: bool,

    /// Pin the receive thread to this CPU core
    #[clap(long, requires = "use_read_thread", help_heading = "Subscriber Options")]
    pub receive_affinity: Option<usize>,

    /// Host address of the publishers
    #[clap(long, default_value = crate::defaults::HOST, help_heading = "Transport Options")]
    pub host: String,

    /// Base port; publisher N listens on port + N
    #[clap(long, default_value_t = crate::defaults::PORT, help_heading = "Transport Options")]
    pub port: u16,

    /// Socket send and receive buffer size
    #[clap(long, default_value_t = crate::defaults::BUFFER_SIZE, help_heading = "Transport Options")]
    pub buffer_size: usize,

    /// Depth of each best-effort reader queue
    #[clap(long, default_value_t = crate::defaults::SEND_QUEUE_SIZE, help_heading = "Transport Options")]
    pub send_queue_size: usize,

    /// Only print summaries
    #[clap(long, default_value_t = false, help_heading = "Output Options")]
    pub no_print_intervals: bool,

    /// Append process CPU usage to every record
    #[clap(long, default_value_t = false, help_heading = "Output Options")]
    pub cpu: bool,

    /// Write a JSON report of every summary to this file
    #[clap(short = 'o', long, help_heading = "Output Options")]
    pub output_file: Option<PathBuf>,

    /// More diagnostics (-v debug, -vv trace)
    #[clap(short = 'v', long, action = clap::ArgAction::Count, help_heading = "Output Options")]
    pub verbose: u8,

    /// Only warnings and errors on stderr
    #[clap(short = 'q', long, conflicts_with = "verbose", help_heading = "Output Options")]
    pub quiet: bool,

    /// Also write diagnostics to this file
    #[clap(long, help_heading = "Output Options")]
    pub log_file: Option<PathBuf>,
}

/// Available messaging backends
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum Transport {
    /// In-process bus
    #[clap(name = "intra")]
    Intra,

    /// Peer-to-peer TCP
    #[clap(name = "tcp")]
    Tcp,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Intra => write!(f, "In-process"),
            Transport::Tcp => write!(f, "TCP"),
        }
    }
}

/// Sample sizes of a scan run, in the order given.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanSizes(pub Vec<u64>);

/// A rate and the pacing method used to hold it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PubRate {
    pub rate: u64,
    pub method: PacingMethod,
}

/// Inclusive key range for content filtering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CftRange {
    pub start: u32,
    pub end: u32,
}

fn parse_number<T: std::str::FromStr>(s: &str, what: &str) -> Result<T, String> {
    s.trim()
        .parse()
        .map_err(|_| format!("Invalid {}: {}", what, s))
}

/// Parse a colon-separated list of sizes (e.g., "32:64:128")
fn parse_scan(s: &str) -> Result<ScanSizes, String> {
    let sizes = s
        .split(':')
        .map(|size| parse_number::<u64>(size, "scan size"))
        .collect::<Result<Vec<_>, _>>()?;
    if sizes.is_empty() {
        return Err("Scan list cannot be empty".to_string());
    }
    Ok(ScanSizes(sizes))
}

/// Parse "<rate>[:<spin|sleep>]"; the method defaults to spin
fn parse_pub_rate(s: &str) -> Result<PubRate, String> {
    let (rate, method) = match s.split_once(':') {
        Some((rate, method)) => (rate, method),
        None => (s, "spin"),
    };
    let rate: u64 = parse_number(rate, "rate")?;
    if rate == 0 {
        return Err("Rate must be greater than 0".to_string());
    }
    let method = match method.trim() {
        "spin" => PacingMethod::Spin,
        "sleep" => PacingMethod::Sleep,
        other => return Err(format!("Invalid pacing method: {} (expected spin or sleep)", other)),
    };
    Ok(PubRate { rate, method })
}

/// Parse "<start>[:<end>]"; a single value filters on one key
fn parse_cft(s: &str) -> Result<CftRange, String> {
    let (start, end) = match s.split_once(':') {
        Some((start, end)) => (parse_number(start, "cft start")?, parse_number(end, "cft end")?),
        None => {
            let key = parse_number(s, "cft key")?;
            (key, key)
        }
    };
    Ok(CftRange { start, end })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scan() {
        assert_eq!(parse_scan("32:64:128").unwrap(), ScanSizes(vec![32, 64, 128]));
        assert_eq!(parse_scan("1024").unwrap(), ScanSizes(vec![1024]));
        assert!(parse_scan("32::64").is_err());
        assert!(parse_scan("big").is_err());
    }

    #[test]
    fn test_parse_pub_rate() {
        assert_eq!(
            parse_pub_rate("1000:sleep").unwrap(),
            PubRate { rate: 1000, method: PacingMethod::Sleep }
        );
        assert_eq!(parse_pub_rate("500").unwrap().method, PacingMethod::Spin);
        assert!(parse_pub_rate("0:spin").is_err());
        assert!(parse_pub_rate("10:yield").is_err());
    }

    #[test]
    fn test_parse_cft() {
        assert_eq!(parse_cft("3:9").unwrap(), CftRange { start: 3, end: 9 });
        assert_eq!(parse_cft("7").unwrap(), CftRange { start: 7, end: 7 });
        assert!(parse_cft("a:b").is_err());
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["pubsub-perftest"]).unwrap();
        assert!(!args.publisher);
        assert_eq!(args.transport, Transport::Tcp);
        assert_eq!(args.data_len, crate::defaults::DATA_LEN);
        assert!(args.scan.is_none());
        assert_eq!(args.verbose, 0);
    }

    #[test]
    fn test_optional_values() {
        let args = Args::try_parse_from([
            "pubsub-perftest",
            "--pub",
            "--scan",
            "--latency-file",
            "--cft",
            "2:4",
            "-vv",
        ])
        .unwrap();
        assert!(args.publisher);
        assert_eq!(args.scan.unwrap().0.len(), 12);
        assert_eq!(args.latency_file.unwrap(), PathBuf::from(crate::defaults::LATENCY_FILE));
        assert_eq!(args.cft, Some(CftRange { start: 2, end: 4 }));
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_role_flags_conflict() {
        assert!(Args::try_parse_from(["pubsub-perftest", "--pub", "--sub"]).is_err());
    }

    #[test]
    fn test_transport_display() {
        assert_eq!(Transport::Intra.to_string(), "In-process");
        assert_eq!(Transport::Tcp.to_string(), "TCP");
    }
}
