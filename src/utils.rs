//! # Utility Functions
//!
//! Small helpers shared by the orchestrators and the report writer:
//!
//! - **Identification**: unique run ids for reports and log correlation
//! - **Formatting**: human-readable byte counts for diagnostics
//! - **System Information**: host facts recorded alongside every report
//!
//! ```rust
//! use pubsub_perftest::utils::format_bytes;
//!
//! assert_eq!(format_bytes(1536), "1.50 KB");
//! ```

use uuid::Uuid;

/// Generate a unique identifier for a test run
///
/// Recorded in the JSON report and in the first diagnostic line so that the
/// output of the publisher and subscriber processes of one run can be
/// matched up afterwards.
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Format a byte count in a human-readable way
///
/// ```rust
/// # use pubsub_perftest::utils::format_bytes;
/// assert_eq!(format_bytes(512), "512 B");
/// assert_eq!(format_bytes(2621440), "2.50 MB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = UNITS[0];
    for candidate in UNITS {
        value /= 1024.0;
        unit = candidate;
        if value < 1024.0 {
            break;
        }
    }
    format!("{:.2} {}", value, unit)
}

/// Number of logical CPU cores
pub fn get_cpu_cores() -> usize {
    num_cpus::get()
}

/// Total physical memory in bytes, read from `/proc/meminfo`
///
/// Returns `None` on platforms without procfs or when the file cannot be
/// parsed; the report then omits the value.
pub fn get_total_memory_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_mem_total(&meminfo)
}

fn parse_mem_total(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kib| kib.parse::<u64>().ok())
        .map(|kib| kib * 1024)
}

/// Host name of this machine, if the OS reports one
pub fn get_hostname() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
}
