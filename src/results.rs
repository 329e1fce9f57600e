use crate::cli::Transport;
use crate::config::TestConfig;
use crate::metrics::{LatencySummary, ThroughputSummary};
use crate::publisher::PublisherReport;
use crate::subscriber::SubscriberReport;
use crate::utils;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Everything the participants of one run reported
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub publishers: Vec<PublisherReport>,
    pub subscribers: Vec<SubscriberReport>,
}

impl RunReport {
    /// Latency summaries of every publisher, in size order.
    pub fn latency(&self) -> impl Iterator<Item = &LatencySummary> {
        self.publishers.iter().flat_map(|report| report.latency.iter())
    }

    /// Throughput summaries of every subscriber.
    pub fn throughput(&self) -> impl Iterator<Item = &ThroughputSummary> {
        self.subscribers
            .iter()
            .flat_map(|report| report.throughput.iter())
    }

    pub fn merge(&mut self, other: RunReport) {
        self.publishers.extend(other.publishers);
        self.subscribers.extend(other.subscribers);
    }
}

/// Test configuration recorded with the results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfiguration {
    pub transport: Transport,
    pub data_len: u64,
    pub scan: Option<Vec<u64>>,
    pub num_iter: u64,
    pub latency_count: u64,
    pub latency_test: bool,
    pub execution_time: Option<Duration>,
    pub best_effort: bool,
    pub keyed: bool,
    pub instances: u32,
    pub batch_size: usize,
    pub num_publishers: usize,
    pub num_subscribers: usize,
}

impl From<&TestConfig> for RunConfiguration {
    fn from(config: &TestConfig) -> Self {
        Self {
            transport: config.transport,
            data_len: config.data_len,
            scan: config.scan.clone(),
            num_iter: config.num_iter,
            latency_count: config.latency_count,
            latency_test: config.latency_test,
            execution_time: config.execution_time,
            best_effort: config.best_effort,
            keyed: config.keyed,
            instances: config.instances,
            batch_size: config.batch_size,
            num_publishers: config.num_publishers,
            num_subscribers: config.num_subscribers,
        }
    }
}

/// System information for reproducibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub hostname: Option<String>,
    pub cpu_cores: usize,
    pub memory_bytes: Option<u64>,
    pub rust_version: String,
    pub harness_version: String,
}

impl SystemInfo {
    pub fn collect() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            hostname: utils::get_hostname(),
            cpu_cores: utils::get_cpu_cores(),
            memory_bytes: utils::get_total_memory_bytes(),
            rust_version: env!("CARGO_PKG_RUST_VERSION").to_string(),
            harness_version: crate::VERSION.to_string(),
        }
    }
}

/// Run metadata
#[derive(Debug, Serialize, Deserialize)]
pub struct RunMetadata {
    pub version: String,
    pub run_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub system_info: SystemInfo,
}

/// Layout of the JSON results file
#[derive(Debug, Serialize, Deserialize)]
pub struct FinalResults {
    pub metadata: RunMetadata,
    pub configuration: RunConfiguration,
    pub report: RunReport,
}

/// Writes the JSON report of a run
pub struct ResultsManager {
    output_file: PathBuf,
    run_id: String,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl ResultsManager {
    /// Create a results manager; the run clock starts now
    pub fn new(output_file: &Path) -> Self {
        Self {
            output_file: output_file.to_path_buf(),
            run_id: utils::generate_run_id(),
            started_at: chrono::Utc::now(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Serialize the report with its metadata and write the output file
    pub fn finalize(&self, config: &TestConfig, report: &RunReport) -> Result<()> {
        let results = FinalResults {
            metadata: RunMetadata {
                version: crate::VERSION.to_string(),
                run_id: self.run_id.clone(),
                started_at: self.started_at,
                finished_at: chrono::Utc::now(),
                system_info: SystemInfo::collect(),
            },
            configuration: RunConfiguration::from(config),
            report: report.clone(),
        };

        let json = serde_json::to_string_pretty(&results)?;
        std::fs::write(&self.output_file, json)
            .with_context(|| format!("Failed to write {}", self.output_file.display()))?;

        info!("Results written to: {:?}", self.output_file);
        Ok(())
    }
}
