use thiserror::Error;

/// Error conditions raised by the harness itself.
///
/// Transport adapters and orchestrators return `anyhow::Result`; these
/// variants are the typed causes callers can downcast to.
#[derive(Debug, Error)]
pub enum PerftestError {
    /// Invalid or inconsistent run configuration, detected before the run starts.
    #[error("configuration error: {0}")]
    Config(String),

    /// More latency samples arrived in one size epoch than the history was
    /// sized for. Usually more than one application is acting as publisher 0.
    #[error("too many latency pongs received: history holds {capacity} samples")]
    LatencyHistoryOverflow { capacity: usize },

    /// The latency history buffer could not be allocated.
    #[error("not able to allocate {requested} elements for the latency history")]
    LatencyHistoryAllocation { requested: usize },

    #[error("transport error: {0}")]
    Transport(String),

    /// Peer discovery did not complete.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// A participant thread panicked.
    #[error("thread error: {0}")]
    Thread(String),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}
