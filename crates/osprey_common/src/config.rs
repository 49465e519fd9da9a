use serde::{Deserialize, Serialize};

/// Tuning knobs for one restore run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Number of concurrent per-table workers.
    pub concurrency: usize,
    /// Number of concurrent sub-range ingestion writers per flush.
    pub ingest_concurrency: usize,
    /// Flush a table buffer once it holds this many pairs.
    pub batch_flush_pairs: usize,
    /// Flush a table buffer once it holds this many bytes.
    pub batch_flush_bytes: u64,
    #[serde(default)]
    pub ingest_retry: IngestRetryConfig,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            ingest_concurrency: 16,
            batch_flush_pairs: 4096,
            batch_flush_bytes: 32 * 1024 * 1024,
            ingest_retry: IngestRetryConfig::default(),
        }
    }
}

/// Retry policy of the range ingestion loop. The source system retried
/// unfinished sub-ranges forever; here the ceiling and backoff are an
/// explicit contract. `max_rounds = 0` keeps the unbounded behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRetryConfig {
    /// Maximum number of whole-batch retry rounds before the flush fails.
    pub max_rounds: u32,
    /// Initial backoff between rounds, doubling each round.
    pub backoff_ms: u64,
    /// Backoff cap.
    pub max_backoff_ms: u64,
}

impl Default for IngestRetryConfig {
    fn default() -> Self {
        Self {
            max_rounds: 32,
            backoff_ms: 50,
            max_backoff_ms: 5_000,
        }
    }
}

impl IngestRetryConfig {
    /// Backoff to apply after the given completed round (1-based).
    pub fn backoff_after(&self, round: u32) -> std::time::Duration {
        let exp = round.saturating_sub(1).min(16);
        let ms = self
            .backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        std::time::Duration::from_millis(ms)
    }
}
