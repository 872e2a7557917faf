//! Store configuration.

use std::time::Duration;

/// Default segment rotation threshold: 10 MB.
const DEFAULT_MAX_SEGMENT_BYTES: u64 = 10 * 1024 * 1024;
/// Default background merge interval: 60 seconds.
const DEFAULT_MERGE_INTERVAL: Duration = Duration::from_secs(60);

/// Configuration for a key-value store.
#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    /// Segment rotation threshold in bytes. A write that would push the
    /// active segment past this size rotates to a fresh segment first.
    /// `0` disables rotation.
    pub max_segment_bytes: u64,

    /// Interval between background compaction passes.
    pub merge_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
            merge_interval: DEFAULT_MERGE_INTERVAL,
        }
    }
}

impl StoreConfig {
    /// Build a configuration from the process environment.
    ///
    /// Recognizes `MAX_SEGMENT_BYTES` and `MERGE_INTERVAL_MS`;
    /// `TEST_MERGE_INTERVAL_MS` overrides the merge interval when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(bytes) = env_u64("MAX_SEGMENT_BYTES") {
            config.max_segment_bytes = bytes;
        }
        if let Some(ms) = env_u64("MERGE_INTERVAL_MS") {
            config.merge_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("TEST_MERGE_INTERVAL_MS") {
            config.merge_interval = Duration::from_millis(ms);
        }
        config
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.parse().ok()
}
