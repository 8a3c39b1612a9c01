// Worker pool configuration

use super::constants::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Requested number of concurrent encodes, clamped to `1..=cpu_count`
    pub pool_size: usize,

    /// Attempt ceiling per job, including the first attempt
    pub max_attempts: i32,

    /// Publication retries per staged output
    pub max_finalize_attempts: i32,

    /// A claim without a heartbeat for this long is reclaimed
    pub liveness_ms: i64,

    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,

    /// How long in-flight encodes may keep running after shutdown is requested
    #[serde(with = "duration_ms")]
    pub shutdown_grace: Duration,

    pub retry_base_delay_ms: i64,

    /// Claiming pauses while free disk space is below this (0 disables)
    pub min_free_disk_mb: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_finalize_attempts: DEFAULT_MAX_FINALIZE_ATTEMPTS,
            liveness_ms: DEFAULT_LIVENESS_MS,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            min_free_disk_mb: 1024,
        }
    }
}

impl WorkerConfig {
    /// Pool size actually used on a machine with `cpu_count` cores
    pub fn effective_pool_size(&self, cpu_count: usize) -> usize {
        self.pool_size.clamp(1, cpu_count.max(1))
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_size_clamped_to_cpus() {
        let config = WorkerConfig {
            pool_size: 16,
            ..Default::default()
        };
        assert_eq!(config.effective_pool_size(4), 4);
        assert_eq!(config.effective_pool_size(0), 1);

        let zero = WorkerConfig {
            pool_size: 0,
            ..Default::default()
        };
        assert_eq!(zero.effective_pool_size(8), 1);
    }

    #[test]
    fn test_durations_in_millis() {
        let json = r#"{"heartbeat_interval": 500, "shutdown_grace": 2000}"#;
        let config: WorkerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(config.shutdown_grace, Duration::from_secs(2));
        assert_eq!(config.max_attempts, DEFAULT_MAX_ATTEMPTS);
    }
}
