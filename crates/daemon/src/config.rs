//! Daemon configuration
//!
//! Layered: built-in defaults, then an optional TOML file, then `CLIPCAST_*`
//! environment variables (`__` separates nested keys, e.g.
//! `CLIPCAST_RPC__PORT=9700`).

use anyhow::{Context, Result};
use clipcast_api_rpc::RpcServerConfig;
use clipcast_core::application::worker::constants::{
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_LIVENESS_MS, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_FINALIZE_ATTEMPTS, DEFAULT_RECOVERY_INTERVAL, DEFAULT_RETRY_BASE_DELAY_MS,
    DEFAULT_SHUTDOWN_GRACE,
};
use clipcast_core::application::{MaintenanceConfig, ProgressConfig, WorkerConfig};
use clipcast_core::port::RetentionPolicy;
use clipcast_infra_system::FfmpegConfig;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "CLIPCAST";
const CONFIG_PATH_VAR: &str = "CLIPCAST_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "~/.clipcast/clipcast.toml";
const DEFAULT_DB_PATH: &str = "~/.clipcast/meta.db";
const DEFAULT_ARTIFACT_ROOT: &str = "~/.clipcast/artifacts";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub db_path: String,
    pub artifact_root: String,
    pub rpc: RpcServerConfig,
    pub workers: WorkersSection,
    pub progress: ProgressSection,
    pub ffmpeg: FfmpegConfig,
    pub maintenance: MaintenanceSection,
    pub logging: LoggingSection,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            artifact_root: DEFAULT_ARTIFACT_ROOT.to_string(),
            rpc: RpcServerConfig::default(),
            workers: WorkersSection::default(),
            progress: ProgressSection::default(),
            ffmpeg: FfmpegConfig::default(),
            maintenance: MaintenanceSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersSection {
    /// Concurrent encodes; clamped to the CPU count
    pub count: usize,
    pub max_attempts: i32,
    pub max_finalize_attempts: i32,
    pub liveness_secs: u64,
    pub heartbeat_secs: u64,
    pub shutdown_grace_secs: u64,
    pub retry_base_delay_ms: i64,
    pub min_free_disk_mb: u64,
    pub recovery_interval_secs: u64,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            count: 2,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_finalize_attempts: DEFAULT_MAX_FINALIZE_ATTEMPTS,
            liveness_secs: (DEFAULT_LIVENESS_MS / 1000) as u64,
            heartbeat_secs: DEFAULT_HEARTBEAT_INTERVAL.as_secs(),
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE.as_secs(),
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            min_free_disk_mb: 1024,
            recovery_interval_secs: DEFAULT_RECOVERY_INTERVAL.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressSection {
    pub failed_grace_secs: i64,
    pub failed_max_retention_secs: i64,
    pub sweep_interval_secs: u64,
}

impl Default for ProgressSection {
    fn default() -> Self {
        Self {
            failed_grace_secs: 5 * 60,
            failed_max_retention_secs: 24 * 60 * 60,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceSection {
    pub done_retention_days: i64,
    pub failed_retention_days: i64,
    pub cancelled_retention_days: i64,
    pub interval_hours: u64,
    /// Compact the database once it grows past this
    pub compact_above_mb: i64,
}

impl Default for MaintenanceSection {
    fn default() -> Self {
        let retention = RetentionPolicy::default();
        Self {
            done_retention_days: retention.done_days,
            failed_retention_days: retention.failed_days,
            cancelled_retention_days: retention.cancelled_days,
            interval_hours: 24,
            compact_above_mb: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Directory for a daily rolling log file; stdout only when unset
    pub dir: Option<String>,
}

impl DaemonConfig {
    /// Load from the default locations
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&expand(&path))
    }

    /// Load with `path` as the config file. A missing file is not an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        let settings = Config::builder()
            .add_source(
                File::from(path.to_path_buf())
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?;

        let config: DaemonConfig = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.workers.max_attempts < 1 {
            anyhow::bail!("workers.max_attempts must be at least 1");
        }
        if self.workers.heartbeat_secs == 0 {
            anyhow::bail!("workers.heartbeat_secs must be positive");
        }
        if self.workers.liveness_secs <= self.workers.heartbeat_secs {
            anyhow::bail!(
                "workers.liveness_secs ({}) must exceed workers.heartbeat_secs ({})",
                self.workers.liveness_secs,
                self.workers.heartbeat_secs
            );
        }
        if self.maintenance.interval_hours == 0 {
            anyhow::bail!("maintenance.interval_hours must be positive");
        }
        self.maintenance_config()
            .retention
            .validate()
            .context("invalid [maintenance] retention")?;
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        expand(&self.db_path)
    }

    pub fn artifact_root(&self) -> PathBuf {
        expand(&self.artifact_root)
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.logging.dir.as_deref().map(expand)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        let w = &self.workers;
        WorkerConfig {
            pool_size: w.count,
            max_attempts: w.max_attempts,
            max_finalize_attempts: w.max_finalize_attempts,
            liveness_ms: (w.liveness_secs * 1000) as i64,
            heartbeat_interval: Duration::from_secs(w.heartbeat_secs),
            shutdown_grace: Duration::from_secs(w.shutdown_grace_secs),
            retry_base_delay_ms: w.retry_base_delay_ms,
            min_free_disk_mb: w.min_free_disk_mb,
        }
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.workers.recovery_interval_secs.max(1))
    }

    pub fn progress_config(&self) -> ProgressConfig {
        ProgressConfig {
            failed_grace_ms: self.progress.failed_grace_secs * 1000,
            failed_max_retention_ms: self.progress.failed_max_retention_secs * 1000,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.progress.sweep_interval_secs.max(1))
    }

    pub fn maintenance_config(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            retention: RetentionPolicy {
                done_days: self.maintenance.done_retention_days,
                failed_days: self.maintenance.failed_retention_days,
                cancelled_days: self.maintenance.cancelled_retention_days,
            },
            compact_above_bytes: self.maintenance.compact_above_mb * 1024 * 1024,
        }
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance.interval_hours * 60 * 60)
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::load_from(&dir.path().join("absent.toml")).unwrap();

        assert_eq!(config.workers.max_attempts, 2);
        assert_eq!(config.workers.liveness_secs, 120);
        assert_eq!(config.rpc.host, "127.0.0.1");
        assert_eq!(config.ffmpeg.segment_seconds, 2);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clipcast.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
db_path = "/var/lib/clipcast/meta.db"

[workers]
count = 4
max_attempts = 3

[rpc]
port = 9701

[ffmpeg]
preset = "medium"
"#
        )
        .unwrap();

        let config = DaemonConfig::load_from(&path).unwrap();
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/clipcast/meta.db"));
        assert_eq!(config.workers.count, 4);
        assert_eq!(config.workers.max_attempts, 3);
        assert_eq!(config.workers.heartbeat_secs, 15);
        assert_eq!(config.rpc.port, 9701);
        assert_eq!(config.ffmpeg.preset, "medium");
        assert_eq!(config.ffmpeg.ffprobe_path, "ffprobe");
    }

    #[test]
    fn test_liveness_must_exceed_heartbeat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clipcast.toml");
        std::fs::write(&path, "[workers]\nliveness_secs = 10\nheartbeat_secs = 15\n").unwrap();

        assert!(DaemonConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_negative_retention_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clipcast.toml");
        std::fs::write(&path, "[maintenance]\nfailed_retention_days = -3\n").unwrap();

        assert!(DaemonConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_derived_service_configs() {
        let config = DaemonConfig::default();

        let worker = config.worker_config();
        assert_eq!(worker.liveness_ms, 120_000);
        assert_eq!(worker.heartbeat_interval, Duration::from_secs(15));

        let progress = config.progress_config();
        assert_eq!(progress.failed_grace_ms, 300_000);

        let maintenance = config.maintenance_config();
        assert_eq!(maintenance.retention, RetentionPolicy::default());
        assert_eq!(maintenance.compact_above_bytes, 1000 * 1024 * 1024);
        assert_eq!(config.maintenance_interval(), Duration::from_secs(86_400));
    }
}
