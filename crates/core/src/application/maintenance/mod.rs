//! Database housekeeping: settled-job retention and compaction.
//!
//! One pass purges each settled state past its retention window and then
//! compacts the file if it grew past the configured size. The scheduler and
//! `admin.maintenance.v1` both go through [`Housekeeper::run_pass`].

use crate::application::worker::ShutdownToken;
use crate::error::Result;
use crate::port::{JobCounts, Maintenance, RetentionPolicy, StoreStats, TimeProvider};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub retention: RetentionPolicy,
    /// Compact once the database file exceeds this many bytes
    pub compact_above_bytes: i64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            retention: RetentionPolicy::default(),
            compact_above_bytes: 1000 * 1024 * 1024,
        }
    }
}

/// Outcome of one housekeeping pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    /// Rows deleted, per settled state
    pub purged: JobCounts,
    pub compacted: bool,
    pub size_before: i64,
    pub size_after: i64,
}

pub struct Housekeeper {
    maintenance: Arc<dyn Maintenance>,
    config: MaintenanceConfig,
    time_provider: Arc<dyn TimeProvider>,
}

impl Housekeeper {
    pub fn new(
        maintenance: Arc<dyn Maintenance>,
        config: MaintenanceConfig,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            maintenance,
            config,
            time_provider,
        }
    }

    pub fn config(&self) -> &MaintenanceConfig {
        &self.config
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.maintenance.stats().await
    }

    /// Purge settled jobs past `retention`, then compact when due or forced
    ///
    /// # Errors
    /// - `AppError::Validation` if any retention window is negative
    pub async fn run_pass(
        &self,
        retention: RetentionPolicy,
        force_compact: bool,
    ) -> Result<HousekeepingReport> {
        retention.validate()?;

        let before = self.maintenance.stats().await?;
        let now = self.time_provider.now_millis();

        let mut purged = JobCounts::default();
        for (state, cutoff) in retention.cutoffs(now) {
            let removed = self.maintenance.purge_settled(state, cutoff).await?;
            purged.add(state, removed as i64);
        }

        let compacted = force_compact || before.size_bytes > self.config.compact_above_bytes;
        if compacted {
            self.maintenance.compact().await?;
        }
        let after = self.maintenance.stats().await?;

        info!(
            purged_done = purged.done,
            purged_failed = purged.failed,
            purged_cancelled = purged.cancelled,
            compacted,
            size_before = before.size_bytes,
            size_after = after.size_bytes,
            "Housekeeping pass completed"
        );

        Ok(HousekeepingReport {
            purged,
            compacted,
            size_before: before.size_bytes,
            size_after: after.size_bytes,
        })
    }
}

/// Runs a housekeeping pass with the configured retention every interval
pub struct MaintenanceScheduler {
    housekeeper: Arc<Housekeeper>,
    interval: Duration,
}

impl MaintenanceScheduler {
    pub fn new(housekeeper: Arc<Housekeeper>, interval: Duration) -> Self {
        Self {
            housekeeper,
            interval,
        }
    }

    /// The first pass runs one interval after start.
    pub async fn run(self, mut shutdown: ShutdownToken) {
        let retention = self.housekeeper.config().retention;
        info!(
            interval_secs = self.interval.as_secs(),
            done_days = retention.done_days,
            failed_days = retention.failed_days,
            cancelled_days = retention.cancelled_days,
            "Maintenance scheduler started"
        );

        let mut tick = interval(self.interval);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.wait() => break,
            }

            if let Err(e) = self.housekeeper.run_pass(retention, false).await {
                error!(error = %e, "Scheduled housekeeping failed");
            }
        }
        info!("Maintenance scheduler stopped");
    }
}
