// Claim heartbeat for a running job

use crate::application::cancel::CancellationRegistry;
use crate::domain::{ClipId, JobId};
use crate::port::{AbortReason, JobQueue, TimeProvider};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Stops the heartbeat task when dropped
pub(crate) struct HeartbeatGuard(JoinHandle<()>);

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub(crate) struct Heartbeat {
    pub queue: Arc<dyn JobQueue>,
    pub time_provider: Arc<dyn TimeProvider>,
    pub cancellations: Arc<CancellationRegistry>,
    pub interval: Duration,
}

impl Heartbeat {
    /// Refresh the claim every `interval`, and immediately whenever the
    /// engine pid changes. A revoked claim aborts the clip's encode.
    pub fn spawn(
        self,
        job_id: JobId,
        clip_id: ClipId,
        claim_token: String,
        mut pid_rx: watch::Receiver<Option<i32>>,
    ) -> HeartbeatGuard {
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut pid_open = true;

            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    changed = pid_rx.changed(), if pid_open => {
                        if changed.is_err() {
                            pid_open = false;
                            continue;
                        }
                    }
                }

                let pid = *pid_rx.borrow();
                let now = self.time_provider.now_millis();
                match self.queue.heartbeat(&job_id, &claim_token, now, pid).await {
                    Ok(true) => debug!(job_id = %job_id, pid = ?pid, "Heartbeat"),
                    Ok(false) => {
                        warn!(job_id = %job_id, clip_id = %clip_id, "Claim revoked, aborting encode");
                        self.cancellations.abort(&clip_id, AbortReason::ClaimLost);
                        break;
                    }
                    Err(e) => warn!(job_id = %job_id, error = %e, "Heartbeat write failed"),
                }
            }
        });
        HeartbeatGuard(handle)
    }
}
