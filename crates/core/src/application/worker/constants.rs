// Worker constants (no magic values)
use std::time::Duration;

/// Upper bound on how long an idle worker waits before re-polling the queue.
/// Enqueue wakes idle workers directly; polling only matters for backoff-gated jobs.
pub const DEQUEUE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Sleep duration after worker error before retry (1s)
pub const ERROR_RECOVERY_SLEEP_DURATION: Duration = Duration::from_secs(1);

/// Sleep duration while claiming is paused for low disk space (5s)
pub const DISK_GUARD_SLEEP_DURATION: Duration = Duration::from_secs(5);

/// Heartbeat interval for claimed jobs (15s)
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// A claim without a heartbeat for this long is considered abandoned (2 minutes)
pub const DEFAULT_LIVENESS_MS: i64 = 2 * 60 * 1000;

/// How often the recovery service scans for abandoned claims (30s)
pub const DEFAULT_RECOVERY_INTERVAL: Duration = Duration::from_secs(30);

/// Time in-flight jobs get to finish on shutdown before they are aborted (30s)
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Time aborted jobs get to release their claim after the grace period (10s)
pub const ABORT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default retry base delay (1000ms = 1s)
pub const DEFAULT_RETRY_BASE_DELAY_MS: i64 = 1000;

/// Attempt ceiling per job, including the first attempt
pub const DEFAULT_MAX_ATTEMPTS: i32 = 2;

/// Publication retries per staged output
pub const DEFAULT_MAX_FINALIZE_ATTEMPTS: i32 = 3;

/// Graceful process shutdown timeout (5 seconds) between SIGTERM and SIGKILL
pub const GRACEFUL_SHUTDOWN_TIMEOUT_MS: i64 = 5000;
