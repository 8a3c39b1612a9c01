//! Crash recovery: stale claims, daemon restarts and staging leftovers

mod common;

use clipcast_core::application::{
    shutdown_channel, RetryPolicy, Worker, WorkerConfig, WorkerPool,
};
use clipcast_core::domain::{ClipState, EncodeJob, FailureKind, JobState};
use clipcast_core::port::transcoder::mocks::{MockBehavior, MockTranscoder};
use common::{temp_root, wait_until, FlakyPublish, Harness, ProgressTrace};
use std::sync::Arc;
use std::time::Duration;

/// Claim the next job the way a worker would, then never touch it again
async fn claim_as_dead_worker(h: &Harness) -> EncodeJob {
    let (_tx, mut token) = shutdown_channel();
    h.queue
        .dequeue("dead-worker", &mut token)
        .await
        .unwrap()
        .expect("a queued job")
}

#[tokio::test]
async fn test_stale_claim_is_requeued_and_finished() {
    let dir = temp_root();
    let h = Harness::open(dir.path(), MockTranscoder::new_success()).await;

    let job_id = h.enqueue("clip-a").await;
    let claimed = claim_as_dead_worker(&h).await;
    assert_eq!(claimed.id, job_id);
    assert_eq!(claimed.state, JobState::Claimed);

    // Fresh claims are left alone
    let report = h.recovery(60_000).recover_stale_jobs().await.unwrap();
    assert_eq!(report.total(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let report = h.recovery(50).recover_stale_jobs().await.unwrap();
    assert_eq!(report.requeued, 1);

    let job = h.job(&job_id).await;
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.attempt, 2);
    assert_eq!(job.failure, Some(FailureKind::WorkerCrash));
    assert_eq!(h.progress_of("clip-a"), Some(-1));

    let pool = h.start_pool(1);
    h.wait_for_clip("clip-a", ClipState::Ready).await;
    pool.shutdown().await;

    let job = h.job(&job_id).await;
    assert_eq!(job.state, JobState::Done);
    assert_eq!(job.attempt, 2);
    assert_eq!(h.transcoder.calls_for("clip-a"), 1);
}

#[tokio::test]
async fn test_repeated_crashes_fail_the_clip() {
    let dir = temp_root();
    let h = Harness::open(dir.path(), MockTranscoder::new_success()).await;
    let recovery = h.recovery(50);

    let job_id = h.enqueue("clip-a").await;
    for _ in 0..2 {
        claim_as_dead_worker(&h).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        recovery.recover_stale_jobs().await.unwrap();
    }

    let job = h.job(&job_id).await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.failure, Some(FailureKind::WorkerCrash));
    assert_eq!(h.clip_state("clip-a").await, Some(ClipState::Failed));
    assert_eq!(h.progress_of("clip-a"), Some(-2));
    assert!(!h.has_source("clip-a").await);
    assert_eq!(h.transcoder.call_count(), 0);
}

#[tokio::test]
async fn test_leftover_engine_process_is_killed() {
    let dir = temp_root();
    let h = Harness::open(dir.path(), MockTranscoder::new_success()).await;

    h.enqueue("clip-a").await;
    let mut job = claim_as_dead_worker(&h).await;
    let token = job.claim_token.clone().unwrap();
    job.pid = Some(4242);
    assert!(h.queue.persist(&job, &token).await.unwrap());
    h.transcoder.set_alive(4242);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let report = h.recovery(50).recover_stale_jobs().await.unwrap();
    assert_eq!(report.killed, 1);
    assert_eq!(report.requeued, 1);
    assert_eq!(h.transcoder.killed_pids(), vec![4242]);
}

#[tokio::test]
async fn test_worker_dying_mid_encode_is_recovered_and_finished() {
    let dir = temp_root();
    let store = Arc::new(FlakyPublish::open(dir.path(), 0).await);
    let h = Harness::open_with(
        dir.path(),
        MockTranscoder::new(MockBehavior::HangUntilAbort).with_engine_pid(4242),
        store.clone(),
    )
    .await;
    let job_id = h.enqueue("clip-a").await;

    let doomed = Worker::new(
        "doomed",
        h.deps(),
        Arc::new(RetryPolicy::new(
            h.config.retry_base_delay_ms,
            h.config.max_finalize_attempts,
        )),
        h.config.clone(),
    );
    let (_stop, token) = shutdown_channel();
    let task = tokio::spawn(async move { doomed.run(token).await });

    h.wait_for_progress("clip-a", |p| matches!(p, Some(v) if v >= 0))
        .await;
    {
        let (h, job_id) = (&h, &job_id);
        wait_until(move || async move {
            let job = h.job(job_id).await;
            job.state == JobState::Running && job.pid == Some(4242)
        })
        .await;
    }
    let mid_encode = h.progress_of("clip-a").unwrap();
    assert!((0..100).contains(&mid_encode));

    // The worker vanishes without running any of its cleanup
    task.abort();
    let _ = task.await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    let report = h.recovery(50).recover_stale_jobs().await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(report.killed, 1);
    assert_eq!(h.transcoder.killed_pids(), vec![4242]);
    assert_eq!(h.progress_of("clip-a"), Some(-1));

    let job = h.job(&job_id).await;
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.attempt, 2);
    assert_eq!(job.failure, Some(FailureKind::WorkerCrash));

    // Writes from the abandoned attempt no longer move progress
    h.progress.writer("clip-a", 1).report(0.9);
    assert_eq!(h.progress_of("clip-a"), Some(-1));

    let trace = Arc::new(tokio::sync::Mutex::new(ProgressTrace { values: vec![] }));
    let (stop_tx, mut stop_rx) = shutdown_channel();
    let poller = {
        let trace = trace.clone();
        let pipeline = h.pipeline.clone();
        tokio::spawn(async move {
            loop {
                let value = pipeline.progress(&["clip-a".to_string()]).get("clip-a").copied();
                trace.lock().await.push(value);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(2)) => {}
                    _ = stop_rx.wait() => break,
                }
            }
        })
    };

    let rescuer = Arc::new(
        MockTranscoder::new_success().with_step_delay(Duration::from_millis(25)),
    );
    let pool = WorkerPool::start(
        h.deps_with(rescuer.clone()),
        WorkerConfig {
            pool_size: 1,
            ..h.config.clone()
        },
    );
    h.wait_for_clip("clip-a", ClipState::Ready).await;
    h.wait_for_progress("clip-a", |p| p.is_none()).await;
    stop_tx.shutdown();
    poller.await.unwrap();
    pool.shutdown().await;

    let job = h.job(&job_id).await;
    assert_eq!(job.state, JobState::Done);
    assert_eq!(job.attempt, 2);
    assert_eq!(rescuer.calls_for("clip-a"), 1);
    assert_eq!(h.transcoder.calls_for("clip-a"), 1);
    assert_eq!(store.publish_attempts(), 1);

    let trace = trace.lock().await;
    let tracked = trace.tracked();
    assert_eq!(tracked.first(), Some(&-1));
    assert!(
        tracked.windows(2).all(|w| w[0] <= w[1]),
        "progress went backwards: {:?}",
        trace.values
    );
    assert!(tracked.iter().any(|v| (0..=100).contains(v)));
    assert_eq!(trace.values.last(), Some(&None));

    assert!(h.artifacts_of("clip-a").await.is_some());
    assert!(!h.has_source("clip-a").await);

    // Only the dead attempt's directory is left, and the sweep takes it
    let staged = h.staged().await;
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].attempt, 1);
    assert_eq!(h.recovery(60_000).sweep_orphaned_staging().await.unwrap(), 1);
    assert!(h.staged().await.is_empty());
}

#[tokio::test]
async fn test_periodic_recovery_hands_job_to_live_pool() {
    let dir = temp_root();
    let h = Harness::open(dir.path(), MockTranscoder::new_success()).await;

    h.enqueue("clip-a").await;
    claim_as_dead_worker(&h).await;

    let (stop_tx, stop_rx) = shutdown_channel();
    let recovery = Arc::new(h.recovery(100));
    let task = tokio::spawn(recovery.run(Duration::from_millis(50), stop_rx));

    let pool = h.start_pool(1);
    h.wait_for_clip("clip-a", ClipState::Ready).await;
    pool.shutdown().await;

    stop_tx.shutdown();
    task.await.unwrap();
    assert_eq!(h.transcoder.calls_for("clip-a"), 1);
}

#[tokio::test]
async fn test_restart_restores_queued_progress() {
    let dir = temp_root();
    let h = Harness::open(dir.path(), MockTranscoder::new_success()).await;
    h.enqueue("clip-a").await;
    h.enqueue("clip-b").await;
    h.close().await;

    // New process: empty registry, same database and artifact root
    let h = Harness::open(dir.path(), MockTranscoder::new_success()).await;
    assert_eq!(h.progress_of("clip-a"), None);

    let report = h.recovery(60_000).recover_on_startup().await.unwrap();
    assert_eq!(report.total(), 0);
    assert_eq!(h.progress_of("clip-a"), Some(-1));
    assert_eq!(h.progress_of("clip-b"), Some(-1));

    let pool = h.start_pool(2);
    h.wait_for_clip("clip-a", ClipState::Ready).await;
    h.wait_for_clip("clip-b", ClipState::Ready).await;
    pool.shutdown().await;
    assert_eq!(h.progress_of("clip-a"), None);
}

#[tokio::test]
async fn test_restart_reclaims_jobs_of_the_previous_process() {
    let dir = temp_root();
    let h = Harness::open(dir.path(), MockTranscoder::new_success()).await;
    let job_id = h.enqueue("clip-a").await;
    claim_as_dead_worker(&h).await;
    h.close().await;

    let h = Harness::open(dir.path(), MockTranscoder::new_success()).await;
    // Liveness window is irrelevant at startup
    let report = h.recovery(60_000).recover_on_startup().await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(h.progress_of("clip-a"), Some(-1));

    let pool = h.start_pool(1);
    h.wait_for_clip("clip-a", ClipState::Ready).await;
    pool.shutdown().await;

    let job = h.job(&job_id).await;
    assert_eq!(job.state, JobState::Done);
    assert_eq!(job.attempt, 2);
}

#[tokio::test]
async fn test_orphaned_staging_is_swept() {
    let dir = temp_root();
    let h = Harness::open(dir.path(), MockTranscoder::new_success()).await;

    // Leftover of a clip nothing refers to any more
    h.artifacts
        .stage_output(&"clip-gone".to_string(), 1)
        .await
        .unwrap();

    // Directory of a claimed attempt that has not recorded it yet
    h.enqueue("clip-b").await;
    claim_as_dead_worker(&h).await;
    h.artifacts.stage_output(&"clip-b".to_string(), 1).await.unwrap();

    let removed = h.recovery(60_000).sweep_orphaned_staging().await.unwrap();
    assert_eq!(removed, 1);

    let staged = h.staged().await;
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].clip_id, "clip-b");
}
