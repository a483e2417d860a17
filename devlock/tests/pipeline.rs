//! End-to-end behavior of the job pipeline over the in-memory fakes.

use std::sync::Arc;
use std::time::Duration;

use devlock::*;
use devlock_testkit::*;
use tokio::time::timeout;

type Store = OffloadedLeaseStore<JournaledLeaseClient>;
type Orchestrator = JobOrchestrator<Store, InMemoryJobStream, ScriptedWork>;

struct Harness {
    journal: Journal,
    client: JournaledLeaseClient,
    stream: InMemoryJobStream,
    work: ScriptedWork,
    orchestrator: Orchestrator,
}

fn test_config() -> OrchestratorConfig {
    OrchestratorConfig::new("worker-a")
        .with_lock_acquire_timeout(50)
        .with_deferral_backoff(20)
}

fn harness(config: OrchestratorConfig) -> Harness {
    let journal = Journal::new();
    let client = JournaledLeaseClient::new(journal.clone());
    harness_on(client, config, None)
}

fn harness_on(
    client: JournaledLeaseClient,
    config: OrchestratorConfig,
    backoff: Option<Arc<dyn BackoffPolicy>>,
) -> Harness {
    let journal = client.journal().clone();
    let stream = InMemoryJobStream::new("network.config.requests").with_journal(journal.clone());
    let work = ScriptedWork::new().with_journal(journal.clone());

    let mut builder = JobOrchestratorBuilder::new(config)
        .with_store(client.offloaded())
        .with_stream(stream.clone())
        .with_work(Arc::new(work.clone()));
    if let Some(backoff) = backoff {
        builder = builder.with_backoff(backoff);
    }

    Harness {
        journal,
        client,
        stream,
        work,
        orchestrator: builder.build().expect("orchestrator should build"),
    }
}

fn is_ack(entry: &JournalEntry) -> bool {
    matches!(entry, JournalEntry::Ack { .. })
}

#[tokio::test]
async fn fresh_job_runs_is_marked_and_acknowledged() {
    let mut h = harness(test_config());
    h.stream.push_job(&config_job("42", "r1"));

    let outcome = h.orchestrator.process_next().await.unwrap();

    assert_eq!(
        outcome,
        Some(JobOutcome::Completed {
            job_id: "42".into(),
            device: "r1".into(),
            lock_released: true,
        })
    );
    assert!(h.client.is_completed("42"));
    assert_eq!(h.stream.acked_offsets(), vec![0]);
    h.work.assert_call_count_eq(1);
    assert_eq!(h.work.calls()[0].payload.get("vlan"), Some(&serde_json::json!(10)));
    assert_eq!(h.client.device_holder("r1"), None);
}

#[tokio::test]
async fn marker_is_written_before_ack_and_lock_released_after() {
    let mut h = harness(test_config());
    h.stream.push_job(&config_job("42", "r1"));

    h.orchestrator.process_next().await.unwrap();

    let acquired = h
        .journal
        .position(|e| matches!(e, JournalEntry::Acquire { granted: true, .. }))
        .expect("lock acquired");
    let worked = h
        .journal
        .position(|e| matches!(e, JournalEntry::Work { .. }))
        .expect("work ran");
    let marked = h
        .journal
        .position(|e| matches!(e, JournalEntry::Put { key, .. } if key == "/jobs/42/status"))
        .expect("marker written");
    let acked = h.journal.position(is_ack).expect("message acknowledged");
    let released = h
        .journal
        .position(|e| matches!(e, JournalEntry::Release { released: true, .. }))
        .expect("lock released");

    assert!(acquired < worked);
    assert!(worked < marked);
    assert!(marked < acked);
    assert!(acked < released);
}

#[tokio::test]
async fn completed_job_is_acknowledged_without_work_or_locking() {
    let mut h = harness(test_config());
    h.client.seed_completed("42");
    h.stream.push_job(&config_job("42", "r1"));

    let outcome = h.orchestrator.process_next().await.unwrap();

    assert_eq!(outcome, Some(JobOutcome::Skipped { job_id: "42".into() }));
    h.work.assert_call_count_eq(0);
    assert_eq!(h.stream.acked_offsets(), vec![0]);
    assert_eq!(
        h.journal
            .count(|e| matches!(e, JournalEntry::Acquire { .. })),
        0
    );
}

#[tokio::test]
async fn redelivery_after_crash_between_mark_and_ack_short_circuits() {
    let mut h = harness(test_config());
    h.stream.push_job(&config_job("42", "r1"));
    h.stream.fail_acks(true);

    let err = h.orchestrator.process_next().await.unwrap_err();
    assert!(matches!(err, OrchestratorError::StreamUnavailable(_)));
    assert!(err.is_fatal());
    assert!(h.client.is_completed("42"));
    assert!(h.stream.acked().is_empty());
    assert_eq!(h.client.device_holder("r1"), None);

    // Broker restarts from the last commit and redelivers the job.
    h.stream.fail_acks(false);
    h.stream.simulate_restart();

    let outcome = h.orchestrator.process_next().await.unwrap();
    assert_eq!(outcome, Some(JobOutcome::Skipped { job_id: "42".into() }));
    h.work.assert_call_count_eq(1);
    assert_eq!(h.stream.acked_offsets(), vec![0]);
}

#[tokio::test]
async fn held_device_defers_without_ack_or_mark() {
    let mut h = harness(test_config());
    h.client
        .hold_device("r1", "worker-b", Duration::from_secs(60))
        .expect("other worker takes r1");
    h.stream.push_job(&config_job("43", "r1"));

    let outcome = h.orchestrator.process_next().await.unwrap();

    assert_eq!(
        outcome,
        Some(JobOutcome::Deferred {
            job_id: "43".into(),
            device: "r1".into(),
            reason: DeferralReason::LockHeld {
                holder: Some("worker-b".to_string()),
            },
            backoff: Duration::from_millis(20),
        })
    );
    assert!(h.stream.acked().is_empty());
    assert_eq!(h.stream.committed_offset(), 0);
    assert_eq!(h.client.status_of("43"), None);
    h.work.assert_call_count_eq(0);
    assert_eq!(h.client.device_holder("r1").as_deref(), Some("worker-b"));
    assert_eq!(h.orchestrator.consecutive_deferrals(), 1);
}

#[tokio::test]
async fn work_failure_releases_lock_without_mark_or_ack() {
    let mut h = harness(test_config());
    h.work.then(WorkBehavior::Fail("device rejected config".into()));
    h.stream.push_job(&config_job("44", "r1"));

    let err = h.orchestrator.process_next().await.unwrap_err();

    assert!(matches!(err, OrchestratorError::WorkFailure { .. }));
    assert!(err.is_retryable());
    assert!(!err.is_fatal());
    assert!(err.to_string().contains("device rejected config"));
    assert!(!h.client.is_completed("44"));
    assert!(h.stream.acked().is_empty());
    assert_eq!(h.client.device_holder("r1"), None);
    assert_eq!(
        h.journal
            .count(|e| matches!(e, JournalEntry::Release { released: true, .. })),
        1
    );
}

#[tokio::test]
async fn work_timeout_is_a_failure_and_releases_lock() {
    let mut h = harness(test_config().with_work_timeout(50));
    h.work.then(WorkBehavior::Hang);
    h.stream.push_job(&config_job("45", "r1"));

    let err = h.orchestrator.process_next().await.unwrap_err();

    match err {
        OrchestratorError::WorkTimedOut { job_id, timeout, .. } => {
            assert_eq!(job_id.as_str(), "45");
            assert_eq!(timeout, Duration::from_millis(50));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!h.client.is_completed("45"));
    assert!(h.stream.acked().is_empty());
    assert_eq!(h.client.device_holder("r1"), None);
}

#[tokio::test]
async fn ledger_read_failure_falls_through_to_locking() {
    let mut h = harness(test_config());
    h.client.fail_get(true);
    h.stream.push_job(&config_job("46", "r1"));

    let outcome = h.orchestrator.process_next().await.unwrap();

    assert!(matches!(outcome, Some(JobOutcome::Completed { .. })));
    h.work.assert_call_count_eq(1);
    assert!(h.client.is_completed("46"));
}

#[tokio::test]
async fn ledger_write_failure_prevents_ack() {
    let mut h = harness(test_config());
    h.client.fail_put(true);
    h.stream.push_job(&config_job("47", "r1"));

    let err = h.orchestrator.process_next().await.unwrap_err();

    assert!(matches!(err, OrchestratorError::LedgerUnavailable { .. }));
    assert!(err.is_retryable());
    h.work.assert_call_count_eq(1);
    assert!(h.stream.acked().is_empty());
    assert_eq!(h.client.device_holder("r1"), None);
}

#[tokio::test]
async fn unreachable_lease_store_is_fatal() {
    let mut h = harness(test_config());
    h.client.fail_acquire(true);
    h.stream.push_job(&config_job("48", "r1"));

    let err = h.orchestrator.process_next().await.unwrap_err();

    assert!(matches!(err, OrchestratorError::LeaseStoreUnreachable(_)));
    assert!(err.is_fatal());
    h.work.assert_call_count_eq(0);
    assert!(h.stream.acked().is_empty());
}

#[tokio::test]
async fn release_failure_does_not_undo_completed_work() {
    let mut h = harness(test_config());
    h.client.fail_release(true);
    h.stream.push_job(&config_job("49", "r1"));

    let outcome = h.orchestrator.process_next().await.unwrap();

    assert_eq!(
        outcome,
        Some(JobOutcome::Completed {
            job_id: "49".into(),
            device: "r1".into(),
            lock_released: false,
        })
    );
    assert!(h.client.is_completed("49"));
    assert_eq!(h.stream.acked_offsets(), vec![0]);
}

#[tokio::test]
async fn expired_lease_of_crashed_holder_is_taken_over() {
    let mut h = harness(test_config().with_lock_acquire_timeout(2_000));
    h.client
        .hold_device("r1", "crashed-worker", Duration::from_millis(100))
        .expect("crashed worker took r1");
    h.stream.push_job(&config_job("50", "r1"));

    let outcome = h.orchestrator.process_next().await.unwrap();

    assert!(matches!(outcome, Some(JobOutcome::Completed { .. })));
    assert!(h.client.is_completed("50"));
}

#[tokio::test]
async fn exponential_backoff_grows_with_consecutive_deferrals() {
    let journal = Journal::new();
    let client = JournaledLeaseClient::new(journal);
    let backoff = Arc::new(ExponentialBackoff::new(BackoffConfig {
        base_delay_ms: 10,
        max_backoff_ms: 1_000,
    }));
    let mut h = harness_on(client, test_config(), Some(backoff));
    let other = h
        .client
        .hold_device("r1", "worker-b", Duration::from_secs(60))
        .expect("other worker takes r1");
    h.stream.push_job(&config_job("51", "r1"));

    let mut delays = Vec::new();
    for _ in 0..2 {
        match h.orchestrator.process_next().await.unwrap() {
            Some(JobOutcome::Deferred { backoff, .. }) => delays.push(backoff),
            other => panic!("expected deferral, got {other:?}"),
        }
    }
    assert_eq!(delays, vec![Duration::from_millis(10), Duration::from_millis(20)]);
    assert_eq!(h.orchestrator.consecutive_deferrals(), 2);

    assert!(h.client.inner().release(&other).unwrap());
    let outcome = h.orchestrator.process_next().await.unwrap();
    assert!(matches!(outcome, Some(JobOutcome::Completed { .. })));
    assert_eq!(h.orchestrator.consecutive_deferrals(), 0);
}

#[tokio::test]
async fn run_drains_stream_and_summarizes() {
    let mut h = harness(test_config());
    h.client.seed_completed("60");
    // Lapses while the job waits, so the deferred job goes through on a retry.
    h.client
        .hold_device("r9", "worker-b", Duration::from_millis(300))
        .expect("other worker takes r9");
    h.stream.push_job(&config_job("60", "r1"));
    h.stream.push_job(&config_job("61", "r9"));
    h.stream.push_bytes(b"{not json");
    h.stream.push_job(&config_job("62", "r2"));

    let summary = timeout(Duration::from_secs(5), h.orchestrator.run(&ShutdownToken::new()))
        .await
        .expect("run should finish once the stream is drained")
        .unwrap();

    assert_eq!(summary.completed, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.malformed, 1);
    assert_eq!(summary.failed, 0);
    assert!(summary.deferred >= 1);
    assert_eq!(h.stream.acked_offsets(), vec![0, 1, 3]);
    assert!(h.client.is_completed("61"));
    assert!(h.client.is_completed("62"));
}

#[tokio::test]
async fn deferred_job_is_redelivered_before_later_messages() {
    let mut h = harness(test_config());
    let other = h
        .client
        .hold_device("r9", "worker-b", Duration::from_secs(60))
        .expect("other worker takes r9");
    h.stream.push_job(&config_job("61", "r9"));
    h.stream.push_job(&config_job("62", "r2"));

    for _ in 0..2 {
        let outcome = h.orchestrator.process_next().await.unwrap();
        assert!(matches!(outcome, Some(JobOutcome::Deferred { ref job_id, .. }) if job_id.as_str() == "61"));
    }
    assert_eq!(h.stream.committed_offset(), 0);
    assert_eq!(h.stream.rewound_offsets(), vec![0]);
    h.work.assert_call_count_eq(0);

    assert!(h.client.inner().release(&other).unwrap());

    let outcome = h.orchestrator.process_next().await.unwrap();
    assert!(matches!(outcome, Some(JobOutcome::Completed { ref job_id, .. }) if job_id.as_str() == "61"));
    let outcome = h.orchestrator.process_next().await.unwrap();
    assert!(matches!(outcome, Some(JobOutcome::Completed { ref job_id, .. }) if job_id.as_str() == "62"));

    assert_eq!(h.stream.acked_offsets(), vec![0, 1]);
    let devices: Vec<String> = h
        .work
        .calls()
        .into_iter()
        .map(|call| call.device.to_string())
        .collect();
    assert_eq!(devices, vec!["r9", "r2"]);
}

#[tokio::test]
async fn busy_device_stalls_run_without_committing_past_it() {
    let mut h = harness(test_config());
    let other = h
        .client
        .hold_device("r9", "worker-b", Duration::from_secs(60))
        .expect("other worker takes r9");
    h.stream.push_job(&config_job("61", "r9"));
    h.stream.push_job(&config_job("62", "r2"));

    let shutdown = ShutdownToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });
    let summary = timeout(Duration::from_secs(5), h.orchestrator.run(&shutdown))
        .await
        .expect("shutdown should stop the run")
        .unwrap();

    assert_eq!(summary.completed, 0);
    assert!(summary.deferred >= 2);
    assert_eq!(h.stream.committed_offset(), 0);
    h.work.assert_call_count_eq(0);

    // Lock frees up; the restarted worker picks up where the cursor stopped.
    assert!(h.client.inner().release(&other).unwrap());
    h.stream.simulate_restart();
    let summary = timeout(Duration::from_secs(5), h.orchestrator.run(&ShutdownToken::new()))
        .await
        .expect("run should drain the stream")
        .unwrap();

    assert_eq!(summary.completed, 2);
    assert!(h.client.is_completed("61"));
    assert!(h.client.is_completed("62"));
    let first_ack = h.journal.position(is_ack).expect("acknowledged");
    let r2_work = h
        .journal
        .position(|e| matches!(e, JournalEntry::Work { device } if device == "r2"))
        .expect("r2 work ran");
    assert!(first_ack < r2_work);
    assert_eq!(h.stream.acked_offsets(), vec![0, 1]);
}

#[tokio::test]
async fn run_retries_failed_message_by_default() {
    let mut h = harness(test_config());
    h.work.then(WorkBehavior::Fail("timeout talking to device".into()));
    h.stream.push_job(&config_job("70", "r1"));
    h.stream.push_job(&config_job("71", "r1"));

    let summary = h.orchestrator.run(&ShutdownToken::new()).await.unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.completed, 2);
    assert!(h.client.is_completed("70"));
    assert!(h.client.is_completed("71"));
    assert_eq!(h.stream.acked_offsets(), vec![0, 1]);
    h.work.assert_call_count_eq(3);
    assert_eq!(h.stream.rewound_offsets(), vec![0]);
}

#[tokio::test]
async fn run_halts_on_work_failure_when_configured() {
    let mut h = harness(test_config().with_work_failure_policy(FailurePolicy::Halt));
    h.work.then(WorkBehavior::Fail("boom".into()));
    h.stream.push_job(&config_job("72", "r1"));
    h.stream.push_job(&config_job("73", "r1"));

    let err = h.orchestrator.run(&ShutdownToken::new()).await.unwrap_err();

    assert!(matches!(err, OrchestratorError::WorkFailure { .. }));
    assert_eq!(h.stream.remaining(), 1);
    h.work.assert_call_count_eq(1);
}

#[tokio::test]
async fn run_stops_on_stream_failure() {
    let mut h = harness(test_config());
    h.stream.push_job(&config_job("74", "r1"));
    h.stream.fail_reads(true);

    let err = h.orchestrator.run(&ShutdownToken::new()).await.unwrap_err();

    assert!(err.is_fatal());
    h.work.assert_call_count_eq(0);
}

#[tokio::test]
async fn cancelled_token_stops_run_before_reading() {
    let mut h = harness(test_config());
    h.stream.push_job(&config_job("75", "r1"));
    let shutdown = ShutdownToken::new();
    shutdown.cancel();

    let summary = h.orchestrator.run(&shutdown).await.unwrap();

    assert_eq!(summary, RunSummary::default());
    assert_eq!(h.stream.remaining(), 1);
}

#[tokio::test]
async fn shutdown_interrupts_deferral_backoff() {
    let mut h = harness(test_config().with_deferral_backoff(60_000));
    h.client
        .hold_device("r1", "worker-b", Duration::from_secs(60))
        .expect("other worker takes r1");
    h.stream.push_job(&config_job("76", "r1"));
    h.stream.push_job(&config_job("77", "r2"));

    let shutdown = ShutdownToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let summary = timeout(Duration::from_secs(5), h.orchestrator.run(&shutdown))
        .await
        .expect("shutdown should cut the backoff short")
        .unwrap();

    assert_eq!(summary.deferred, 1);
    assert_eq!(summary.completed, 0);
    assert_eq!(h.stream.remaining(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_sharing_a_store_never_overlap_on_a_device() {
    let shared = JournaledLeaseClient::new(Journal::new());
    let work = ScriptedWork::with_default(WorkBehavior::Delay(Duration::from_millis(30)));

    let mut workers = Vec::new();
    for (worker, jobs) in [("worker-a", ["80", "81", "82"]), ("worker-b", ["90", "91", "92"])] {
        let stream = InMemoryJobStream::new("network.config.requests");
        for job_id in jobs {
            stream.push_job(&config_job(job_id, "r1"));
        }
        let orchestrator = JobOrchestratorBuilder::new(
            OrchestratorConfig::new(worker)
                .with_lock_acquire_timeout(5_000)
                .with_deferral_backoff(10),
        )
        .with_store(shared.sharing(Journal::new()).offloaded())
        .with_stream(stream)
        .with_work(Arc::new(work.clone()))
        .build()
        .unwrap();
        workers.push(orchestrator);
    }

    let mut handles = Vec::new();
    for mut orchestrator in workers {
        handles.push(tokio::spawn(async move {
            orchestrator.run(&ShutdownToken::new()).await
        }));
    }

    let mut completed = 0;
    for handle in handles {
        let summary = timeout(Duration::from_secs(10), handle)
            .await
            .expect("workers should drain their streams")
            .expect("worker task panicked")
            .unwrap();
        completed += summary.completed;
    }

    assert_eq!(completed, 6);
    assert_eq!(work.call_count(), 6);
    assert_eq!(work.peak_concurrency("r1"), 1);
    for job_id in ["80", "81", "82", "90", "91", "92"] {
        assert!(shared.is_completed(job_id));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn work_outlasting_the_lease_is_cut_off_before_the_lease_lapses() {
    let shared = JournaledLeaseClient::new(Journal::new());
    let work = ScriptedWork::with_default(WorkBehavior::Delay(Duration::from_millis(1_600)));

    let mut orchestrators = Vec::new();
    for (worker, job_id) in [("worker-a", "90"), ("worker-b", "91")] {
        let stream = InMemoryJobStream::new("network.config.requests");
        stream.push_job(&config_job(job_id, "r1"));
        let orchestrator = JobOrchestratorBuilder::new(
            OrchestratorConfig::new(worker)
                .with_lock_ttl(1)
                .with_lock_acquire_timeout(3_000),
        )
        .with_store(shared.sharing(Journal::new()).offloaded())
        .with_stream(stream)
        .with_work(Arc::new(work.clone()))
        .build()
        .unwrap();
        orchestrators.push(orchestrator);
    }
    let mut second = orchestrators.pop().unwrap();
    let mut first = orchestrators.pop().unwrap();

    let (a, b) = tokio::join!(first.process_next(), second.process_next());

    for result in [a, b] {
        match result {
            Err(OrchestratorError::WorkTimedOut { timeout, .. }) => {
                assert_eq!(timeout, Duration::from_millis(800));
            }
            other => panic!("expected work timeout, got {other:?}"),
        }
    }
    assert_eq!(work.call_count(), 2);
    assert_eq!(work.peak_concurrency("r1"), 1);
    assert!(!shared.is_completed("90"));
    assert!(!shared.is_completed("91"));
}
