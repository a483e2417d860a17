//! In-memory pipeline example.
//!
//! Runs two workers against one shared in-memory lease store, each draining
//! its own scripted stream of jobs that target the same two devices. The
//! device locks keep the workers from touching one device at the same time,
//! and a job whose completion marker already exists is skipped.
//!
//! For a Kafka-fed worker, see `kafka_worker.rs`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devlock::*;
use devlock_testkit::{config_job, InMemoryJobStream};

/// Work that pretends to push configuration over SSH.
struct SimulatedConfigPush {
    worker: &'static str,
}

#[async_trait]
impl DeviceWork for SimulatedConfigPush {
    async fn execute(&self, device: &DeviceName, payload: &JobPayload) -> anyhow::Result<()> {
        println!("[{}] configuring {} with {:?}", self.worker, device, payload);
        tokio::time::sleep(Duration::from_millis(200)).await;
        println!("[{}] finished {}", self.worker, device);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let client = Arc::new(InMemoryLeaseClient::new());
    let store = Arc::new(OffloadedLeaseStore::new(
        Arc::clone(&client),
        &BlockingPoolConfig::default(),
    ));

    // Job 1 was finished by an earlier run.
    let ledger = CompletionLedger::new(Arc::clone(&store), KeyLayout::default());
    ledger.mark_completed(&"1".into()).await?;

    let mut handles = Vec::new();
    for (worker, jobs) in [("edge-a", ["1", "2", "3"]), ("edge-b", ["4", "5", "6"])] {
        let stream = InMemoryJobStream::new("network.config.requests");
        for (i, job_id) in jobs.into_iter().enumerate() {
            let device = if i % 2 == 0 { "r1" } else { "r2" };
            stream.push_job(&config_job(job_id, device));
        }

        let mut orchestrator = JobOrchestratorBuilder::new(
            OrchestratorConfig::new(worker)
                .with_lock_ttl(30)
                .with_lock_acquire_timeout(2_000)
                .with_deferral_backoff(250),
        )
        .with_store(Arc::clone(&store))
        .with_stream(stream)
        .with_work(Arc::new(SimulatedConfigPush { worker }))
        .build()?;

        handles.push(tokio::spawn(async move {
            let summary = orchestrator.run(&ShutdownToken::new()).await?;
            println!("[{worker}] done: {summary:?}");
            anyhow::Ok(summary)
        }));
    }

    for handle in handles {
        handle.await??;
    }

    println!("live leases after shutdown: {}", client.live_leases());
    Ok(())
}
