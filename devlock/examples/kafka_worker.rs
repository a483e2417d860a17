//! Kafka-fed worker example.
//!
//! Consumes jobs from `network.config.requests` on a local broker and
//! processes them one at a time. Device leases and completion markers live
//! in a single-process in-memory store here; a deployment with several
//! workers plugs in a shared store instead (see the `postgres` feature).
//!
//! Run with: `cargo run --example kafka_worker --features kafka`
//!
//! Send a job:
//!
//! ```text
//! echo '{"job_id":"42","device":"r1","vlan":10}' | kcat -P -b localhost:9092 -t network.config.requests
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devlock::*;

/// Stands in for the real device session; replace with SSH or NETCONF calls.
struct SimulatedConfigPush;

#[async_trait]
impl DeviceWork for SimulatedConfigPush {
    async fn execute(&self, device: &DeviceName, payload: &JobPayload) -> anyhow::Result<()> {
        println!("configuring {device}: {payload:?}");
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let stream = KafkaJobStream::connect(&KafkaConfig::default())?;
    let store = Arc::new(OffloadedLeaseStore::new(
        Arc::new(InMemoryLeaseClient::new()),
        &BlockingPoolConfig::default(),
    ));

    let mut orchestrator = JobOrchestratorBuilder::new(OrchestratorConfig::default())
        .with_store(store)
        .with_stream(stream)
        .with_work(Arc::new(SimulatedConfigPush))
        .build()?;

    let shutdown = ShutdownToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("shutdown requested");
            trigger.cancel();
        }
    });

    let summary = orchestrator.run(&shutdown).await?;
    println!("worker stopped: {summary:?}");
    Ok(())
}
