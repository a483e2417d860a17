//! Kafka job stream.
//!
//! Auto-commit and automatic offset storing are both off: the cursor moves
//! only when [`JobStream::acknowledge`] commits `offset + 1` for the
//! message's partition. The commit is synchronous, so it runs on the
//! blocking pool.
//!
//! Commits are per partition, so acknowledging a later message would also
//! move the cursor past an earlier unacknowledged one. The consumer never
//! gets that far: an unacknowledged message is re-read through
//! [`JobStream::rewind`], which seeks the partition back to it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{debug, info};

use crate::config::KafkaConfig;
use crate::job::StreamPosition;

use super::{JobStream, StreamRecord};

const SEEK_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the librdkafka client configuration for a job consumer.
pub fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.bootstrap_servers)
        .set("group.id", &config.group_id)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set("auto.offset.reset", "earliest")
        .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string())
        .set("session.timeout.ms", config.session_timeout_ms.to_string());
    for (key, value) in &config.properties {
        client.set(key, value);
    }
    client
}

/// A [`JobStream`] over one Kafka topic.
pub struct KafkaJobStream {
    consumer: Arc<StreamConsumer>,
    topic: String,
}

impl std::fmt::Debug for KafkaJobStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaJobStream")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl KafkaJobStream {
    /// Create the consumer and subscribe to the configured topic.
    pub fn connect(config: &KafkaConfig) -> anyhow::Result<Self> {
        let consumer: StreamConsumer = client_config(config)
            .create()
            .context("failed to create kafka consumer")?;
        consumer
            .subscribe(&[config.topic.as_str()])
            .with_context(|| format!("failed to subscribe to {}", config.topic))?;

        info!(
            topic = %config.topic,
            group_id = %config.group_id,
            bootstrap_servers = %config.bootstrap_servers,
            "kafka job stream subscribed"
        );
        Ok(Self {
            consumer: Arc::new(consumer),
            topic: config.topic.clone(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl JobStream for KafkaJobStream {
    async fn next(&mut self) -> anyhow::Result<Option<StreamRecord>> {
        let message = self.consumer.recv().await.context("kafka receive failed")?;
        let position = StreamPosition {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
        };
        debug!(position = %position, "kafka message received");

        Ok(Some(StreamRecord {
            position,
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        }))
    }

    async fn acknowledge(&mut self, position: &StreamPosition) -> anyhow::Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &position.topic,
                position.partition,
                Offset::Offset(position.offset + 1),
            )
            .context("failed to build commit offsets")?;

        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&offsets, CommitMode::Sync))
            .await
            .context("kafka commit task failed")?
            .with_context(|| format!("kafka commit failed at {position}"))?;

        debug!(position = %position, "kafka offset committed");
        Ok(())
    }

    async fn rewind(&mut self, position: &StreamPosition) -> anyhow::Result<()> {
        let consumer = Arc::clone(&self.consumer);
        let topic = position.topic.clone();
        let partition = position.partition;
        let offset = Offset::Offset(position.offset);
        tokio::task::spawn_blocking(move || {
            consumer.seek(&topic, partition, offset, SEEK_TIMEOUT)
        })
        .await
        .context("kafka seek task failed")?
        .with_context(|| format!("kafka seek failed to {position}"))?;

        debug!(position = %position, "kafka partition rewound");
        Ok(())
    }
}
