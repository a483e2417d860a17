//! Job stream consumption.
//!
//! [`JobStream`] is the raw broker seam: it yields undecoded records and
//! commits positions. [`JobConsumer`] sits on top and enforces the
//! pipeline's rules: one message in flight, JSON decoding into [`Job`],
//! acknowledgment only of the message that was handed out, and redelivery of
//! that message until it is acknowledged.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::OrchestratorError;
use crate::job::{Job, JobMessage, StreamPosition};

/// Kafka-backed stream with manual offset commits.
#[cfg(feature = "kafka")]
pub mod kafka;

#[cfg(feature = "kafka")]
pub use kafka::KafkaJobStream;

/// One undecoded message as read from the broker.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamRecord {
    pub position: StreamPosition,
    pub payload: Vec<u8>,
}

/// A durable message stream with manual acknowledgment.
#[async_trait]
pub trait JobStream: Send {
    /// Wait for the next record. `Ok(None)` means the stream has ended.
    async fn next(&mut self) -> anyhow::Result<Option<StreamRecord>>;

    /// Durably advance the consumption cursor past `position`.
    async fn acknowledge(&mut self, position: &StreamPosition) -> anyhow::Result<()>;

    /// Move the read position back so the next [`JobStream::next`] returns
    /// the record at `position` again. Commits are not touched.
    async fn rewind(&mut self, position: &StreamPosition) -> anyhow::Result<()>;
}

#[async_trait]
impl<S: JobStream + ?Sized> JobStream for Box<S> {
    async fn next(&mut self) -> anyhow::Result<Option<StreamRecord>> {
        (**self).next().await
    }

    async fn acknowledge(&mut self, position: &StreamPosition) -> anyhow::Result<()> {
        (**self).acknowledge(position).await
    }

    async fn rewind(&mut self, position: &StreamPosition) -> anyhow::Result<()> {
        (**self).rewind(position).await
    }
}

/// Decoding, one-in-flight adapter over a [`JobStream`].
#[derive(Debug)]
pub struct JobConsumer<St> {
    stream: St,
    pending: Option<StreamPosition>,
}

impl<St: JobStream> JobConsumer<St> {
    pub fn new(stream: St) -> Self {
        Self {
            stream,
            pending: None,
        }
    }

    /// Position of the message handed out and not yet acknowledged.
    pub fn pending(&self) -> Option<&StreamPosition> {
        self.pending.as_ref()
    }

    pub fn stream(&self) -> &St {
        &self.stream
    }

    pub fn into_inner(self) -> St {
        self.stream
    }

    /// Read and decode the next job.
    ///
    /// If the message handed out last was never acknowledged (deferred or
    /// failed), the stream is rewound and that message is returned again, so
    /// no later message can be acknowledged ahead of it. A record that is not
    /// a valid job is returned as [`OrchestratorError::Decode`]; it is never
    /// acknowledged and never redelivered by this consumer.
    pub async fn next(&mut self) -> Result<Option<JobMessage>, OrchestratorError> {
        if let Some(unacked) = &self.pending {
            debug!(position = %unacked, "redelivering unacknowledged message");
            self.stream
                .rewind(unacked)
                .await
                .map_err(OrchestratorError::StreamUnavailable)?;
            self.pending = None;
        }

        let Some(record) = self
            .stream
            .next()
            .await
            .map_err(OrchestratorError::StreamUnavailable)?
        else {
            return Ok(None);
        };

        let job = Job::decode(&record.payload).map_err(|source| {
            warn!(position = %record.position, error = %source, "undecodable job message");
            OrchestratorError::Decode {
                position: record.position.clone(),
                source,
            }
        })?;

        self.pending = Some(record.position.clone());
        Ok(Some(JobMessage {
            job,
            position: record.position,
        }))
    }

    /// Commit the message last handed out by [`JobConsumer::next`].
    ///
    /// Returns `Ok(false)` without touching the broker if `message` is not
    /// the one in flight.
    pub async fn acknowledge(&mut self, message: &JobMessage) -> Result<bool, OrchestratorError> {
        if self.pending.as_ref() != Some(&message.position) {
            warn!(
                job_id = %message.job.job_id,
                position = %message.position,
                "acknowledge for a message that is not in flight ignored"
            );
            return Ok(false);
        }

        self.stream
            .acknowledge(&message.position)
            .await
            .map_err(OrchestratorError::StreamUnavailable)?;
        self.pending = None;
        debug!(job_id = %message.job.job_id, position = %message.position, "message acknowledged");
        Ok(true)
    }
}
