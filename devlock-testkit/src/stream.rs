use std::sync::Arc;

use async_trait::async_trait;
use devlock::*;
use parking_lot::Mutex;

use crate::store::{Journal, JournalEntry};

#[derive(Debug)]
struct StreamState {
    topic: String,
    partition: i32,
    log: Vec<Vec<u8>>,
    /// Offset of the next record to hand out.
    cursor: i64,
    /// Committed offset, i.e. the first offset not yet acknowledged.
    committed: i64,
    acked: Vec<StreamPosition>,
    rewound: Vec<i64>,
    fail_reads: bool,
    fail_acks: bool,
}

/// Single-partition stream with broker-style commit semantics.
///
/// Records stay in the log forever; [`InMemoryJobStream::simulate_restart`]
/// rewinds delivery to the committed offset the way a consumer group does
/// after a crash.
#[derive(Clone, Debug)]
pub struct InMemoryJobStream {
    state: Arc<Mutex<StreamState>>,
    journal: Option<Journal>,
}

impl InMemoryJobStream {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(StreamState {
                topic: topic.into(),
                partition: 0,
                log: Vec::new(),
                cursor: 0,
                committed: 0,
                acked: Vec::new(),
                rewound: Vec::new(),
                fail_reads: false,
                fail_acks: false,
            })),
            journal: None,
        }
    }

    /// Record acknowledgments in `journal`.
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Append an encoded job.
    pub fn push_job(&self, job: &Job) -> StreamPosition {
        self.push_bytes(&serde_json::to_vec(job).unwrap_or_default())
    }

    /// Append a raw record.
    pub fn push_bytes(&self, payload: &[u8]) -> StreamPosition {
        let mut state = self.state.lock();
        state.log.push(payload.to_vec());
        StreamPosition {
            topic: state.topic.clone(),
            partition: state.partition,
            offset: state.log.len() as i64 - 1,
        }
    }

    /// Positions acknowledged so far, in order.
    pub fn acked(&self) -> Vec<StreamPosition> {
        self.state.lock().acked.clone()
    }

    pub fn acked_offsets(&self) -> Vec<i64> {
        self.state.lock().acked.iter().map(|p| p.offset).collect()
    }

    pub fn committed_offset(&self) -> i64 {
        self.state.lock().committed
    }

    /// Records not yet handed out.
    pub fn remaining(&self) -> usize {
        let state = self.state.lock();
        (state.log.len() as i64 - state.cursor).max(0) as usize
    }

    /// Offsets the consumer asked to read again, in order.
    pub fn rewound_offsets(&self) -> Vec<i64> {
        self.state.lock().rewound.clone()
    }

    /// Rewind delivery to the committed offset.
    pub fn simulate_restart(&self) {
        let mut state = self.state.lock();
        state.cursor = state.committed;
    }

    pub fn fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    pub fn fail_acks(&self, fail: bool) {
        self.state.lock().fail_acks = fail;
    }
}

#[async_trait]
impl JobStream for InMemoryJobStream {
    async fn next(&mut self) -> anyhow::Result<Option<StreamRecord>> {
        let mut state = self.state.lock();
        if state.fail_reads {
            anyhow::bail!("injected stream read failure");
        }
        let Some(payload) = state.log.get(state.cursor as usize).cloned() else {
            return Ok(None);
        };
        let position = StreamPosition {
            topic: state.topic.clone(),
            partition: state.partition,
            offset: state.cursor,
        };
        state.cursor += 1;
        Ok(Some(StreamRecord { position, payload }))
    }

    async fn acknowledge(&mut self, position: &StreamPosition) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock();
            if state.fail_acks {
                anyhow::bail!("injected commit failure");
            }
            state.committed = state.committed.max(position.offset + 1);
            state.acked.push(position.clone());
        }
        if let Some(journal) = &self.journal {
            journal.record(JournalEntry::Ack {
                position: position.clone(),
            });
        }
        Ok(())
    }

    async fn rewind(&mut self, position: &StreamPosition) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock();
            if position.offset < 0 || position.offset as usize >= state.log.len() {
                anyhow::bail!("cannot rewind to {position}: no such record");
            }
            state.cursor = position.offset;
            state.rewound.push(position.offset);
        }
        if let Some(journal) = &self.journal {
            journal.record(JournalEntry::Rewind {
                position: position.clone(),
            });
        }
        Ok(())
    }
}
