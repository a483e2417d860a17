use async_trait::async_trait;
use devlock::*;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use crate::store::{Journal, JournalEntry};

/// What one scripted work call does.
#[derive(Clone, Debug)]
pub enum WorkBehavior {
    Succeed,
    Fail(String),
    /// Sleep, then succeed.
    Delay(Duration),
    /// Never finish.
    Hang,
}

#[derive(Clone, Debug)]
pub struct WorkCall {
    pub device: DeviceName,
    pub payload: JobPayload,
}

#[derive(Debug, Default)]
struct Occupancy {
    active: HashMap<String, usize>,
    peak: HashMap<String, usize>,
}

/// Device work fake that records calls and follows a script.
///
/// Calls consume the script front to back; once it is empty every call
/// behaves like the default behavior.
#[derive(Clone, Debug)]
pub struct ScriptedWork {
    calls: Arc<Mutex<Vec<WorkCall>>>,
    script: Arc<Mutex<VecDeque<WorkBehavior>>>,
    default: Arc<Mutex<WorkBehavior>>,
    occupancy: Arc<Mutex<Occupancy>>,
    journal: Option<Journal>,
}

impl ScriptedWork {
    pub fn new() -> Self {
        Self::with_default(WorkBehavior::Succeed)
    }

    pub fn with_default(behavior: WorkBehavior) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(VecDeque::new())),
            default: Arc::new(Mutex::new(behavior)),
            occupancy: Arc::new(Mutex::new(Occupancy::default())),
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Queue behavior for the next call.
    pub fn then(&self, behavior: WorkBehavior) -> &Self {
        self.script.lock().push_back(behavior);
        self
    }

    pub fn set_default(&self, behavior: WorkBehavior) {
        *self.default.lock() = behavior;
    }

    pub fn calls(&self) -> Vec<WorkCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn assert_call_count_eq(&self, expected: usize) {
        let actual = self.calls.lock().len();
        assert_eq!(
            actual, expected,
            "Expected {} work calls, got {}",
            expected, actual
        );
    }

    /// Highest number of overlapping calls seen for one device.
    pub fn peak_concurrency(&self, device: &str) -> usize {
        self.occupancy.lock().peak.get(device).copied().unwrap_or(0)
    }

    fn enter(&self, device: &DeviceName) {
        let mut occupancy = self.occupancy.lock();
        let active = {
            let active = occupancy.active.entry(device.to_string()).or_insert(0);
            *active += 1;
            *active
        };
        let peak = occupancy.peak.entry(device.to_string()).or_insert(0);
        *peak = (*peak).max(active);
    }

    fn leave(&self, device: &DeviceName) {
        if let Some(active) = self.occupancy.lock().active.get_mut(device.as_str()) {
            *active = active.saturating_sub(1);
        }
    }
}

impl Default for ScriptedWork {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements occupancy even when the call is cancelled.
struct Occupied<'a> {
    work: &'a ScriptedWork,
    device: &'a DeviceName,
}

impl Drop for Occupied<'_> {
    fn drop(&mut self) {
        self.work.leave(self.device);
    }
}

#[async_trait]
impl DeviceWork for ScriptedWork {
    async fn execute(&self, device: &DeviceName, payload: &JobPayload) -> anyhow::Result<()> {
        self.calls.lock().push(WorkCall {
            device: device.clone(),
            payload: payload.clone(),
        });
        if let Some(journal) = &self.journal {
            journal.record(JournalEntry::Work {
                device: device.to_string(),
            });
        }

        let behavior = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default.lock().clone());

        self.enter(device);
        let _occupied = Occupied { work: self, device };

        match behavior {
            WorkBehavior::Succeed => Ok(()),
            WorkBehavior::Fail(message) => Err(anyhow::anyhow!(message)),
            WorkBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            WorkBehavior::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }
}
