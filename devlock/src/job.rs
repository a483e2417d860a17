use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Opaque remainder of a job message, handed untouched to the work function.
pub type JobPayload = serde_json::Map<String, serde_json::Value>;

/// Identity of a job. Two messages with the same id are the same job.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Name of the target device a job mutates. Locks are taken per device.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceName(String);

impl DeviceName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DeviceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DeviceName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A configuration-change job as carried on the stream.
///
/// The wire form is a flat JSON object with `job_id` and `device`; every
/// other field is kept in [`Job::payload`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub device: DeviceName,
    #[serde(flatten)]
    pub payload: JobPayload,
}

impl Job {
    pub fn new(job_id: impl Into<JobId>, device: impl Into<DeviceName>) -> Self {
        Self {
            job_id: job_id.into(),
            device: device.into(),
            payload: JobPayload::new(),
        }
    }

    /// Attach a payload field.
    pub fn with_field(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Decode a job from its JSON wire form.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Encode a job into its JSON wire form.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Where a message sits in the stream.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct StreamPosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl Display for StreamPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// A decoded job together with the stream position it was read from.
#[derive(Clone, Debug, PartialEq)]
pub struct JobMessage {
    pub job: Job,
    pub position: StreamPosition,
}

/// Stages a job moves through during one orchestrator iteration.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum JobStage {
    Received,
    DedupCheck,
    Skip,
    LockWait,
    Locked,
    Working,
    MarkComplete,
    Ack,
    LockDenied,
    Deferred,
}

impl JobStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStage::Received => "received",
            JobStage::DedupCheck => "dedup_check",
            JobStage::Skip => "skip",
            JobStage::LockWait => "lock_wait",
            JobStage::Locked => "locked",
            JobStage::Working => "working",
            JobStage::MarkComplete => "mark_complete",
            JobStage::Ack => "ack",
            JobStage::LockDenied => "lock_denied",
            JobStage::Deferred => "deferred",
        }
    }
}

impl Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_keeps_extra_fields_as_payload() {
        let bytes = serde_json::to_vec(&json!({
            "job_id": "42",
            "device": "r1",
            "vlan": 120,
            "commands": ["interface Gi0/1", "shutdown"],
        }))
        .unwrap();

        let job = Job::decode(&bytes).unwrap();
        assert_eq!(job.job_id.as_str(), "42");
        assert_eq!(job.device.as_str(), "r1");
        assert_eq!(job.payload.get("vlan"), Some(&json!(120)));
        assert!(!job.payload.contains_key("job_id"));
        assert!(!job.payload.contains_key("device"));
    }

    #[test]
    fn test_decode_rejects_missing_device() {
        let err = Job::decode(br#"{"job_id": "42"}"#).unwrap_err();
        assert!(err.to_string().contains("device"));
    }

    #[test]
    fn test_decode_rejects_non_json() {
        assert!(Job::decode(b"not json").is_err());
    }

    #[test]
    fn test_encoded_form_is_flat() {
        let job = Job::new("7", "sw3").with_field("mtu", 9000);
        let value: serde_json::Value =
            serde_json::from_slice(&job.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"job_id": "7", "device": "sw3", "mtu": 9000}));
    }

    #[test]
    fn test_stream_position_display() {
        let position = StreamPosition {
            topic: "network.config.requests".into(),
            partition: 0,
            offset: 17,
        };
        assert_eq!(position.to_string(), "network.config.requests[0]@17");
    }
}
