//! Job data model shared by the manager, the runtimes and the API

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::ResourceRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    InQueue,
    Running,
    Success,
    Failure,
    Expired,
    Suspended,
}

impl JobState {
    /// Terminal states are never left once reached
    pub fn is_final(&self) -> bool {
        matches!(self, JobState::Success | JobState::Failure | JobState::Expired)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::InQueue => "IN_QUEUE",
            JobState::Running => "RUNNING",
            JobState::Success => "SUCCESS",
            JobState::Failure => "FAILURE",
            JobState::Expired => "EXPIRED",
            JobState::Suspended => "SUSPENDED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOwner {
    pub user: String,
    #[serde(default)]
    pub project: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Path on the node
    pub source: String,
    /// Path inside the container
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

fn default_replicas() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpecification {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    pub resources: ResourceRequest,
    pub product_category: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    /// Jobs whose replicas may exchange traffic with this one
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default)]
    pub max_time_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub state: JobState,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self {
            state: JobState::InQueue,
            message: None,
            started_at: None,
            expires_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub owner: JobOwner,
    pub specification: JobSpecification,
    #[serde(default)]
    pub status: JobStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_states() {
        assert!(JobState::Success.is_final());
        assert!(JobState::Failure.is_final());
        assert!(JobState::Expired.is_final());
        assert!(!JobState::Running.is_final());
        assert!(!JobState::Suspended.is_final());
    }

    #[test]
    fn test_state_wire_format() {
        assert_eq!(serde_json::to_string(&JobState::InQueue).unwrap(), "\"IN_QUEUE\"");
        assert_eq!(JobState::Expired.to_string(), "EXPIRED");
    }

    #[test]
    fn test_specification_defaults() {
        let spec: JobSpecification = serde_json::from_value(serde_json::json!({
            "resources": {"cpu_millis": 1000, "memory_bytes": 1073741824, "gpus": 0},
            "product_category": "cpu",
            "image": "alpine:3"
        }))
        .unwrap();
        assert_eq!(spec.replicas, 1);
        assert!(spec.peers.is_empty());
        assert_eq!(spec.max_time_secs, None);
    }
}
