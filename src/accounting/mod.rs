//! Accounting authority interface
//!
//! The authority owns job registration and billing. This process registers
//! jobs with it, reads resolved jobs back, and pushes every state and
//! status change through [`AccountingClient::update`].

pub mod http;
pub mod reporter;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::jobs::{Job, JobSpecification, JobState, MountSpec};

pub use http::HttpAccountingClient;
pub use reporter::{StateChange, StateReporter};

// ============================================================================
// Data structures (pure, no I/O)
// ============================================================================

/// One change pushed to the authority. Unset fields are left untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<JobState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Only apply if the authority currently records this state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_state: Option<JobState>,
    /// Only apply if the authority currently records a different state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_different_state: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_restart: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_time_allocation_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_mounts: Option<Vec<MountSpec>>,
    pub timestamp: DateTime<Utc>,
}

impl JobUpdate {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            state: None,
            status: None,
            expected_state: None,
            expected_different_state: None,
            allow_restart: None,
            new_time_allocation_secs: None,
            new_mounts: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_time_allocation(mut self, secs: u64) -> Self {
        self.new_time_allocation_secs = Some(secs);
        self
    }
}

#[derive(Error, Debug)]
pub enum AccountingError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Accounting API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Job '{0}' not found")]
    NotFound(String),

    #[error("Accounting authority returned no id for the registered job")]
    MissingId,
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait AccountingClient: Send + Sync {
    /// Register a new job and return its canonical id
    async fn register(
        &self,
        specification: &JobSpecification,
        user: &str,
        project: Option<&str>,
    ) -> Result<String, AccountingError>;

    async fn retrieve(&self, job_id: &str) -> Result<Job, AccountingError>;

    async fn update(&self, updates: Vec<JobUpdate>) -> Result<(), AccountingError>;

    /// Whether the job's owner can pay for it
    async fn check_allocation(&self, job: &Job) -> Result<bool, AccountingError>;

    /// Jobs the authority considers active on this provider
    async fn browse_active(&self) -> Result<Vec<Job>, AccountingError>;
}

// ============================================================================
// SBIO: Mock implementation for testing (no I/O)
// ============================================================================

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use crate::jobs::{JobOwner, JobStatus};

    /// Records pushed updates and keeps registered jobs in memory
    #[derive(Default)]
    pub struct MockAccountingClient {
        pub updates: Mutex<Vec<JobUpdate>>,
        pub jobs: Mutex<BTreeMap<String, Job>>,
        pub deny_allocation: bool,
    }

    impl MockAccountingClient {
        pub fn denying() -> Self {
            Self {
                deny_allocation: true,
                ..Default::default()
            }
        }

        pub fn pushed(&self) -> Vec<JobUpdate> {
            self.updates.lock().unwrap().clone()
        }

        /// States pushed for one job, in order
        pub fn states_of(&self, job_id: &str) -> Vec<JobState> {
            self.pushed()
                .into_iter()
                .filter(|u| u.job_id == job_id)
                .filter_map(|u| u.state)
                .collect()
        }

        pub fn insert_job(&self, job: Job) {
            self.jobs.lock().unwrap().insert(job.id.clone(), job);
        }
    }

    #[async_trait]
    impl AccountingClient for MockAccountingClient {
        async fn register(
            &self,
            specification: &JobSpecification,
            user: &str,
            project: Option<&str>,
        ) -> Result<String, AccountingError> {
            let mut jobs = self.jobs.lock().unwrap();
            let id = (jobs.len() + 1).to_string();
            jobs.insert(
                id.clone(),
                Job {
                    id: id.clone(),
                    owner: JobOwner {
                        user: user.to_string(),
                        project: project.map(str::to_string),
                    },
                    specification: specification.clone(),
                    status: JobStatus::default(),
                },
            );
            Ok(id)
        }

        async fn retrieve(&self, job_id: &str) -> Result<Job, AccountingError> {
            self.jobs
                .lock()
                .unwrap()
                .get(job_id)
                .cloned()
                .ok_or_else(|| AccountingError::NotFound(job_id.to_string()))
        }

        async fn update(&self, updates: Vec<JobUpdate>) -> Result<(), AccountingError> {
            self.updates.lock().unwrap().extend(updates);
            Ok(())
        }

        async fn check_allocation(&self, _job: &Job) -> Result<bool, AccountingError> {
            Ok(!self.deny_allocation)
        }

        async fn browse_active(&self) -> Result<Vec<Job>, AccountingError> {
            Ok(self
                .jobs
                .lock()
                .unwrap()
                .values()
                .filter(|job| !job.status.state.is_final())
                .cloned()
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_skips_unset_fields() {
        let update = JobUpdate::new("7").with_state(JobState::Running);
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["job_id"], "7");
        assert_eq!(json["state"], "RUNNING");
        assert!(json.get("status").is_none());
        assert!(json.get("allow_restart").is_none());
        assert!(json.get("timestamp").is_some());
    }
}
