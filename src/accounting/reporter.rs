//! Idempotent state pushes to the accounting authority

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use super::{AccountingClient, AccountingError, JobUpdate};
use crate::jobs::{JobCache, JobState};
use crate::runtime::scheduled::StatusSink;

/// A requested state transition
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub state: JobState,
    pub message: String,
    pub allow_restart: Option<bool>,
    pub expected_state: Option<JobState>,
    pub expected_different_state: bool,
}

impl StateChange {
    pub fn new(state: JobState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            allow_restart: None,
            expected_state: None,
            expected_different_state: false,
        }
    }

    pub fn allow_restart(mut self, allow: bool) -> Self {
        self.allow_restart = Some(allow);
        self
    }

    pub fn expect_state(mut self, state: JobState) -> Self {
        self.expected_state = Some(state);
        self
    }

    /// Ask the authority to skip the update if it already records this state
    pub fn expect_different_state(mut self) -> Self {
        self.expected_different_state = true;
        self
    }

    fn into_update(self, job_id: &str) -> JobUpdate {
        let mut update = JobUpdate::new(job_id)
            .with_state(self.state)
            .with_status(self.message);
        update.allow_restart = self.allow_restart;
        update.expected_state = self.expected_state;
        if self.expected_different_state {
            update.expected_different_state = Some(true);
        }
        update
    }
}

/// Remembers what was last pushed for each job and filters out repeats.
/// Once a job is in a terminal state, state changes are refused.
pub struct StateReporter {
    accounting: Arc<dyn AccountingClient>,
    cache: Arc<JobCache>,
    last_pushed: DashMap<String, (JobState, Option<String>)>,
}

impl StateReporter {
    pub fn new(accounting: Arc<dyn AccountingClient>, cache: Arc<JobCache>) -> Self {
        Self {
            accounting,
            cache,
            last_pushed: DashMap::new(),
        }
    }

    pub fn accounting(&self) -> &Arc<dyn AccountingClient> {
        &self.accounting
    }

    pub fn cache(&self) -> &Arc<JobCache> {
        &self.cache
    }

    /// Last state known for a job, from earlier pushes or the job cache
    pub fn current(&self, job_id: &str) -> Option<(JobState, Option<String>)> {
        if let Some(entry) = self.last_pushed.get(job_id) {
            return Some(entry.value().clone());
        }
        self.cache
            .get(job_id)
            .map(|job| (job.status.state, job.status.message))
    }

    /// Push a state change. Returns whether anything was sent.
    pub async fn change_state(
        &self,
        job_id: &str,
        change: StateChange,
    ) -> Result<bool, AccountingError> {
        if let Some((state, message)) = self.current(job_id) {
            if state == change.state && message.as_deref() == Some(change.message.as_str()) {
                return Ok(false);
            }
            if state.is_final() {
                debug!(
                    "Job {} is already {}, ignoring {}",
                    job_id, state, change.state
                );
                return Ok(false);
            }
        }

        let state = change.state;
        let message = change.message.clone();
        self.accounting
            .update(vec![change.into_update(job_id)])
            .await?;

        debug!("Job {} is now {} ({})", job_id, state, message);
        self.cache.update_status(job_id, state, Some(message.clone()));
        self.last_pushed
            .insert(job_id.to_string(), (state, Some(message)));
        Ok(true)
    }

    /// Push a status message without changing state
    pub async fn add_status(&self, job_id: &str, message: &str) -> Result<bool, AccountingError> {
        let current = self.current(job_id);
        if let Some((_, Some(last))) = &current {
            if last == message {
                return Ok(false);
            }
        }

        self.accounting
            .update(vec![JobUpdate::new(job_id).with_status(message)])
            .await?;

        let state = current.map(|(s, _)| s).unwrap_or(JobState::InQueue);
        self.cache.update_message(job_id, message);
        self.last_pushed
            .insert(job_id.to_string(), (state, Some(message.to_string())));
        Ok(true)
    }

    pub async fn push_time_allocation(
        &self,
        job_id: &str,
        secs: u64,
    ) -> Result<(), AccountingError> {
        self.accounting
            .update(vec![JobUpdate::new(job_id).with_time_allocation(secs)])
            .await
    }

    /// Forget a job's push history
    pub fn forget(&self, job_id: &str) {
        self.last_pushed.remove(job_id);
    }
}

#[async_trait]
impl StatusSink for StateReporter {
    async fn post_status(&self, job_id: &str, message: &str) {
        if let Err(e) = self.add_status(job_id, message).await {
            warn!("Failed to post status for job {}: {}", job_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::mock::MockAccountingClient;
    use super::*;

    fn reporter() -> (Arc<MockAccountingClient>, StateReporter) {
        let accounting = Arc::new(MockAccountingClient::default());
        let reporter = StateReporter::new(accounting.clone(), Arc::new(JobCache::new()));
        (accounting, reporter)
    }

    #[tokio::test]
    async fn test_identical_push_is_skipped() {
        let (accounting, reporter) = reporter();
        let change = StateChange::new(JobState::Running, "Job has started");
        assert!(reporter.change_state("1", change.clone()).await.unwrap());
        assert!(!reporter.change_state("1", change).await.unwrap());
        assert_eq!(accounting.pushed().len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_state_is_sticky() {
        let (accounting, reporter) = reporter();
        reporter
            .change_state("1", StateChange::new(JobState::Success, "Job has terminated"))
            .await
            .unwrap();
        let moved = reporter
            .change_state("1", StateChange::new(JobState::Running, "Job has started"))
            .await
            .unwrap();
        assert!(!moved);
        let expired = reporter
            .change_state("1", StateChange::new(JobState::Expired, "Job has expired"))
            .await
            .unwrap();
        assert!(!expired);
        assert_eq!(accounting.pushed().len(), 1);
    }

    #[tokio::test]
    async fn test_status_only_push() {
        let (accounting, reporter) = reporter();
        assert!(reporter.add_status("1", "Assigned to node-a").await.unwrap());
        assert!(!reporter.add_status("1", "Assigned to node-a").await.unwrap());
        let pushed = accounting.pushed();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].state, None);
        assert_eq!(pushed[0].status.as_deref(), Some("Assigned to node-a"));
    }

    #[tokio::test]
    async fn test_change_flags_are_forwarded() {
        let (accounting, reporter) = reporter();
        let change = StateChange::new(JobState::Success, "Job has been cancelled")
            .allow_restart(false)
            .expect_different_state();
        reporter.change_state("9", change).await.unwrap();
        let update = &accounting.pushed()[0];
        assert_eq!(update.allow_restart, Some(false));
        assert_eq!(update.expected_different_state, Some(true));
    }
}
