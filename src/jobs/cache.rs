//! Jobs seen by this process

use dashmap::DashMap;

use super::model::{Job, JobState};

#[derive(Default)]
pub struct JobCache {
    jobs: DashMap<String, Job>,
}

impl JobCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Job) {
        self.jobs.insert(job.id.clone(), job);
    }

    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs.get(job_id).map(|j| j.clone())
    }

    pub fn remove(&self, job_id: &str) -> Option<Job> {
        self.jobs.remove(job_id).map(|(_, job)| job)
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs.contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Whether the job is known and has reached a terminal state
    pub fn is_final(&self, job_id: &str) -> bool {
        self.jobs
            .get(job_id)
            .map(|j| j.status.state.is_final())
            .unwrap_or(false)
    }

    pub fn update_status(&self, job_id: &str, state: JobState, message: Option<String>) {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            job.status.state = state;
            job.status.message = message;
        }
    }

    pub fn update_message(&self, job_id: &str, message: &str) {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            job.status.message = Some(message.to_string());
        }
    }

    /// Apply an arbitrary change to a cached job
    pub fn modify(&self, job_id: &str, f: impl FnOnce(&mut Job)) -> bool {
        match self.jobs.get_mut(job_id) {
            Some(mut job) => {
                f(&mut job);
                true
            }
            None => false,
        }
    }
}
