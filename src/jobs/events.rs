//! Diffing consecutive replica scans into per-job events

use std::collections::{BTreeMap, HashSet};

use super::cache::JobCache;
use super::model::JobState;
use crate::runtime::{Replica, ReplicaPhase};

/// What one scan saw of a job
#[derive(Debug, Clone)]
pub struct JobObservation {
    /// Rank 0, or the lowest rank seen
    pub root: Replica,
    /// All replicas, ordered by rank
    pub replicas: Vec<Replica>,
    pub state: JobState,
    pub message: String,
    pub running: usize,
}

impl JobObservation {
    fn from_replicas(mut replicas: Vec<Replica>) -> Option<Self> {
        replicas.sort_by_key(|r| r.rank());
        let root = replicas.first()?.clone();
        let (state, message) = root.state_and_message();
        let running = replicas
            .iter()
            .filter(|r| r.phase() == ReplicaPhase::Running)
            .count();
        Some(Self {
            root,
            replicas,
            state,
            message,
            running,
        })
    }

    /// Status line pushed for this observation
    pub fn status_line(&self) -> String {
        if self.replicas.len() > 1 {
            format!(
                "{} ({}/{} ready)",
                self.message,
                self.running,
                self.replicas.len()
            )
        } else {
            self.message.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: String,
    pub old: Option<JobObservation>,
    pub new: Option<JobObservation>,
}

impl JobEvent {
    /// The job had replicas last scan and has none now
    pub fn was_deleted(&self) -> bool {
        self.old.is_some() && self.new.is_none()
    }

    /// A fully started job that lost replicas, or whose replicas started
    /// finishing. Jobs that never had every replica up are not dying.
    pub fn is_dying(&self, cache: &JobCache) -> bool {
        let (Some(old), Some(new)) = (&self.old, &self.new) else {
            return false;
        };
        let looks_dying = new.replicas.len() < old.replicas.len()
            || new
                .replicas
                .iter()
                .any(|r| r.state_and_message().0.is_final());
        if !looks_dying {
            return false;
        }
        cache
            .get(&self.job_id)
            .is_some_and(|job| job.specification.replicas as usize == old.replicas.len())
    }

    /// The new state, if it differs from the last scan
    pub fn updated_state(&self) -> Option<JobState> {
        let new = self.new.as_ref()?;
        match &self.old {
            Some(old) if old.state == new.state => None,
            _ => Some(new.state),
        }
    }

    /// The new ready count, if it differs from the last scan
    pub fn updated_running(&self) -> Option<usize> {
        let new = self.new.as_ref()?;
        match &self.old {
            Some(old) if old.running == new.running && old.replicas.len() == new.replicas.len() => {
                None
            }
            _ => Some(new.running),
        }
    }

    pub fn is_changed(&self) -> bool {
        self.updated_state().is_some() || self.updated_running().is_some()
    }
}

/// Retains the last scan and turns each new scan into events
#[derive(Debug, Default)]
pub struct ScanTracker {
    last_scan: BTreeMap<String, JobObservation>,
}

impl ScanTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_scan(&self) -> &BTreeMap<String, JobObservation> {
        &self.last_scan
    }

    /// Group the replicas by job and diff against the previous scan. One
    /// event is produced for every job in either scan.
    pub fn process(&mut self, replicas: Vec<Replica>) -> Vec<JobEvent> {
        let mut grouped: BTreeMap<String, Vec<Replica>> = BTreeMap::new();
        for replica in replicas {
            grouped
                .entry(replica.job_id().to_string())
                .or_default()
                .push(replica);
        }

        let mut scan: BTreeMap<String, JobObservation> = grouped
            .into_iter()
            .filter_map(|(id, replicas)| Some((id, JobObservation::from_replicas(replicas)?)))
            .collect();

        let mut events = Vec::with_capacity(self.last_scan.len().max(scan.len()));
        let mut observed = HashSet::new();
        for (job_id, old) in std::mem::take(&mut self.last_scan) {
            let new = scan.get(&job_id).cloned();
            observed.insert(job_id.clone());
            events.push(JobEvent {
                job_id,
                old: Some(old),
                new,
            });
        }
        for (job_id, new) in &scan {
            if observed.contains(job_id) {
                continue;
            }
            events.push(JobEvent {
                job_id: job_id.clone(),
                old: None,
                new: Some(new.clone()),
            });
        }

        std::mem::swap(&mut self.last_scan, &mut scan);
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{
        ContainerReplica, LogStream, NetworkPeer, RuntimeError, ShellSession,
    };
    use async_trait::async_trait;
    use std::sync::Arc;

    #[derive(Debug)]
    struct StaticReplica {
        job_id: String,
        rank: u32,
        phase: ReplicaPhase,
        annotations: BTreeMap<String, String>,
    }

    #[async_trait]
    impl ContainerReplica for StaticReplica {
        fn job_id(&self) -> &str {
            &self.job_id
        }
        fn rank(&self) -> u32 {
            self.rank
        }
        fn phase(&self) -> ReplicaPhase {
            self.phase
        }
        fn node_name(&self) -> Option<&str> {
            None
        }
        fn ip_address(&self) -> Option<&str> {
            None
        }
        fn annotations(&self) -> &BTreeMap<String, String> {
            &self.annotations
        }
        async fn cancel(&self, _force: bool) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn upsert_annotation(&self, _key: &str, _value: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn allow_network_from(&self, _peer: &NetworkPeer) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn allow_network_to(&self, _peer: &NetworkPeer) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn download_logs(&self) -> Result<String, RuntimeError> {
            Ok(String::new())
        }
        async fn follow_logs(&self) -> Result<LogStream, RuntimeError> {
            Err(RuntimeError::Session("not supported".into()))
        }
        async fn open_shell(&self, _command: Vec<String>) -> Result<ShellSession, RuntimeError> {
            Err(RuntimeError::Session("not supported".into()))
        }
    }

    fn replica(job_id: &str, rank: u32, phase: ReplicaPhase) -> Replica {
        Arc::new(StaticReplica {
            job_id: job_id.to_string(),
            rank,
            phase,
            annotations: BTreeMap::new(),
        })
    }

    #[test]
    fn test_new_job_is_a_change() {
        let mut tracker = ScanTracker::new();
        let events = tracker.process(vec![replica("1", 0, ReplicaPhase::Pending)]);
        assert_eq!(events.len(), 1);
        assert!(!events[0].was_deleted());
        assert_eq!(events[0].updated_state(), Some(JobState::InQueue));
    }

    #[test]
    fn test_unchanged_then_deleted() {
        let mut tracker = ScanTracker::new();
        tracker.process(vec![replica("1", 0, ReplicaPhase::Running)]);

        let events = tracker.process(vec![replica("1", 0, ReplicaPhase::Running)]);
        assert_eq!(events.len(), 1);
        assert!(!events[0].is_changed());

        let events = tracker.process(vec![]);
        assert_eq!(events.len(), 1);
        assert!(events[0].was_deleted());
        assert!(tracker.last_scan().is_empty());
    }

    #[test]
    fn test_root_drives_state_and_ready_count() {
        let mut tracker = ScanTracker::new();
        tracker.process(vec![
            replica("1", 1, ReplicaPhase::Pending),
            replica("1", 0, ReplicaPhase::Running),
        ]);
        let events = tracker.process(vec![
            replica("1", 0, ReplicaPhase::Running),
            replica("1", 1, ReplicaPhase::Running),
        ]);

        let event = &events[0];
        assert_eq!(event.updated_state(), None);
        assert_eq!(event.updated_running(), Some(2));
        let new = event.new.as_ref().unwrap();
        assert_eq!(new.root.rank(), 0);
        assert_eq!(new.status_line(), "Job has started (2/2 ready)");
    }

    fn cache_with(job_id: &str, replicas: u32) -> JobCache {
        let cache = JobCache::new();
        let job = serde_json::from_value(serde_json::json!({
            "id": job_id,
            "owner": {"user": "alice"},
            "specification": {
                "replicas": replicas,
                "resources": {"cpu_millis": 1000, "memory_bytes": 0, "gpus": 0},
                "product_category": "cpu",
                "image": "alpine:3"
            }
        }))
        .unwrap();
        cache.insert(job);
        cache
    }

    #[test]
    fn test_started_job_losing_ranks_is_dying() {
        let cache = cache_with("1", 2);
        let mut tracker = ScanTracker::new();
        tracker.process(vec![
            replica("1", 0, ReplicaPhase::Running),
            replica("1", 1, ReplicaPhase::Running),
        ]);

        let failed = tracker.process(vec![
            replica("1", 0, ReplicaPhase::Running),
            replica("1", 1, ReplicaPhase::Failed),
        ]);
        assert_eq!(failed[0].updated_state(), None);
        assert!(failed[0].is_dying(&cache));

        let mut tracker = ScanTracker::new();
        tracker.process(vec![
            replica("1", 0, ReplicaPhase::Running),
            replica("1", 1, ReplicaPhase::Running),
        ]);
        let shrunk = tracker.process(vec![replica("1", 0, ReplicaPhase::Running)]);
        assert!(shrunk[0].is_dying(&cache));
    }

    #[test]
    fn test_partially_started_job_is_not_dying() {
        let cache = cache_with("1", 3);
        let mut tracker = ScanTracker::new();
        tracker.process(vec![
            replica("1", 0, ReplicaPhase::Running),
            replica("1", 1, ReplicaPhase::Running),
        ]);

        let events = tracker.process(vec![replica("1", 0, ReplicaPhase::Running)]);
        assert!(!events[0].is_dying(&cache));
        assert!(!events[0].is_dying(&JobCache::new()));
    }
}
