//! Container runtimes
//!
//! A runtime turns a [`ContainerBuilder`] into workloads on the cluster and
//! reports the replicas it manages. Three backends share the builder and
//! the pod-backed replica type:
//!
//! - [`batch::BatchRuntime`]: one batch-workload object per job, placement
//!   left to the cluster's batch scheduler
//! - [`pods::PodRuntime`]: one bare pod per replica
//! - [`scheduled::ScheduledRuntime`]: bare pods pinned to nodes chosen by
//!   the in-process bin-packing scheduler

pub mod batch;
pub mod builder;
pub mod pods;
pub mod replica;
pub mod scheduled;
pub mod session;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

use crate::jobs::JobState;
use crate::k8s::{ClientError, ResourceClient, ResourceLocator};
use crate::scheduler::{ResourceRequest, SchedulerError};

pub use builder::{ContainerBuilder, NetworkPeer};
pub use replica::PodReplica;
pub use session::{LogStream, ShellInput, ShellOutput, ShellSession, Tunnel, TunnelOpener};

/// Label shared by every workload object of a job
pub const JOB_LABEL: &str = "volcano.sh/job-name";
/// Label carrying the replica rank on bare pods
pub const RANK_LABEL: &str = "clusterjobs/rank";
/// Name of the container running the user's workload
pub const CONTAINER_NAME: &str = "user-job";

/// Errors from runtime operations
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Cluster API error: {0}")]
    Client(#[from] ClientError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Replica {0}/{1} not found")]
    ReplicaNotFound(String, u32),

    #[error("Creating {name} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        name: String,
        attempts: u32,
        source: ClientError,
    },

    #[error("Tunnel failed: {0}")]
    Tunnel(String),

    #[error("Session failed: {0}")]
    Session(String),
}

// ============================================================================
// Naming
// ============================================================================

/// Name shared by the job's batch object and headless service
pub fn job_name(job_id: &str) -> String {
    format!("j-{job_id}")
}

pub fn workload_name(job_id: &str, rank: u32) -> String {
    format!("j-{job_id}-job-{rank}")
}

pub fn policy_name(job_id: &str) -> String {
    format!("policy-{job_id}")
}

/// Parse `j-{id}-job-{rank}` back into its parts
pub fn parse_workload_name(name: &str) -> Option<(String, u32)> {
    let rest = name.strip_prefix("j-")?;
    let (job_id, rank) = rest.rsplit_once("-job-")?;
    if job_id.is_empty() {
        return None;
    }
    Some((job_id.to_string(), rank.parse().ok()?))
}

// ============================================================================
// Replicas
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl ReplicaPhase {
    pub fn from_pod_phase(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => ReplicaPhase::Pending,
            Some("Running") => ReplicaPhase::Running,
            Some("Succeeded") => ReplicaPhase::Succeeded,
            Some("Failed") => ReplicaPhase::Failed,
            _ => ReplicaPhase::Unknown,
        }
    }

    /// Job state and status message this phase is reported as
    pub fn job_state(&self) -> (JobState, &'static str) {
        match self {
            ReplicaPhase::Pending => (JobState::InQueue, "Job is currently in the queue"),
            ReplicaPhase::Running => (JobState::Running, "Job has started"),
            ReplicaPhase::Succeeded => (JobState::Success, "Job has terminated"),
            ReplicaPhase::Failed => (
                JobState::Success,
                "Job has terminated with a non-zero exit code",
            ),
            ReplicaPhase::Unknown => (JobState::Failure, "Job has failed"),
        }
    }
}

/// One running unit (rank) of a job, as observed at list/retrieve time.
///
/// Implementations are snapshots: mutations go to the cluster and are only
/// visible in the next observation.
#[async_trait]
pub trait ContainerReplica: Send + Sync + fmt::Debug {
    fn job_id(&self) -> &str;

    fn rank(&self) -> u32;

    fn phase(&self) -> ReplicaPhase;

    fn state_and_message(&self) -> (JobState, String) {
        let (state, message) = self.phase().job_state();
        (state, message.to_string())
    }

    fn node_name(&self) -> Option<&str>;

    fn ip_address(&self) -> Option<&str>;

    fn annotations(&self) -> &BTreeMap<String, String>;

    fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations().get(key).map(String::as_str)
    }

    async fn cancel(&self, force: bool) -> Result<(), RuntimeError>;

    async fn upsert_annotation(&self, key: &str, value: &str) -> Result<(), RuntimeError>;

    async fn allow_network_from(&self, peer: &NetworkPeer) -> Result<(), RuntimeError>;

    async fn allow_network_to(&self, peer: &NetworkPeer) -> Result<(), RuntimeError>;

    async fn download_logs(&self) -> Result<String, RuntimeError>;

    async fn follow_logs(&self) -> Result<LogStream, RuntimeError>;

    async fn open_shell(&self, command: Vec<String>) -> Result<ShellSession, RuntimeError>;
}

pub type Replica = Arc<dyn ContainerReplica>;

/// A schedulable machine as reported by a runtime
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComputeNode {
    pub name: String,
    pub category: Option<String>,
    pub capacity: ResourceRequest,
    /// Remaining capacity, when the runtime tracks it
    pub available: Option<ResourceRequest>,
    pub unschedulable: bool,
}

// ============================================================================
// Runtime contract
// ============================================================================

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    fn builder(&self, job_id: &str, replicas: u32) -> ContainerBuilder {
        ContainerBuilder::new(job_id, replicas)
    }

    async fn schedule(&self, builder: ContainerBuilder) -> Result<(), RuntimeError> {
        self.schedule_group(vec![builder]).await
    }

    async fn schedule_group(&self, group: Vec<ContainerBuilder>) -> Result<(), RuntimeError>;

    async fn retrieve(&self, job_id: &str, rank: u32) -> Result<Option<Replica>, RuntimeError>;

    async fn list(&self) -> Result<Vec<Replica>, RuntimeError>;

    async fn list_nodes(&self) -> Result<Vec<ComputeNode>, RuntimeError>;

    async fn open_tunnel(&self, job_id: &str, rank: u32, port: u16) -> Result<Tunnel, RuntimeError>;

    /// Whether the runtime still tracks the job in any form
    async fn is_job_known(&self, job_id: &str) -> Result<bool, RuntimeError> {
        Ok(self.retrieve(job_id, 0).await?.is_some())
    }

    /// Stop any pending placement of the job
    async fn remove_job_from_queue(&self, _job_id: &str) -> Result<(), RuntimeError> {
        Ok(())
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(500),
        }
    }
}

/// Create an object. A conflicting object of the same name is deleted and
/// the create retried, up to `policy.attempts` times.
pub async fn create_replacing<B: Serialize + Sync, T: DeserializeOwned>(
    client: &ResourceClient,
    collection: &ResourceLocator,
    name: &str,
    body: &B,
    policy: &RetryPolicy,
) -> Result<T, RuntimeError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match client.create(collection, body).await {
            Ok(created) => return Ok(created),
            Err(e) if e.is_conflict() && attempt < policy.attempts => {
                debug!("{} already exists, replacing (attempt {})", name, attempt);
                let named = collection.clone().with_name(name);
                if let Err(e) = client.delete_if_exists(&named).await {
                    warn!("Failed to delete conflicting {}: {}", name, e);
                }
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) if e.is_conflict() => {
                return Err(RuntimeError::RetriesExhausted {
                    name: name.to_string(),
                    attempts: attempt,
                    source: e,
                })
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Describe where a job's ranks were placed, one message per run of
/// consecutive ranks on the same node. `placed` holds (rank, node) pairs in
/// rank order; ranks missing from it are left out of every message.
pub fn describe_assignment(placed: &[(u32, String)], replicas: u32) -> Vec<String> {
    let complete = placed.len() == replicas as usize
        && placed.iter().enumerate().all(|(i, (rank, _))| *rank as usize == i);
    match placed {
        [] => return vec![],
        [(_, only)] if complete => return vec![format!("Assigned to {only}")],
        [(_, first), rest @ ..] if complete && rest.iter().all(|(_, n)| n == first) => {
            return vec![format!("All nodes assigned to {first}")];
        }
        _ => {}
    }

    let mut messages = Vec::new();
    let mut start = 0;
    for i in 1..=placed.len() {
        let run_ends = i == placed.len()
            || placed[i].1 != placed[start].1
            || placed[i].0 != placed[i - 1].0 + 1;
        if !run_ends {
            continue;
        }
        let (first, node) = &placed[start];
        let last = placed[i - 1].0;
        if *first == last {
            messages.push(format!("Node {first} assigned to {node}."));
        } else {
            messages.push(format!("Nodes {first} - {last} assigned to {node}."));
        }
        start = i;
    }
    messages
}

// ============================================================================
// Mock implementation for testing (no I/O)
// ============================================================================

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub struct MockPod {
        pub job_id: String,
        pub rank: u32,
        pub phase: ReplicaPhase,
        pub node: Option<String>,
        pub ip: Option<String>,
        pub annotations: BTreeMap<String, String>,
    }

    #[derive(Debug, Default)]
    pub struct MockCluster {
        pub pods: Vec<MockPod>,
        pub queued: BTreeSet<String>,
        pub scheduled: Vec<ContainerBuilder>,
        pub cancelled: Vec<(String, u32, bool)>,
        pub nodes: Vec<ComputeNode>,
    }

    impl MockCluster {
        fn pod_mut(&mut self, job_id: &str, rank: u32) -> Option<&mut MockPod> {
            self.pods
                .iter_mut()
                .find(|p| p.job_id == job_id && p.rank == rank)
        }
    }

    /// Runtime over an in-memory cluster. Scheduling only records the
    /// builder; tests move pods through their phases by hand.
    #[derive(Default)]
    pub struct MockRuntime {
        pub cluster: Arc<Mutex<MockCluster>>,
    }

    impl MockRuntime {
        pub fn new() -> Self {
            Self::default()
        }

        /// Start every rank of a job on `node`, carrying the annotations of
        /// its last scheduled builder
        pub fn start(&self, job_id: &str, replicas: u32, node: &str) {
            let mut cluster = self.cluster.lock().unwrap();
            cluster.queued.remove(job_id);
            let annotations = cluster
                .scheduled
                .iter()
                .rev()
                .find(|b| b.job_id() == job_id)
                .map(|b| b.annotations().clone())
                .unwrap_or_default();
            for rank in 0..replicas {
                cluster.pods.push(MockPod {
                    job_id: job_id.to_string(),
                    rank,
                    phase: ReplicaPhase::Running,
                    node: Some(node.to_string()),
                    ip: Some(format!("10.0.0.{}", rank + 1)),
                    annotations: annotations.clone(),
                });
            }
        }

        pub fn set_phase(&self, job_id: &str, rank: u32, phase: ReplicaPhase) {
            if let Some(pod) = self.cluster.lock().unwrap().pod_mut(job_id, rank) {
                pod.phase = phase;
            }
        }

        pub fn set_annotation(&self, job_id: &str, rank: u32, key: &str, value: &str) {
            if let Some(pod) = self.cluster.lock().unwrap().pod_mut(job_id, rank) {
                pod.annotations.insert(key.to_string(), value.to_string());
            }
        }

        /// Delete a job's pods without going through cancellation
        pub fn vanish(&self, job_id: &str) {
            self.cluster
                .lock()
                .unwrap()
                .pods
                .retain(|p| p.job_id != job_id);
        }

        pub fn scheduled(&self) -> Vec<ContainerBuilder> {
            self.cluster.lock().unwrap().scheduled.clone()
        }

        pub fn cancelled(&self) -> Vec<(String, u32, bool)> {
            self.cluster.lock().unwrap().cancelled.clone()
        }

        pub fn pod(&self, job_id: &str, rank: u32) -> Option<MockPod> {
            self.cluster.lock().unwrap().pod_mut(job_id, rank).cloned()
        }

        fn snapshot(&self, pod: MockPod) -> Replica {
            Arc::new(MockReplica {
                pod,
                cluster: self.cluster.clone(),
            })
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn schedule_group(&self, group: Vec<ContainerBuilder>) -> Result<(), RuntimeError> {
            let mut cluster = self.cluster.lock().unwrap();
            for builder in group {
                cluster.queued.insert(builder.job_id().to_string());
                cluster.scheduled.push(builder);
            }
            Ok(())
        }

        async fn retrieve(&self, job_id: &str, rank: u32) -> Result<Option<Replica>, RuntimeError> {
            let pod = self.pod(job_id, rank);
            Ok(pod.map(|pod| self.snapshot(pod)))
        }

        async fn list(&self) -> Result<Vec<Replica>, RuntimeError> {
            let pods = self.cluster.lock().unwrap().pods.clone();
            Ok(pods.into_iter().map(|pod| self.snapshot(pod)).collect())
        }

        async fn list_nodes(&self) -> Result<Vec<ComputeNode>, RuntimeError> {
            Ok(self.cluster.lock().unwrap().nodes.clone())
        }

        async fn open_tunnel(&self, job_id: &str, rank: u32, port: u16) -> Result<Tunnel, RuntimeError> {
            let pod = self
                .pod(job_id, rank)
                .ok_or_else(|| RuntimeError::ReplicaNotFound(job_id.to_string(), rank))?;
            let ip = pod
                .ip
                .ok_or_else(|| RuntimeError::Tunnel(format!("{job_id}/{rank} has no IP yet")))?;
            Ok(Tunnel::direct(ip, port))
        }

        async fn is_job_known(&self, job_id: &str) -> Result<bool, RuntimeError> {
            let cluster = self.cluster.lock().unwrap();
            Ok(cluster.queued.contains(job_id) || cluster.pods.iter().any(|p| p.job_id == job_id))
        }

        async fn remove_job_from_queue(&self, job_id: &str) -> Result<(), RuntimeError> {
            self.cluster.lock().unwrap().queued.remove(job_id);
            Ok(())
        }
    }

    #[derive(Debug)]
    pub struct MockReplica {
        pod: MockPod,
        cluster: Arc<Mutex<MockCluster>>,
    }

    #[async_trait]
    impl ContainerReplica for MockReplica {
        fn job_id(&self) -> &str {
            &self.pod.job_id
        }

        fn rank(&self) -> u32 {
            self.pod.rank
        }

        fn phase(&self) -> ReplicaPhase {
            self.pod.phase
        }

        fn node_name(&self) -> Option<&str> {
            self.pod.node.as_deref()
        }

        fn ip_address(&self) -> Option<&str> {
            self.pod.ip.as_deref()
        }

        fn annotations(&self) -> &BTreeMap<String, String> {
            &self.pod.annotations
        }

        async fn cancel(&self, force: bool) -> Result<(), RuntimeError> {
            let mut cluster = self.cluster.lock().unwrap();
            cluster
                .pods
                .retain(|p| !(p.job_id == self.pod.job_id && p.rank == self.pod.rank));
            cluster
                .cancelled
                .push((self.pod.job_id.clone(), self.pod.rank, force));
            Ok(())
        }

        async fn upsert_annotation(&self, key: &str, value: &str) -> Result<(), RuntimeError> {
            let mut cluster = self.cluster.lock().unwrap();
            let pod = cluster
                .pod_mut(&self.pod.job_id, self.pod.rank)
                .ok_or_else(|| RuntimeError::ReplicaNotFound(self.pod.job_id.clone(), self.pod.rank))?;
            pod.annotations.insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn allow_network_from(&self, _peer: &NetworkPeer) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn allow_network_to(&self, _peer: &NetworkPeer) -> Result<(), RuntimeError> {
            Ok(())
        }

        async fn download_logs(&self) -> Result<String, RuntimeError> {
            Ok(format!("started {}/{}\nfinished\n", self.pod.job_id, self.pod.rank))
        }

        async fn follow_logs(&self) -> Result<LogStream, RuntimeError> {
            use futures::StreamExt;
            let lines = vec![
                Ok(format!("started {}/{}", self.pod.job_id, self.pod.rank)),
                Ok("finished".to_string()),
            ];
            Ok(LogStream::spawn(futures::stream::iter(lines).boxed()))
        }

        async fn open_shell(&self, _command: Vec<String>) -> Result<ShellSession, RuntimeError> {
            Err(RuntimeError::Session("mock replicas have no shell".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_names() {
        assert_eq!(workload_name("42", 3), "j-42-job-3");
        assert_eq!(parse_workload_name("j-42-job-3"), Some(("42".to_string(), 3)));
        assert_eq!(
            parse_workload_name("j-ab-job-7-job-1"),
            Some(("ab-job-7".to_string(), 1))
        );
        assert_eq!(parse_workload_name("j--job-1"), None);
        assert_eq!(parse_workload_name("j-42-job-x"), None);
        assert_eq!(parse_workload_name("unrelated"), None);
    }

    #[test]
    fn test_phase_mapping() {
        let (state, msg) = ReplicaPhase::from_pod_phase(Some("Failed")).job_state();
        assert_eq!(state, JobState::Success);
        assert!(msg.contains("non-zero"));
        assert_eq!(
            ReplicaPhase::from_pod_phase(None).job_state().0,
            JobState::Failure
        );
        assert_eq!(
            ReplicaPhase::from_pod_phase(Some("Pending")).job_state().0,
            JobState::InQueue
        );
    }

    #[test]
    fn test_describe_assignment() {
        let placed = |nodes: &[(u32, &str)]| {
            nodes
                .iter()
                .map(|(rank, node)| (*rank, node.to_string()))
                .collect::<Vec<_>>()
        };

        assert_eq!(describe_assignment(&placed(&[(0, "a")]), 1), vec!["Assigned to a"]);
        assert_eq!(
            describe_assignment(&placed(&[(0, "a"), (1, "a"), (2, "a")]), 3),
            vec!["All nodes assigned to a"]
        );
        assert_eq!(
            describe_assignment(
                &placed(&[(0, "a"), (1, "a"), (2, "b"), (3, "c"), (4, "c")]),
                5
            ),
            vec![
                "Nodes 0 - 1 assigned to a.",
                "Node 2 assigned to b.",
                "Nodes 3 - 4 assigned to c."
            ]
        );
        assert!(describe_assignment(&[], 2).is_empty());
    }

    #[test]
    fn test_describe_assignment_skips_failed_ranks() {
        let placed = vec![
            (0, "a".to_string()),
            (2, "a".to_string()),
            (3, "a".to_string()),
        ];
        assert_eq!(
            describe_assignment(&placed, 4),
            vec!["Node 0 assigned to a.", "Nodes 2 - 3 assigned to a."]
        );
        assert_eq!(
            describe_assignment(&placed[..1], 2),
            vec!["Node 0 assigned to a."]
        );
    }
}
