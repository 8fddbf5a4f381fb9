//! Pod-backed replica shared by every runtime backend

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use super::session::{open_exec, LogStream, ShellSession};
use super::{
    job_name, policy_name, workload_name, ContainerReplica, NetworkPeer, ReplicaPhase,
    RuntimeError, CONTAINER_NAME,
};
use crate::jobs::JobState;
use crate::k8s::objects::{BatchJob, Pod};
use crate::k8s::{escape_pointer, resources, JsonPatchOp, ResourceClient, ResourceLocator};

/// The object that owns a replica's lifecycle and annotations
#[derive(Debug, Clone)]
pub enum ReplicaOwner {
    /// A bare pod; rank 0 also owns the job's policy and service
    Pod,
    /// A pod created for a batch object
    Batch(Box<BatchJob>),
}

pub struct PodReplica {
    job_id: String,
    rank: u32,
    pod: Pod,
    owner: ReplicaOwner,
    namespace: String,
    client: Arc<ResourceClient>,
}

impl fmt::Debug for PodReplica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PodReplica")
            .field("job_id", &self.job_id)
            .field("rank", &self.rank)
            .field("phase", &self.phase())
            .field("node", &self.node_name())
            .finish()
    }
}

/// Job state for a batch object's phase
pub fn batch_state(phase: Option<&str>) -> (JobState, String) {
    match phase {
        Some("Pending") | Some("Restarting") => {
            (JobState::InQueue, "Job is currently in the queue".to_string())
        }
        Some("Running") => (JobState::Running, "Job has started".to_string()),
        Some("Completed") | Some("Completing") | Some("Terminating") | Some("Terminated")
        | Some("Failed") | Some("Aborted") | Some("Aborting") => {
            (JobState::Success, "Job has terminated".to_string())
        }
        other => (
            JobState::Failure,
            format!("Job has failed ({})", other.unwrap_or("unknown")),
        ),
    }
}

impl PodReplica {
    pub fn new(
        job_id: impl Into<String>,
        rank: u32,
        pod: Pod,
        owner: ReplicaOwner,
        namespace: impl Into<String>,
        client: Arc<ResourceClient>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            rank,
            pod,
            owner,
            namespace: namespace.into(),
            client,
        }
    }

    pub fn pod(&self) -> &Pod {
        &self.pod
    }

    fn pod_locator(&self) -> ResourceLocator {
        resources::pods().with_name_and_namespace(workload_name(&self.job_id, self.rank), &self.namespace)
    }

    fn policy_locator(&self) -> ResourceLocator {
        resources::network_policies().with_name_and_namespace(policy_name(&self.job_id), &self.namespace)
    }

    /// Locator and current annotations of the object holding annotations
    fn annotated_object(&self) -> (ResourceLocator, &BTreeMap<String, String>) {
        match &self.owner {
            ReplicaOwner::Pod => (self.pod_locator(), &self.pod.metadata.annotations),
            ReplicaOwner::Batch(job) => (
                resources::batch_jobs()
                    .with_name_and_namespace(job_name(&self.job_id), &self.namespace),
                &job.metadata.annotations,
            ),
        }
    }

    async fn append_policy_rule(&self, path: &str, rule: Value) -> Result<(), RuntimeError> {
        self.client
            .json_patch(&self.policy_locator(), &[JsonPatchOp::add(path, rule)])
            .await?;
        Ok(())
    }

    async fn delete_quietly(&self, locator: &ResourceLocator, force: bool) -> Result<(), RuntimeError> {
        let query: &[(&str, &str)] = if force {
            &[("gracePeriodSeconds", "0")]
        } else {
            &[]
        };
        match self.client.delete_with_query(locator, query).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!("{} already gone", locator);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ContainerReplica for PodReplica {
    fn job_id(&self) -> &str {
        &self.job_id
    }

    fn rank(&self) -> u32 {
        self.rank
    }

    fn phase(&self) -> ReplicaPhase {
        ReplicaPhase::from_pod_phase(self.pod.status.as_ref().and_then(|s| s.phase.as_deref()))
    }

    fn state_and_message(&self) -> (JobState, String) {
        match &self.owner {
            ReplicaOwner::Batch(job) => batch_state(
                job.status
                    .as_ref()
                    .and_then(|s| s.state.as_ref())
                    .and_then(|s| s.phase.as_deref()),
            ),
            ReplicaOwner::Pod => {
                let (state, message) = self.phase().job_state();
                (state, message.to_string())
            }
        }
    }

    fn node_name(&self) -> Option<&str> {
        self.pod.spec.node_name.as_deref()
    }

    fn ip_address(&self) -> Option<&str> {
        self.pod.status.as_ref().and_then(|s| s.pod_ip.as_deref())
    }

    fn annotations(&self) -> &BTreeMap<String, String> {
        self.annotated_object().1
    }

    async fn cancel(&self, force: bool) -> Result<(), RuntimeError> {
        match &self.owner {
            ReplicaOwner::Batch(_) if self.rank == 0 => {
                let job = resources::batch_jobs()
                    .with_name_and_namespace(job_name(&self.job_id), &self.namespace);
                self.delete_quietly(&job, force).await?;
                self.delete_quietly(&self.policy_locator(), false).await?;
            }
            ReplicaOwner::Batch(_) => {
                self.delete_quietly(&self.pod_locator(), force).await?;
            }
            ReplicaOwner::Pod => {
                self.delete_quietly(&self.pod_locator(), force).await?;
                if self.rank == 0 {
                    self.delete_quietly(&self.policy_locator(), false).await?;
                    let service = resources::services()
                        .with_name_and_namespace(job_name(&self.job_id), &self.namespace);
                    self.delete_quietly(&service, false).await?;
                }
            }
        }
        Ok(())
    }

    async fn upsert_annotation(&self, key: &str, value: &str) -> Result<(), RuntimeError> {
        let (locator, existing) = self.annotated_object();
        let op = if existing.is_empty() {
            let mut annotations = serde_json::Map::new();
            annotations.insert(key.to_string(), Value::String(value.to_string()));
            JsonPatchOp::add("/metadata/annotations", Value::Object(annotations))
        } else {
            JsonPatchOp::add(
                format!("/metadata/annotations/{}", escape_pointer(key)),
                json!(value),
            )
        };
        self.client.json_patch(&locator, &[op]).await?;
        Ok(())
    }

    async fn allow_network_from(&self, peer: &NetworkPeer) -> Result<(), RuntimeError> {
        self.append_policy_rule("/spec/ingress/-", json!({ "from": [peer.to_policy_peer()] }))
            .await
    }

    async fn allow_network_to(&self, peer: &NetworkPeer) -> Result<(), RuntimeError> {
        self.append_policy_rule("/spec/egress/-", json!({ "to": [peer.to_policy_peer()] }))
            .await
    }

    async fn download_logs(&self) -> Result<String, RuntimeError> {
        Ok(self
            .client
            .get_text(&self.pod_locator(), Some("log"), &[("container", CONTAINER_NAME)])
            .await?)
    }

    async fn follow_logs(&self) -> Result<LogStream, RuntimeError> {
        let lines = self
            .client
            .stream_lines(
                &self.pod_locator(),
                Some("log"),
                &[("container", CONTAINER_NAME), ("follow", "true")],
            )
            .await?;
        Ok(LogStream::spawn(lines))
    }

    async fn open_shell(&self, command: Vec<String>) -> Result<ShellSession, RuntimeError> {
        open_exec(
            &self.client,
            &self.namespace,
            &workload_name(&self.job_id, self.rank),
            CONTAINER_NAME,
            &command,
        )
        .await
    }
}
