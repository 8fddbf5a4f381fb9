//! Delegating runtime: each job becomes one batch-workload object and the
//! cluster's batch scheduler places its pods.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::pods::{compute_node, delete_orphans, list_job_pods, DEFAULT_NODE_TYPE_LABEL};
use super::replica::ReplicaOwner;
use super::{
    create_replacing, job_name, parse_workload_name, policy_name, workload_name, ComputeNode,
    ContainerBuilder, ContainerRuntime, PodReplica, Replica, RetryPolicy, RuntimeError, Tunnel,
    TunnelOpener,
};
use crate::k8s::objects::{BatchJob, BatchJobSpec, BatchTask, NetworkPolicy, Node, ObjectMeta, Pod};
use crate::k8s::{resources, ResourceClient};

pub const BATCH_SCHEDULER: &str = "volcano";
pub const BATCH_QUEUE: &str = "default";
pub const TASK_NAME: &str = "job";

pub struct BatchRuntime {
    client: Arc<ResourceClient>,
    namespace: String,
    tunnels: TunnelOpener,
    retry: RetryPolicy,
}

/// Render the batch object for a builder. All replicas must start together.
pub fn batch_job(builder: &ContainerBuilder) -> BatchJob {
    let template = builder.pod_template();
    let mut metadata = ObjectMeta::named(job_name(builder.job_id()));
    metadata.labels = template.metadata.labels.clone();
    metadata.annotations = builder.annotations().clone();

    BatchJob {
        metadata,
        spec: BatchJobSpec {
            scheduler_name: Some(BATCH_SCHEDULER.to_string()),
            min_available: builder.replicas(),
            max_retry: Some(0),
            queue: Some(BATCH_QUEUE.to_string()),
            tasks: vec![BatchTask {
                name: TASK_NAME.to_string(),
                replicas: builder.replicas(),
                template,
            }],
        },
        status: None,
    }
}

impl BatchRuntime {
    pub fn new(client: Arc<ResourceClient>, namespace: impl Into<String>, tunnels: TunnelOpener) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            tunnels,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn replica(&self, job_id: String, rank: u32, pod: Pod, job: BatchJob) -> Replica {
        Arc::new(PodReplica::new(
            job_id,
            rank,
            pod,
            ReplicaOwner::Batch(Box::new(job)),
            self.namespace.clone(),
            self.client.clone(),
        ))
    }
}

#[async_trait]
impl ContainerRuntime for BatchRuntime {
    fn name(&self) -> &'static str {
        "batch"
    }

    async fn schedule_group(&self, group: Vec<ContainerBuilder>) -> Result<(), RuntimeError> {
        for builder in &group {
            let job = batch_job(builder);
            let _: BatchJob = self
                .client
                .create(&resources::batch_jobs().with_namespace(&self.namespace), &job)
                .await?;

            create_replacing::<NetworkPolicy, NetworkPolicy>(
                &self.client,
                &resources::network_policies().with_namespace(&self.namespace),
                &policy_name(builder.job_id()),
                &builder.network_policy(),
                &self.retry,
            )
            .await?;

            info!("Submitted batch job {} with {} replicas", builder.job_id(), builder.replicas());
        }
        Ok(())
    }

    async fn retrieve(&self, job_id: &str, rank: u32) -> Result<Option<Replica>, RuntimeError> {
        let pod_locator =
            resources::pods().with_name_and_namespace(workload_name(job_id, rank), &self.namespace);
        let Some(pod) = self.client.get_optional::<Pod>(&pod_locator).await? else {
            return Ok(None);
        };

        let job_locator =
            resources::batch_jobs().with_name_and_namespace(job_name(job_id), &self.namespace);
        let Some(job) = self.client.get_optional::<BatchJob>(&job_locator).await? else {
            debug!("Pod for job {} has no batch object", job_id);
            return Ok(None);
        };

        Ok(Some(self.replica(job_id.to_string(), rank, pod, job)))
    }

    async fn list(&self) -> Result<Vec<Replica>, RuntimeError> {
        let jobs: Vec<BatchJob> = self
            .client
            .list_all(&resources::batch_jobs().with_namespace(&self.namespace), &[])
            .await?;
        let jobs: HashMap<String, BatchJob> = jobs
            .into_iter()
            .map(|j| (j.metadata.name_or_empty().to_string(), j))
            .collect();

        let pods = list_job_pods(&self.client, &self.namespace).await?;
        let mut replicas = Vec::with_capacity(pods.len());
        let mut orphans = Vec::new();
        for pod in pods {
            let name = pod.metadata.name_or_empty().to_string();
            let Some((job_id, rank)) = parse_workload_name(&name) else {
                orphans.push(name);
                continue;
            };
            match jobs.get(&job_name(&job_id)) {
                Some(job) => replicas.push(self.replica(job_id, rank, pod, job.clone())),
                // The batch scheduler removes pods of deleted objects itself
                None => debug!("Pod {} has no batch object", name),
            }
        }

        delete_orphans(&self.client, &self.namespace, &orphans).await;
        Ok(replicas)
    }

    async fn list_nodes(&self) -> Result<Vec<ComputeNode>, RuntimeError> {
        let nodes: Vec<Node> = self.client.list_all(&resources::nodes(), &[]).await?;
        Ok(nodes
            .iter()
            .map(|n| compute_node(n, DEFAULT_NODE_TYPE_LABEL))
            .collect())
    }

    async fn open_tunnel(&self, job_id: &str, rank: u32, port: u16) -> Result<Tunnel, RuntimeError> {
        let replica = self
            .retrieve(job_id, rank)
            .await?
            .ok_or_else(|| RuntimeError::ReplicaNotFound(job_id.to_string(), rank))?;
        self.tunnels
            .open(&workload_name(job_id, rank), replica.ip_address(), port)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::JOB_LABEL;

    #[test]
    fn test_batch_job_rendering() {
        let mut builder = ContainerBuilder::new("8", 3);
        builder.image("busybox").upsert_annotation("clusterjobs/max-time", "60");

        let job = batch_job(&builder);
        assert_eq!(job.metadata.name.as_deref(), Some("j-8"));
        assert_eq!(job.metadata.annotations["clusterjobs/max-time"], "60");
        assert_eq!(job.spec.min_available, 3);
        assert_eq!(job.spec.tasks.len(), 1);
        assert_eq!(job.spec.tasks[0].replicas, 3);
        assert_eq!(job.spec.tasks[0].template.metadata.labels[JOB_LABEL], "j-8");
        assert_eq!(job.spec.scheduler_name.as_deref(), Some(BATCH_SCHEDULER));
    }
}
