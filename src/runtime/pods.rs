//! Direct-pod runtime: one bare pod per replica, placement left to the
//! cluster.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{
    create_replacing, job_name, parse_workload_name, policy_name, workload_name, ComputeNode,
    ContainerBuilder, ContainerRuntime, PodReplica, Replica, RetryPolicy, RuntimeError, Tunnel,
    TunnelOpener, JOB_LABEL,
};
use super::replica::ReplicaOwner;
use crate::k8s::objects::{NetworkPolicy, Node, Pod, Service};
use crate::k8s::{quantity, resources, ResourceClient};
use crate::scheduler::ResourceRequest;

/// Label carrying a node's machine type
pub const DEFAULT_NODE_TYPE_LABEL: &str = "ucloud.dk/machine";

pub struct PodRuntime {
    client: Arc<ResourceClient>,
    namespace: String,
    tunnels: TunnelOpener,
    retry: RetryPolicy,
}

impl PodRuntime {
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

    async fn submit(&self, builder: &ContainerBuilder) -> Result<(), RuntimeError> {
        let job_id = builder.job_id();
        let policy = builder.network_policy();
        create_replacing::<NetworkPolicy, NetworkPolicy>(
            &self.client,
            &resources::network_policies().with_namespace(&self.namespace),
            &policy_name(job_id),
            &policy,
            &self.retry,
        )
        .await?;

        create_replacing::<Service, Service>(
            &self.client,
            &resources::services().with_namespace(&self.namespace),
            &job_name(job_id),
            &builder.service(),
            &self.retry,
        )
        .await?;

        for rank in 0..builder.replicas() {
            let pod = builder.pod_for_rank(rank, None);
            create_replacing::<Pod, Pod>(
                &self.client,
                &resources::pods().with_namespace(&self.namespace),
                &workload_name(job_id, rank),
                &pod,
                &self.retry,
            )
            .await?;
        }

        info!("Submitted job {} with {} replicas", job_id, builder.replicas());
        Ok(())
    }

    fn replica(&self, job_id: String, rank: u32, pod: Pod) -> Replica {
        Arc::new(PodReplica::new(
            job_id,
            rank,
            pod,
            ReplicaOwner::Pod,
            self.namespace.clone(),
            self.client.clone(),
        ))
    }
}

/// Pods carrying the job label, across pages
pub(crate) async fn list_job_pods(
    client: &ResourceClient,
    namespace: &str,
) -> Result<Vec<Pod>, RuntimeError> {
    Ok(client
        .list_all(
            &resources::pods().with_namespace(namespace),
            &[("labelSelector", JOB_LABEL)],
        )
        .await?)
}

/// Best-effort removal of pods that carry the job label but whose name
/// cannot be mapped back to a job and rank.
pub(crate) async fn delete_orphans(client: &ResourceClient, namespace: &str, orphans: &[String]) {
    for name in orphans {
        warn!("Deleting orphaned workload {}", name);
        let locator = resources::pods().with_name_and_namespace(name, namespace);
        if let Err(e) = client.delete_if_exists(&locator).await {
            warn!("Failed to delete orphaned workload {}: {}", name, e);
        }
    }
}

pub(crate) fn compute_node(node: &Node, type_label: &str) -> ComputeNode {
    ComputeNode {
        name: node.metadata.name_or_empty().to_string(),
        category: node.metadata.labels.get(type_label).cloned(),
        capacity: node_capacity(node),
        available: None,
        unschedulable: node.spec.unschedulable,
    }
}

pub(crate) fn node_capacity(node: &Node) -> ResourceRequest {
    let cap = &node.status.capacity;
    ResourceRequest {
        cpu_millis: cap.get("cpu").map(|v| quantity::cpu_millis(v)).unwrap_or(0),
        memory_bytes: cap.get("memory").map(|v| quantity::memory_bytes(v)).unwrap_or(0),
        gpus: cap
            .get(super::builder::GPU_RESOURCE)
            .map(|v| quantity::gpu_count(v))
            .unwrap_or(0),
    }
}

#[async_trait]
impl ContainerRuntime for PodRuntime {
    fn name(&self) -> &'static str {
        "pods"
    }

    async fn schedule_group(&self, group: Vec<ContainerBuilder>) -> Result<(), RuntimeError> {
        for builder in &group {
            self.submit(builder).await?;
        }
        Ok(())
    }

    async fn retrieve(&self, job_id: &str, rank: u32) -> Result<Option<Replica>, RuntimeError> {
        let locator =
            resources::pods().with_name_and_namespace(workload_name(job_id, rank), &self.namespace);
        let pod: Option<Pod> = self.client.get_optional(&locator).await?;
        Ok(pod.map(|pod| self.replica(job_id.to_string(), rank, pod)))
    }

    async fn list(&self) -> Result<Vec<Replica>, RuntimeError> {
        let pods = list_job_pods(&self.client, &self.namespace).await?;

        let mut replicas = Vec::with_capacity(pods.len());
        let mut orphans = Vec::new();
        for pod in pods {
            let name = pod.metadata.name_or_empty().to_string();
            match parse_workload_name(&name) {
                Some((job_id, rank)) => replicas.push(self.replica(job_id, rank, pod)),
                None => orphans.push(name),
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
    use std::collections::BTreeMap;

    #[test]
    fn test_node_capacity_parsing() {
        let mut capacity = BTreeMap::new();
        capacity.insert("cpu".to_string(), "64".to_string());
        capacity.insert("memory".to_string(), "256Gi".to_string());
        capacity.insert("nvidia.com/gpu".to_string(), "4".to_string());

        let mut node = Node::default();
        node.metadata.name = Some("gpu-1".into());
        node.metadata
            .labels
            .insert(DEFAULT_NODE_TYPE_LABEL.into(), "u1-gpu".into());
        node.status.capacity = capacity;

        let compute = compute_node(&node, DEFAULT_NODE_TYPE_LABEL);
        assert_eq!(compute.category.as_deref(), Some("u1-gpu"));
        assert_eq!(compute.capacity, ResourceRequest::new(64000, 256 << 30, 4));
    }
}
