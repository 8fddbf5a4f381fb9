//! Scheduler-backed runtime
//!
//! Keeps an in-process [`Scheduler`] in sync with the cluster and creates
//! bare pods pinned to the nodes it picks. Three cadences drive it:
//!
//! - node rescans (expensive, every ~15 min) register capacity
//! - pod rescans (every ~30 s) touch or adopt running replicas and prune
//!   the ones that disappeared
//! - the scheduling pass itself (every ~20 ms)
//!
//! The scheduler lives behind a mutex that is only held around table
//! operations, never across cluster requests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use super::pods::{delete_orphans, list_job_pods, node_capacity, DEFAULT_NODE_TYPE_LABEL};
use super::replica::ReplicaOwner;
use super::{
    create_replacing, describe_assignment, job_name, parse_workload_name, policy_name,
    workload_name, ComputeNode, ContainerBuilder, ContainerRuntime, PodReplica, Replica,
    RetryPolicy, RuntimeError, Tunnel, TunnelOpener,
};
use crate::k8s::objects::{NetworkPolicy, Node, Pod, Service};
use crate::k8s::{quantity, resources, ResourceClient};
use crate::scheduler::{AllocatedReplica, ResourceRequest, Scheduler, SchedulerError};

/// Delay before a failed scan is attempted again
const FAILED_SCAN_RETRY: Duration = Duration::from_secs(5);

/// Receives human readable placement updates for a job
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn post_status(&self, job_id: &str, message: &str);
}

#[derive(Debug, Clone)]
pub struct ScheduledRuntimeConfig {
    pub tick: Duration,
    pub pod_scan_interval: Duration,
    pub node_scan_interval: Duration,
    /// Type assigned to nodes without a type label
    pub default_node_type: String,
    pub node_type_label: String,
}

impl Default for ScheduledRuntimeConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(20),
            pod_scan_interval: Duration::from_secs(30),
            node_scan_interval: Duration::from_secs(15 * 60),
            default_node_type: "default".to_string(),
            node_type_label: DEFAULT_NODE_TYPE_LABEL.to_string(),
        }
    }
}

/// Payload stored with each queue entry and replica
#[derive(Debug, Clone)]
pub enum Placement {
    /// Waiting to be created from this builder
    Pending(Arc<ContainerBuilder>),
    /// Found running in the cluster
    Adopted,
}

struct SchedulerState {
    scheduler: Scheduler<Placement>,
    next_node_scan: Option<Instant>,
    next_pod_scan: Option<Instant>,
}

pub struct ScheduledRuntime {
    client: Arc<ResourceClient>,
    namespace: String,
    tunnels: TunnelOpener,
    config: ScheduledRuntimeConfig,
    retry: RetryPolicy,
    state: Mutex<SchedulerState>,
    status: Option<Arc<dyn StatusSink>>,
}

fn numeric_id(job_id: &str) -> Result<u64, RuntimeError> {
    match job_id.parse::<u64>() {
        Ok(id) if id != 0 => Ok(id),
        _ => Err(RuntimeError::InvalidJob(format!(
            "job id '{job_id}' is not a positive integer"
        ))),
    }
}

/// Resource footprint recorded in a pod's container limits
fn pod_request(pod: &Pod) -> Option<ResourceRequest> {
    let limits = &pod.spec.containers.first()?.resources.limits;
    if limits.is_empty() {
        return None;
    }
    Some(ResourceRequest {
        cpu_millis: limits.get("cpu").map(|v| quantity::cpu_millis(v)).unwrap_or(0),
        memory_bytes: limits.get("memory").map(|v| quantity::memory_bytes(v)).unwrap_or(0),
        gpus: limits
            .get(super::builder::GPU_RESOURCE)
            .map(|v| quantity::gpu_count(v))
            .unwrap_or(0),
    })
}

impl ScheduledRuntime {
    pub fn new(
        client: Arc<ResourceClient>,
        namespace: impl Into<String>,
        tunnels: TunnelOpener,
        config: ScheduledRuntimeConfig,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            tunnels,
            config,
            retry: RetryPolicy::default(),
            state: Mutex::new(SchedulerState {
                scheduler: Scheduler::new(),
                next_node_scan: None,
                next_pod_scan: None,
            }),
            status: None,
        }
    }

    pub fn with_status_sink(mut self, sink: Arc<dyn StatusSink>) -> Self {
        self.status = Some(sink);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &ScheduledRuntimeConfig {
        &self.config
    }

    /// Run one iteration: due scans, then a scheduling pass. Returns the
    /// number of replicas placed.
    pub async fn tick(&self) -> Result<usize, RuntimeError> {
        let now = Instant::now();
        let (scan_nodes, scan_pods) = {
            let state = self.state.lock().await;
            (
                state.next_node_scan.is_none_or(|at| now >= at),
                state.next_pod_scan.is_none_or(|at| now >= at),
            )
        };

        if scan_nodes {
            if let Err(e) = self.scan_nodes().await {
                self.state.lock().await.next_node_scan = Some(now + FAILED_SCAN_RETRY);
                return Err(e);
            }
        }

        if scan_pods {
            if let Err(e) = self.scan_pods().await {
                self.state.lock().await.next_pod_scan = Some(now + FAILED_SCAN_RETRY);
                return Err(e);
            }
        }

        let placements = {
            let mut state = self.state.lock().await;
            let placements = state.scheduler.schedule()?;
            if !placements.is_empty() {
                let stats = state.scheduler.stats();
                info!(
                    "Placed {} replicas (nodes={}, queued={}, running={})",
                    placements.len(),
                    stats.nodes,
                    stats.queued,
                    stats.running
                );
            }
            placements
        };

        let placed = placements.len();
        if placed > 0 {
            self.materialize(placements).await;
        }
        Ok(placed)
    }

    async fn scan_nodes(&self) -> Result<(), RuntimeError> {
        let nodes: Vec<Node> = self.client.list_all(&resources::nodes(), &[]).await?;

        let mut state = self.state.lock().await;
        for node in &nodes {
            let name = node.metadata.name_or_empty();
            if name.is_empty() {
                continue;
            }
            let node_type = node
                .metadata
                .labels
                .get(&self.config.node_type_label)
                .map(String::as_str)
                .unwrap_or(&self.config.default_node_type);
            state
                .scheduler
                .register_node(name, node_type, node_capacity(node), node.spec.unschedulable)?;
        }

        let pruned = state.scheduler.prune_nodes();
        state.next_node_scan = Some(Instant::now() + self.config.node_scan_interval);
        info!("Node scan found {} nodes, pruned {:?}", nodes.len(), pruned);
        Ok(())
    }

    async fn scan_pods(&self) -> Result<(), RuntimeError> {
        let pods = list_job_pods(&self.client, &self.namespace).await?;
        let mut orphans = Vec::new();

        {
            let mut state = self.state.lock().await;
            for pod in &pods {
                let name = pod.metadata.name_or_empty();
                let Some((job_id, rank)) = parse_workload_name(name)
                    .and_then(|(job_id, rank)| numeric_id(&job_id).ok().map(|id| (id, rank)))
                else {
                    orphans.push(name.to_string());
                    continue;
                };

                if state.scheduler.find_running_replica(job_id, rank, true).is_some() {
                    continue;
                }

                let Some(node) = pod.spec.node_name.as_deref() else {
                    debug!("Pod {} is not bound to a node yet", name);
                    continue;
                };
                let Some(request) = pod_request(pod) else {
                    orphans.push(name.to_string());
                    continue;
                };

                match state
                    .scheduler
                    .add_running_replica(job_id, rank, request, node, Placement::Adopted)
                {
                    Ok(()) => debug!("Adopted {} on {}", name, node),
                    Err(SchedulerError::UnknownNode(node)) => {
                        warn!("Pod {} runs on unregistered node {}", name, node)
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            let pruned = state.scheduler.prune_jobs();
            if !pruned.is_empty() {
                debug!("Released {} replicas no longer in the cluster", pruned.len());
            }
            state.next_pod_scan = Some(Instant::now() + self.config.pod_scan_interval);
        }

        delete_orphans(&self.client, &self.namespace, &orphans).await;
        Ok(())
    }

    /// Create the pods (and, for rank 0, policy and service) of new
    /// placements, then report where each job went.
    async fn materialize(&self, placements: Vec<AllocatedReplica<Placement>>) {
        let mut by_job: BTreeMap<u64, Vec<AllocatedReplica<Placement>>> = BTreeMap::new();
        for placement in placements {
            by_job.entry(placement.job_id).or_default().push(placement);
        }

        for (job_id, mut replicas) in by_job {
            replicas.sort_by_key(|r| r.rank);
            let job_id = job_id.to_string();
            let total = replicas.len() as u32;
            let mut placed = Vec::with_capacity(replicas.len());
            let mut failures = Vec::new();

            for replica in &replicas {
                let Placement::Pending(builder) = &replica.data else {
                    continue;
                };
                if replica.rank == 0 {
                    if let Err(e) = self.create_job_objects(builder).await {
                        error!("Failed to create network objects for job {}: {}", job_id, e);
                    }
                }

                let pod = builder.pod_for_rank(replica.rank, Some(&replica.node));
                match create_replacing::<Pod, Pod>(
                    &self.client,
                    &resources::pods().with_namespace(&self.namespace),
                    &workload_name(&job_id, replica.rank),
                    &pod,
                    &self.retry,
                )
                .await
                {
                    Ok(_) => placed.push((replica.rank, replica.node.clone())),
                    Err(e) => {
                        error!(
                            "Failed to create rank {} of job {} on {}: {}",
                            replica.rank, job_id, replica.node, e
                        );
                        failures.push(format!(
                            "Failed to start node {} on {}: {}",
                            replica.rank, replica.node, e
                        ));
                    }
                }
            }

            if let Some(sink) = &self.status {
                for message in describe_assignment(&placed, total).iter().chain(&failures) {
                    sink.post_status(&job_id, message).await;
                }
            }
        }
    }

    async fn create_job_objects(&self, builder: &ContainerBuilder) -> Result<(), RuntimeError> {
        create_replacing::<NetworkPolicy, NetworkPolicy>(
            &self.client,
            &resources::network_policies().with_namespace(&self.namespace),
            &policy_name(builder.job_id()),
            &builder.network_policy(),
            &self.retry,
        )
        .await?;
        create_replacing::<Service, Service>(
            &self.client,
            &resources::services().with_namespace(&self.namespace),
            &job_name(builder.job_id()),
            &builder.service(),
            &self.retry,
        )
        .await?;
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

#[async_trait]
impl ContainerRuntime for ScheduledRuntime {
    fn name(&self) -> &'static str {
        "scheduled"
    }

    async fn schedule_group(&self, group: Vec<ContainerBuilder>) -> Result<(), RuntimeError> {
        let ids = group
            .iter()
            .map(|b| numeric_id(b.job_id()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut state = self.state.lock().await;
        for (id, builder) in ids.into_iter().zip(group) {
            let node_type = builder
                .category()
                .unwrap_or(&self.config.default_node_type)
                .to_string();
            let request = builder.request();
            let replicas = builder.replicas();
            state.scheduler.add_job_to_queue(
                id,
                &node_type,
                request,
                replicas,
                Placement::Pending(Arc::new(builder)),
            )?;
            debug!("Queued job {} ({} x {:?} on {})", id, replicas, request, node_type);
        }
        Ok(())
    }

    async fn retrieve(&self, job_id: &str, rank: u32) -> Result<Option<Replica>, RuntimeError> {
        let id = numeric_id(job_id)?;
        let known = {
            let mut state = self.state.lock().await;
            state.scheduler.find_running_replica(id, rank, false).is_some()
        };
        if !known {
            return Ok(None);
        }

        let locator =
            resources::pods().with_name_and_namespace(workload_name(job_id, rank), &self.namespace);
        let pod: Option<Pod> = self.client.get_optional(&locator).await?;
        Ok(pod.map(|pod| self.replica(job_id.to_string(), rank, pod)))
    }

    async fn list(&self) -> Result<Vec<Replica>, RuntimeError> {
        let running = self.state.lock().await.scheduler.running_replicas();
        if running.is_empty() {
            return Ok(Vec::new());
        }

        let mut pods: HashMap<String, Pod> = list_job_pods(&self.client, &self.namespace)
            .await?
            .into_iter()
            .map(|p| (p.metadata.name_or_empty().to_string(), p))
            .collect();

        Ok(running
            .into_iter()
            .filter_map(|r| {
                let job_id = r.job_id.to_string();
                let pod = pods.remove(&workload_name(&job_id, r.rank))?;
                Some(self.replica(job_id, r.rank, pod))
            })
            .collect())
    }

    async fn list_nodes(&self) -> Result<Vec<ComputeNode>, RuntimeError> {
        let state = self.state.lock().await;
        Ok(state
            .scheduler
            .nodes()
            .into_iter()
            .map(|n| ComputeNode {
                name: n.name,
                category: Some(n.node_type),
                capacity: n.capacity,
                available: Some(n.remaining),
                unschedulable: n.unschedulable,
            })
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

    async fn is_job_known(&self, job_id: &str) -> Result<bool, RuntimeError> {
        let id = numeric_id(job_id)?;
        let mut state = self.state.lock().await;
        Ok(state.scheduler.find_running_replica(id, 0, false).is_some()
            || state.scheduler.is_job_in_queue(id))
    }

    async fn remove_job_from_queue(&self, job_id: &str) -> Result<(), RuntimeError> {
        let id = numeric_id(job_id)?;
        if self.state.lock().await.scheduler.remove_job_from_queue(id) {
            debug!("Removed job {} from the scheduling queue", id);
        }
        Ok(())
    }
}

/// Drive [`ScheduledRuntime::tick`] until shutdown. A scheduler error
/// (table exhaustion) stops the loop.
pub fn spawn_scheduling_loop(runtime: Arc<ScheduledRuntime>) -> watch::Sender<bool> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let tick = runtime.config.tick;
        info!("Starting scheduling loop (tick={:?})", tick);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {
                    match runtime.tick().await {
                        Ok(_) => {}
                        Err(RuntimeError::Scheduler(e)) => {
                            error!("Scheduler halted: {}", e);
                            break;
                        }
                        Err(e) => warn!("Scheduling iteration failed: {}", e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Scheduling loop shutting down");
                        break;
                    }
                }
            }
        }
    });

    shutdown_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::objects::{Container, ResourceRequirements};

    #[test]
    fn test_numeric_id() {
        assert_eq!(numeric_id("42").unwrap(), 42);
        assert!(numeric_id("0").is_err());
        assert!(numeric_id("abc").is_err());
    }

    #[test]
    fn test_pod_request_from_limits() {
        let mut limits = BTreeMap::new();
        limits.insert("cpu".to_string(), "1500m".to_string());
        limits.insert("memory".to_string(), "2Gi".to_string());
        let mut pod = Pod::default();
        pod.spec.containers.push(Container {
            name: "user-job".into(),
            resources: ResourceRequirements {
                limits,
                requests: BTreeMap::new(),
            },
            ..Default::default()
        });
        assert_eq!(pod_request(&pod), Some(ResourceRequest::new(1500, 2 << 30, 0)));

        pod.spec.containers[0].resources.limits.clear();
        assert_eq!(pod_request(&pod), None);
    }
}
