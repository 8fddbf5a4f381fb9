//! Declarative description of a job's workload
//!
//! Features fill in a builder during creation; each runtime backend renders
//! it into the objects it submits (pods, batch object, network policy,
//! headless service).

use std::collections::BTreeMap;

use serde_json::Value;

use super::{job_name, policy_name, workload_name, CONTAINER_NAME, JOB_LABEL, RANK_LABEL};
use crate::k8s::objects::{
    Container, EgressRule, EnvVar, HostPathSource, IngressRule, IpBlock, LabelSelector,
    NetworkPolicy, NetworkPolicySpec, ObjectMeta, Pod, PodSpec, PodTemplate, PolicyPeer,
    ResourceRequirements, Service, ServiceSpec, Volume, VolumeMount,
};
use crate::k8s::quantity::{format_cpu, format_memory};
use crate::scheduler::ResourceRequest;

pub const GPU_RESOURCE: &str = "nvidia.com/gpu";

/// A network endpoint a job may exchange traffic with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkPeer {
    /// Replicas of a job; all ranks, or a single one
    Job { job_id: String, rank: Option<u32> },
    /// A CIDR block
    Subnet(String),
}

impl NetworkPeer {
    pub fn job(job_id: impl Into<String>) -> Self {
        NetworkPeer::Job {
            job_id: job_id.into(),
            rank: None,
        }
    }

    pub fn rank(job_id: impl Into<String>, rank: u32) -> Self {
        NetworkPeer::Job {
            job_id: job_id.into(),
            rank: Some(rank),
        }
    }

    pub fn to_policy_peer(&self) -> PolicyPeer {
        match self {
            NetworkPeer::Job { job_id, rank } => {
                let mut selector = LabelSelector::single(JOB_LABEL, job_name(job_id));
                if let Some(rank) = rank {
                    selector
                        .match_labels
                        .insert(RANK_LABEL.to_string(), rank.to_string());
                }
                PolicyPeer {
                    pod_selector: Some(selector),
                    ip_block: None,
                }
            }
            NetworkPeer::Subnet(cidr) => PolicyPeer {
                pod_selector: None,
                ip_block: Some(IpBlock { cidr: cidr.clone() }),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerBuilder {
    job_id: String,
    replicas: u32,
    image: Option<String>,
    command: Vec<String>,
    working_dir: Option<String>,
    env: BTreeMap<String, String>,
    volumes: Vec<Volume>,
    mounts: Vec<VolumeMount>,
    request: ResourceRequest,
    product_category: Option<String>,
    node_selector: BTreeMap<String, String>,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    tolerations: Vec<Value>,
    ingress: Vec<NetworkPeer>,
    egress: Vec<NetworkPeer>,
}

impl ContainerBuilder {
    pub fn new(job_id: impl Into<String>, replicas: u32) -> Self {
        Self {
            job_id: job_id.into(),
            replicas,
            image: None,
            command: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            volumes: Vec::new(),
            mounts: Vec::new(),
            request: ResourceRequest::default(),
            product_category: None,
            node_selector: BTreeMap::new(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            tolerations: Vec::new(),
            ingress: Vec::new(),
            egress: Vec::new(),
        }
    }

    // =========================================================================
    // Accumulation
    // =========================================================================

    pub fn image(&mut self, image: impl Into<String>) -> &mut Self {
        self.image = Some(image.into());
        self
    }

    pub fn command(&mut self, command: Vec<String>) -> &mut Self {
        self.command = command;
        self
    }

    pub fn working_dir(&mut self, dir: impl Into<String>) -> &mut Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn resources(&mut self, request: ResourceRequest) -> &mut Self {
        self.request = request;
        self
    }

    pub fn product_category(&mut self, category: impl Into<String>) -> &mut Self {
        self.product_category = Some(category.into());
        self
    }

    pub fn node_selector(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.node_selector.insert(key.into(), value.into());
        self
    }

    pub fn label(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn upsert_annotation(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn toleration(&mut self, toleration: Value) -> &mut Self {
        self.tolerations.push(toleration);
        self
    }

    /// Mount a directory of the node into the container
    pub fn mount_host_path(
        &mut self,
        host_path: impl Into<String>,
        target: impl Into<String>,
        read_only: bool,
    ) -> &mut Self {
        let name = format!("mount-{}", self.volumes.len());
        self.volumes.push(Volume {
            name: name.clone(),
            host_path: Some(HostPathSource {
                path: host_path.into(),
                path_type: Some("Directory".to_string()),
            }),
            empty_dir: None,
        });
        self.mounts.push(VolumeMount {
            name,
            mount_path: target.into(),
            sub_path: None,
            read_only,
        });
        self
    }

    pub fn allow_network_from(&mut self, peer: NetworkPeer) -> &mut Self {
        if !self.ingress.contains(&peer) {
            self.ingress.push(peer);
        }
        self
    }

    pub fn allow_network_to(&mut self, peer: NetworkPeer) -> &mut Self {
        if !self.egress.contains(&peer) {
            self.egress.push(peer);
        }
        self
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn replicas(&self) -> u32 {
        self.replicas
    }

    pub fn request(&self) -> ResourceRequest {
        self.request
    }

    pub fn category(&self) -> Option<&str> {
        self.product_category.as_deref()
    }

    pub fn image_name(&self) -> Option<&str> {
        self.image.as_deref()
    }

    pub fn env_vars(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    pub fn ingress(&self) -> &[NetworkPeer] {
        &self.ingress
    }

    pub fn egress(&self) -> &[NetworkPeer] {
        &self.egress
    }

    // =========================================================================
    // Rendering
    // =========================================================================

    fn limits(&self) -> BTreeMap<String, String> {
        let mut limits = BTreeMap::new();
        if self.request.cpu_millis > 0 {
            limits.insert("cpu".to_string(), format_cpu(self.request.cpu_millis));
        }
        if self.request.memory_bytes > 0 {
            limits.insert("memory".to_string(), format_memory(self.request.memory_bytes));
        }
        if self.request.gpus > 0 {
            limits.insert(GPU_RESOURCE.to_string(), self.request.gpus.to_string());
        }
        limits
    }

    fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.labels.clone();
        labels.insert(JOB_LABEL.to_string(), job_name(&self.job_id));
        labels
    }

    /// Pod template shared by every rank
    pub fn pod_template(&self) -> PodTemplate {
        let limits = self.limits();
        let container = Container {
            name: CONTAINER_NAME.to_string(),
            image: self.image.clone(),
            command: self.command.clone(),
            env: self
                .env
                .iter()
                .map(|(k, v)| EnvVar::new(k.clone(), v.clone()))
                .collect(),
            working_dir: self.working_dir.clone(),
            resources: ResourceRequirements {
                requests: limits.clone(),
                limits,
            },
            volume_mounts: self.mounts.clone(),
        };

        PodTemplate {
            metadata: ObjectMeta {
                labels: self.labels(),
                annotations: self.annotations.clone(),
                ..Default::default()
            },
            spec: PodSpec {
                containers: vec![container],
                volumes: self.volumes.clone(),
                node_selector: self.node_selector.clone(),
                restart_policy: Some("Never".to_string()),
                tolerations: self.tolerations.clone(),
                automount_service_account_token: Some(false),
                ..Default::default()
            },
        }
    }

    /// A bare pod for one rank, optionally pinned to a node. Every rank
    /// learns its position and its peers through the environment.
    pub fn pod_for_rank(&self, rank: u32, node: Option<&str>) -> Pod {
        let template = self.pod_template();
        let name = workload_name(&self.job_id, rank);

        let mut metadata = template.metadata;
        metadata.name = Some(name.clone());
        metadata
            .labels
            .insert(RANK_LABEL.to_string(), rank.to_string());

        let peers: Vec<String> = (0..self.replicas)
            .map(|r| format!("{}.{}", workload_name(&self.job_id, r), job_name(&self.job_id)))
            .collect();

        let mut spec = template.spec;
        spec.hostname = Some(name);
        spec.subdomain = Some(job_name(&self.job_id));
        spec.node_name = node.map(str::to_string);
        for container in &mut spec.containers {
            container.env.push(EnvVar::new("JOB_ID", self.job_id.clone()));
            container.env.push(EnvVar::new("RANK", rank.to_string()));
            container
                .env
                .push(EnvVar::new("TASK_COUNT", self.replicas.to_string()));
            container.env.push(EnvVar::new("NODES", peers.join(",")));
        }

        Pod {
            metadata,
            spec,
            status: None,
        }
    }

    pub fn network_policy(&self) -> NetworkPolicy {
        NetworkPolicy {
            metadata: ObjectMeta::named(policy_name(&self.job_id)),
            spec: NetworkPolicySpec {
                pod_selector: LabelSelector::single(JOB_LABEL, job_name(&self.job_id)),
                ingress: self
                    .ingress
                    .iter()
                    .map(|p| IngressRule {
                        from: vec![p.to_policy_peer()],
                    })
                    .collect(),
                egress: self
                    .egress
                    .iter()
                    .map(|p| EgressRule {
                        to: vec![p.to_policy_peer()],
                    })
                    .collect(),
                policy_types: vec!["Ingress".to_string(), "Egress".to_string()],
            },
        }
    }

    /// Headless service giving every rank a stable DNS name
    pub fn service(&self) -> Service {
        let mut selector = BTreeMap::new();
        selector.insert(JOB_LABEL.to_string(), job_name(&self.job_id));
        Service {
            metadata: ObjectMeta::named(job_name(&self.job_id)),
            spec: ServiceSpec {
                cluster_ip: Some("None".to_string()),
                service_type: Some("ClusterIP".to_string()),
                selector,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> ContainerBuilder {
        let mut b = ContainerBuilder::new("17", 2);
        b.image("alpine:3")
            .command(vec!["sleep".into(), "60".into()])
            .env("GREETING", "hi")
            .resources(ResourceRequest::new(2000, 1 << 30, 1))
            .mount_host_path("/data/17", "/work", false)
            .upsert_annotation("clusterjobs/max-time", "3600");
        b
    }

    #[test]
    fn test_pod_for_rank() {
        let pod = builder().pod_for_rank(1, Some("node-a"));
        assert_eq!(pod.metadata.name.as_deref(), Some("j-17-job-1"));
        assert_eq!(pod.metadata.labels[JOB_LABEL], "j-17");
        assert_eq!(pod.metadata.labels[RANK_LABEL], "1");
        assert_eq!(pod.metadata.annotations["clusterjobs/max-time"], "3600");
        assert_eq!(pod.spec.node_name.as_deref(), Some("node-a"));
        assert_eq!(pod.spec.subdomain.as_deref(), Some("j-17"));

        let container = &pod.spec.containers[0];
        assert_eq!(container.resources.limits["cpu"], "2000m");
        assert_eq!(container.resources.limits["memory"], "1024Mi");
        assert_eq!(container.resources.limits[GPU_RESOURCE], "1");
        assert_eq!(container.volume_mounts[0].mount_path, "/work");

        let env: BTreeMap<_, _> = container
            .env
            .iter()
            .map(|e| (e.name.as_str(), e.value.as_str()))
            .collect();
        assert_eq!(env["RANK"], "1");
        assert_eq!(env["TASK_COUNT"], "2");
        assert_eq!(env["GREETING"], "hi");
        assert_eq!(env["NODES"], "j-17-job-0.j-17,j-17-job-1.j-17");
    }

    #[test]
    fn test_network_policy_rules() {
        let mut b = builder();
        b.allow_network_from(NetworkPeer::job("17"))
            .allow_network_from(NetworkPeer::job("17"))
            .allow_network_to(NetworkPeer::Subnet("10.0.0.0/8".into()))
            .allow_network_to(NetworkPeer::rank("3", 0));

        let policy = b.network_policy();
        assert_eq!(policy.metadata.name.as_deref(), Some("policy-17"));
        assert_eq!(policy.spec.ingress.len(), 1);
        assert_eq!(policy.spec.egress.len(), 2);
        assert_eq!(
            policy.spec.egress[0].to[0].ip_block,
            Some(IpBlock {
                cidr: "10.0.0.0/8".into()
            })
        );
        let selector = policy.spec.egress[1].to[0].pod_selector.as_ref().unwrap();
        assert_eq!(selector.match_labels[JOB_LABEL], "j-3");
        assert_eq!(selector.match_labels[RANK_LABEL], "0");
    }

    #[test]
    fn test_service_is_headless() {
        let svc = builder().service();
        assert_eq!(svc.metadata.name.as_deref(), Some("j-17"));
        assert_eq!(svc.spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(svc.spec.selector[JOB_LABEL], "j-17");
    }
}
