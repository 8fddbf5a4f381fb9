//! Translates a job specification into the container builder

use std::any::Any;
use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::debug;

use super::{FeatureError, JobContext, JobFeature};
use crate::jobs::model::Job;
use crate::runtime::pods::DEFAULT_NODE_TYPE_LABEL;
use crate::runtime::{ContainerBuilder, NetworkPeer};

#[derive(Debug, Clone)]
pub struct TaskFeature {
    /// Product category to node type label value
    pub category_selectors: BTreeMap<String, String>,
    pub node_type_label: String,
}

impl Default for TaskFeature {
    fn default() -> Self {
        Self {
            category_selectors: BTreeMap::new(),
            node_type_label: DEFAULT_NODE_TYPE_LABEL.to_string(),
        }
    }
}

impl TaskFeature {
    pub fn new(category_selectors: BTreeMap<String, String>) -> Self {
        Self {
            category_selectors,
            ..Default::default()
        }
    }

    pub fn with_node_type_label(mut self, label: impl Into<String>) -> Self {
        self.node_type_label = label.into();
        self
    }

    fn validate(job: &Job) -> Result<(), FeatureError> {
        let spec = &job.specification;
        if spec.image.trim().is_empty() {
            return Err(FeatureError::InvalidJob("no image specified".into()));
        }
        if spec.replicas == 0 {
            return Err(FeatureError::InvalidJob("at least one replica is required".into()));
        }
        let r = &spec.resources;
        if r.cpu_millis < 0 || r.memory_bytes < 0 || r.gpus < 0 {
            return Err(FeatureError::InvalidJob("negative resource request".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobFeature for TaskFeature {
    fn name(&self) -> &'static str {
        "task"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn on_create(
        &self,
        ctx: &JobContext,
        job: &Job,
        builder: &mut ContainerBuilder,
    ) -> Result<(), FeatureError> {
        Self::validate(job)?;
        let spec = &job.specification;

        builder
            .image(spec.image.clone())
            .resources(spec.resources)
            .product_category(spec.product_category.clone());
        if !spec.command.is_empty() {
            builder.command(spec.command.clone());
        }
        for (name, value) in &spec.env {
            builder.env(name.clone(), value.clone());
        }
        if let Some(selector) = self.category_selectors.get(&spec.product_category) {
            builder.node_selector(self.node_type_label.clone(), selector.clone());
        }
        for mount in &spec.mounts {
            builder.mount_host_path(mount.source.clone(), mount.target.clone(), mount.read_only);
        }

        // Ranks of the same job always talk to each other
        builder
            .allow_network_from(NetworkPeer::job(job.id.clone()))
            .allow_network_to(NetworkPeer::job(job.id.clone()));

        for peer in &spec.peers {
            let root = ctx
                .runtime
                .retrieve(peer, 0)
                .await?
                .ok_or_else(|| FeatureError::InvalidJob(format!("peer job {peer} is not running")))?;

            builder
                .allow_network_from(NetworkPeer::job(peer.clone()))
                .allow_network_to(NetworkPeer::job(peer.clone()));
            root.allow_network_from(&NetworkPeer::job(job.id.clone())).await?;
            root.allow_network_to(&NetworkPeer::job(job.id.clone())).await?;
            debug!("Connected job {} with peer {}", job.id, peer);
        }

        Ok(())
    }
}
