//! Start and completion messages

use std::any::Any;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{FeatureError, JobContext, JobFeature};
use crate::runtime::Replica;

#[derive(Debug, Clone, Default)]
pub struct LoggingFeature;

fn placement(replicas: &[Replica]) -> Option<String> {
    let mut nodes: Vec<&str> = replicas.iter().filter_map(|r| r.node_name()).collect();
    nodes.dedup();
    if nodes.is_empty() {
        None
    } else {
        Some(nodes.join(", "))
    }
}

#[async_trait]
impl JobFeature for LoggingFeature {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn on_job_start(
        &self,
        ctx: &JobContext,
        root: &Replica,
        replicas: &[Replica],
    ) -> Result<(), FeatureError> {
        let message = match placement(replicas) {
            Some(nodes) => format!("Job is now running on {nodes}"),
            None => "Job is now running".to_string(),
        };
        info!("Job {}: {}", root.job_id(), message);
        ctx.reporter.add_status(root.job_id(), &message).await?;
        Ok(())
    }

    async fn on_job_complete(
        &self,
        _ctx: &JobContext,
        root: &Replica,
        replicas: &[Replica],
    ) -> Result<(), FeatureError> {
        let (_, message) = root.state_and_message();
        info!(
            "Job {} completed with {} replicas: {}",
            root.job_id(),
            replicas.len(),
            message
        );
        Ok(())
    }

    async fn on_cleanup(&self, _ctx: &JobContext, job_id: &str) -> Result<(), FeatureError> {
        debug!("Cleaned up job {}", job_id);
        Ok(())
    }
}
