//! Feature pipeline
//!
//! A feature contributes behaviour at fixed points of a job's life. Every
//! hook has a no-op default, so a feature only implements what it needs.
//! Hooks run in registration order:
//!
//! - `on_create` before the job is submitted; an error aborts creation
//! - `on_job_start` once the job is confirmed running
//! - `on_job_complete` then `on_cleanup` when the job ends
//! - `on_job_monitoring` once per monitoring cycle, over every replica

pub mod expiry;
pub mod logging;
pub mod task;

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::cache::JobCache;
use super::model::Job;
use crate::accounting::{AccountingError, StateReporter};
use crate::runtime::{ContainerBuilder, ContainerRuntime, Replica, RuntimeError};

pub use expiry::ExpiryFeature;
pub use logging::LoggingFeature;
pub use task::TaskFeature;

#[derive(Error, Debug)]
pub enum FeatureError {
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Accounting error: {0}")]
    Accounting(#[from] AccountingError),

    #[error("Invalid job: {0}")]
    InvalidJob(String),
}

/// Everything a hook may touch
#[derive(Clone)]
pub struct JobContext {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub reporter: Arc<StateReporter>,
    pub cache: Arc<JobCache>,
    pub features: Arc<FeatureRegistry>,
}

#[async_trait]
pub trait JobFeature: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    async fn on_create(
        &self,
        _ctx: &JobContext,
        _job: &Job,
        _builder: &mut ContainerBuilder,
    ) -> Result<(), FeatureError> {
        Ok(())
    }

    /// May run more than once for the same job, or after a partial cleanup
    async fn on_cleanup(&self, _ctx: &JobContext, _job_id: &str) -> Result<(), FeatureError> {
        Ok(())
    }

    async fn on_job_start(
        &self,
        _ctx: &JobContext,
        _root: &Replica,
        _replicas: &[Replica],
    ) -> Result<(), FeatureError> {
        Ok(())
    }

    async fn on_job_complete(
        &self,
        _ctx: &JobContext,
        _root: &Replica,
        _replicas: &[Replica],
    ) -> Result<(), FeatureError> {
        Ok(())
    }

    async fn on_job_monitoring(
        &self,
        _ctx: &JobContext,
        _replicas: &[Replica],
    ) -> Result<(), FeatureError> {
        Ok(())
    }
}

/// Ordered set of features, fixed at startup
#[derive(Default)]
pub struct FeatureRegistry {
    features: Vec<Arc<dyn JobFeature>>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, feature: impl JobFeature) -> Self {
        self.features.push(Arc::new(feature));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn JobFeature>> {
        self.features.iter()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Look up a feature by its concrete type
    pub fn find<F: JobFeature>(&self) -> Option<&F> {
        self.features
            .iter()
            .find_map(|f| f.as_any().downcast_ref::<F>())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.features.iter().map(|f| f.name()).collect()
    }
}
