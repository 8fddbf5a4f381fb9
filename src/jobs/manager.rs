//! Job lifecycle
//!
//! [`JobManager`] creates and cancels jobs through the feature pipeline and
//! a runtime, and runs the monitoring loop that turns replica scans into
//! state pushes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use super::cache::JobCache;
use super::events::{JobEvent, JobObservation, ScanTracker};
use super::features::expiry::replica_expiry;
use super::features::{ExpiryFeature, FeatureError, FeatureRegistry, JobContext};
use super::model::{Job, JobSpecification, JobState};
use crate::accounting::{AccountingClient, AccountingError, StateChange, StateReporter};
use crate::runtime::{ContainerRuntime, Replica, RuntimeError};
use crate::scheduler::SchedulerError;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("The cluster does not currently accept new jobs")]
    ClusterPaused,

    #[error("Not enough compute credits to run this job")]
    InsufficientFunds,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Job '{0}' not found")]
    NotFound(String),

    #[error("Feature '{feature}' failed: {source}")]
    Feature {
        feature: &'static str,
        source: FeatureError,
    },

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Accounting error: {0}")]
    Accounting(#[from] AccountingError),
}

impl JobError {
    /// HTTP status category of the error
    pub fn status_code(&self) -> u16 {
        match self {
            JobError::ClusterPaused
            | JobError::InvalidRequest(_)
            | JobError::Feature {
                source: FeatureError::InvalidJob(_),
                ..
            }
            | JobError::Runtime(RuntimeError::InvalidJob(_))
            | JobError::Runtime(RuntimeError::Scheduler(SchedulerError::InvalidRequest(..))) => 400,
            JobError::InsufficientFunds => 402,
            JobError::NotFound(_)
            | JobError::Accounting(AccountingError::NotFound(_))
            | JobError::Runtime(RuntimeError::ReplicaNotFound(..)) => 404,
            _ => 500,
        }
    }

    /// Stable machine readable error code
    pub fn code(&self) -> &'static str {
        match self {
            JobError::ClusterPaused => "CLUSTER_PAUSED",
            JobError::InsufficientFunds => "NOT_ENOUGH_COMPUTE_CREDITS",
            _ => match self.status_code() {
                400 => "INVALID_REQUEST",
                404 => "NOT_FOUND",
                _ => "INTERNAL_ERROR",
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    pub monitor_interval: Duration,
    /// How long a create that raced with an existing workload is retried
    pub unsuspend_window: Duration,
    /// Ask the accounting authority whether a job can be paid for
    pub check_allocation: bool,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(5),
            unsuspend_window: Duration::from_secs(120),
            check_allocation: true,
        }
    }
}

#[derive(Debug, Clone)]
struct UnsuspendItem {
    job: Job,
    expiration: DateTime<Utc>,
}

/// Counters of one monitoring cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorSummary {
    pub replicas: usize,
    pub updates: usize,
    pub terminations: usize,
    pub expirations: usize,
    pub unsuspended: usize,
}

impl MonitorSummary {
    pub fn has_activity(&self) -> bool {
        self.updates + self.terminations + self.expirations + self.unsuspended > 0
    }
}

pub struct JobManager {
    ctx: JobContext,
    config: JobManagerConfig,
    paused: AtomicBool,
    unsuspend_queue: Mutex<Vec<UnsuspendItem>>,
    tracker: Mutex<ScanTracker>,
}

impl JobManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        reporter: Arc<StateReporter>,
        features: FeatureRegistry,
        config: JobManagerConfig,
    ) -> Self {
        let cache = reporter.cache().clone();
        Self {
            ctx: JobContext {
                runtime,
                reporter,
                cache,
                features: Arc::new(features),
            },
            config,
            paused: AtomicBool::new(false),
            unsuspend_queue: Mutex::new(Vec::new()),
            tracker: Mutex::new(ScanTracker::new()),
        }
    }

    pub fn context(&self) -> &JobContext {
        &self.ctx
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.ctx.runtime
    }

    pub fn reporter(&self) -> &Arc<StateReporter> {
        &self.ctx.reporter
    }

    pub fn cache(&self) -> &Arc<JobCache> {
        &self.ctx.cache
    }

    pub fn config(&self) -> &JobManagerConfig {
        &self.config
    }

    fn accounting(&self) -> &Arc<dyn AccountingClient> {
        self.ctx.reporter.accounting()
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    pub fn set_maintenance(&self, paused: bool) {
        let was = self.paused.swap(paused, Ordering::SeqCst);
        if was != paused {
            info!("Maintenance mode {}", if paused { "enabled" } else { "disabled" });
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub async fn unsuspend_queue_len(&self) -> usize {
        self.unsuspend_queue.lock().await.len()
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Register a job with the accounting authority and create it
    pub async fn register_application(
        &self,
        specification: JobSpecification,
        user: &str,
        project: Option<&str>,
    ) -> Result<Job, JobError> {
        if specification.replicas == 0 {
            return Err(JobError::InvalidRequest("at least one replica is required".into()));
        }
        if self.is_paused() {
            return Err(JobError::ClusterPaused);
        }

        let id = self
            .accounting()
            .register(&specification, user, project)
            .await?;
        let job = self.accounting().retrieve(&id).await?;
        info!("Registered job {} for {}", id, user);

        self.create(job.clone()).await?;
        Ok(job)
    }

    pub async fn create(&self, job: Job) -> Result<(), JobError> {
        self.create_with_expiration(job, None).await
    }

    /// Create a job. If the runtime already has a workload for it the job
    /// is parked in the unsuspend queue until `expiration` instead.
    pub async fn create_with_expiration(
        &self,
        job: Job,
        expiration: Option<DateTime<Utc>>,
    ) -> Result<(), JobError> {
        if self.is_paused() {
            return Err(JobError::ClusterPaused);
        }

        if self.ctx.runtime.is_job_known(&job.id).await? {
            let mut queue = self.unsuspend_queue.lock().await;
            if !queue.iter().any(|item| item.job.id == job.id) {
                let expiration = expiration.unwrap_or_else(|| {
                    Utc::now()
                        + chrono::Duration::from_std(self.config.unsuspend_window)
                            .unwrap_or_else(|_| chrono::Duration::seconds(120))
                });
                debug!("Job {} already has a workload, retrying until {}", job.id, expiration);
                queue.push(UnsuspendItem { job, expiration });
            }
            return Ok(());
        }

        self.unsuspend_queue
            .lock()
            .await
            .retain(|item| item.job.id != job.id);

        if self.config.check_allocation && !self.accounting().check_allocation(&job).await? {
            return Err(JobError::InsufficientFunds);
        }

        self.ctx.reporter.forget(&job.id);
        self.ctx.cache.insert(job.clone());

        let mut builder = self
            .ctx
            .runtime
            .builder(&job.id, job.specification.replicas);
        for feature in self.ctx.features.iter() {
            debug!("Running {} creation hook for job {}", feature.name(), job.id);
            feature
                .on_create(&self.ctx, &job, &mut builder)
                .await
                .map_err(|source| JobError::Feature {
                    feature: feature.name(),
                    source,
                })?;
        }

        self.ctx.runtime.schedule(builder).await?;
        info!(
            "Submitted job {} ({} replicas) to the {} runtime",
            job.id,
            job.specification.replicas,
            self.ctx.runtime.name()
        );
        Ok(())
    }

    // =========================================================================
    // Cancellation and extension
    // =========================================================================

    async fn job_replicas(&self, job_id: &str) -> Result<Vec<Replica>, JobError> {
        let mut replicas: Vec<Replica> = self
            .ctx
            .runtime
            .list()
            .await?
            .into_iter()
            .filter(|r| r.job_id() == job_id)
            .collect();
        replicas.sort_by_key(|r| r.rank());
        Ok(replicas)
    }

    /// Fire completion hooks (when replicas are known) and cleanup hooks.
    /// Hook failures are logged and do not stop the remaining hooks.
    async fn mark_job_as_complete(&self, job_id: &str, replicas: &[Replica]) {
        if let Some(root) = replicas.first() {
            for feature in self.ctx.features.iter() {
                if let Err(e) = feature.on_job_complete(&self.ctx, root, replicas).await {
                    warn!("{} completion hook failed for job {}: {}", feature.name(), job_id, e);
                }
            }
        }
        for feature in self.ctx.features.iter() {
            if let Err(e) = feature.on_cleanup(&self.ctx, job_id).await {
                warn!("{} cleanup hook failed for job {}: {}", feature.name(), job_id, e);
            }
        }
    }

    pub async fn cancel(&self, job_id: &str) -> Result<(), JobError> {
        let replicas = self.job_replicas(job_id).await?;
        self.mark_job_as_complete(job_id, &replicas).await;

        self.ctx.runtime.remove_job_from_queue(job_id).await?;
        self.unsuspend_queue
            .lock()
            .await
            .retain(|item| item.job.id != job_id);

        for replica in &replicas {
            if let Err(e) = replica.cancel(false).await {
                warn!("Failed to cancel rank {} of job {}: {}", replica.rank(), job_id, e);
            }
        }

        let change = StateChange::new(JobState::Success, "Job has been cancelled")
            .allow_restart(false)
            .expect_different_state();
        self.ctx.reporter.change_state(job_id, change).await?;
        info!("Cancelled job {} ({} replicas)", job_id, replicas.len());
        Ok(())
    }

    /// Grant a job more time. Returns the new total allowance in seconds.
    pub async fn extend(&self, job_id: &str, extension: Duration) -> Result<u64, JobError> {
        let expiry = self
            .ctx
            .features
            .find::<ExpiryFeature>()
            .ok_or_else(|| JobError::InvalidRequest("time extension is not supported".into()))?;
        expiry
            .extend(&self.ctx, job_id, extension)
            .await
            .map_err(|source| JobError::Feature {
                feature: "expiry",
                source,
            })
    }

    /// Report jobs the authority considers active but that have no
    /// workload here. Returns how many were lost.
    pub async fn verify_jobs(&self, jobs: &[Job]) -> Result<usize, JobError> {
        let mut lost = 0;
        for job in jobs {
            if job.status.state == JobState::Suspended || job.status.state.is_final() {
                continue;
            }
            if self
                .unsuspend_queue
                .lock()
                .await
                .iter()
                .any(|item| item.job.id == job.id)
            {
                continue;
            }
            match self.ctx.runtime.is_job_known(&job.id).await {
                Ok(true) => {
                    if !self.ctx.cache.contains(&job.id) {
                        self.ctx.cache.insert(job.clone());
                    }
                }
                Ok(false) => {
                    info!("Lost track of job {}", job.id);
                    self.ctx.cache.insert(job.clone());
                    let change =
                        StateChange::new(JobState::Failure, "Compute lost track of this job");
                    self.ctx.reporter.change_state(&job.id, change).await?;
                    lost += 1;
                }
                Err(e) => warn!("Could not verify job {}: {}", job.id, e),
            }
        }
        Ok(lost)
    }

    // =========================================================================
    // Monitoring
    // =========================================================================

    async fn drain_unsuspend_queue(&self) -> usize {
        let items = std::mem::take(&mut *self.unsuspend_queue.lock().await);
        let now = Utc::now();
        let mut attempted = 0;
        for item in items {
            if now >= item.expiration {
                debug!("Giving up on restarting job {}", item.job.id);
                continue;
            }
            attempted += 1;
            let job_id = item.job.id.clone();
            if let Err(e) = self
                .create_with_expiration(item.job, Some(item.expiration))
                .await
            {
                warn!("Failed to restart job {}: {}", job_id, e);
            }
        }
        attempted
    }

    /// One monitoring cycle
    pub async fn monitor_once(&self) -> Result<MonitorSummary, JobError> {
        let mut summary = MonitorSummary {
            unsuspended: self.drain_unsuspend_queue().await,
            ..Default::default()
        };

        let replicas = self.ctx.runtime.list().await?;
        summary.replicas = replicas.len();

        for replica in &replicas {
            if self.ctx.cache.is_final(replica.job_id()) {
                debug!("Stopping leftover rank {} of job {}", replica.rank(), replica.job_id());
                if let Err(e) = replica.cancel(true).await {
                    warn!("Failed to stop rank {} of job {}: {}", replica.rank(), replica.job_id(), e);
                }
            }
        }

        let events = self.tracker.lock().await.process(replicas.clone());
        for event in &events {
            if let Err(e) = self.handle_event(event, &mut summary).await {
                warn!("Failed to process update of job {}: {}", event.job_id, e);
            }
        }

        for feature in self.ctx.features.iter() {
            if let Err(e) = feature.on_job_monitoring(&self.ctx, &replicas).await {
                warn!("{} monitoring hook failed: {}", feature.name(), e);
            }
        }

        Ok(summary)
    }

    async fn handle_event(
        &self,
        event: &JobEvent,
        summary: &mut MonitorSummary,
    ) -> Result<(), JobError> {
        let job_id = event.job_id.as_str();

        if event.was_deleted() || event.is_dying(&self.ctx.cache) {
            let Some(old) = &event.old else {
                return Ok(());
            };
            let already_final = self.ctx.cache.is_final(job_id);
            let expired = replica_expiry(old.root.as_ref()).is_some_and(|at| Utc::now() >= at);
            let pushed = if expired {
                // The expiry feature stops the workload, so the deadline
                // decides whether this was an expiry
                let change = StateChange::new(JobState::Expired, "Job has expired");
                self.ctx.reporter.change_state(job_id, change).await
            } else {
                let change = StateChange::new(JobState::Success, "Job has terminated")
                    .allow_restart(true)
                    .expect_different_state();
                self.ctx.reporter.change_state(job_id, change).await
            };
            match (&pushed, expired) {
                (Ok(true), true) => summary.expirations += 1,
                (Ok(true), false) => summary.terminations += 1,
                _ => {}
            }

            // Cancellation has already run the hooks
            if !already_final {
                self.mark_job_as_complete(job_id, &old.replicas).await;
            }

            // Ranks still alive in a dying job
            if let Some(new) = &event.new {
                for replica in &new.replicas {
                    if let Err(e) = replica.cancel(false).await {
                        warn!("Failed to remove rank {} of job {}: {}", replica.rank(), job_id, e);
                    }
                }
            }
            pushed?;
            return Ok(());
        }

        let Some(new) = &event.new else {
            return Ok(());
        };
        if !event.is_changed() {
            return Ok(());
        }

        summary.updates += 1;
        self.apply_observation(job_id, new).await
    }

    async fn apply_observation(&self, job_id: &str, new: &JobObservation) -> Result<(), JobError> {
        let status = new.status_line();
        match new.state {
            state if state.is_final() => {
                let change = StateChange::new(state, status)
                    .allow_restart(true)
                    .expect_different_state();
                if self.ctx.reporter.change_state(job_id, change).await? {
                    self.mark_job_as_complete(job_id, &new.replicas).await;
                    for replica in &new.replicas {
                        if let Err(e) = replica.cancel(false).await {
                            warn!("Failed to remove rank {} of job {}: {}", replica.rank(), job_id, e);
                        }
                    }
                }
            }
            JobState::Running => {
                let was_running = self
                    .ctx
                    .reporter
                    .current(job_id)
                    .is_some_and(|(state, _)| state == JobState::Running);
                let change = StateChange::new(JobState::Running, status).expect_different_state();
                let changed = self.ctx.reporter.change_state(job_id, change).await?;
                if changed && !was_running {
                    for feature in self.ctx.features.iter() {
                        if let Err(e) = feature.on_job_start(&self.ctx, &new.root, &new.replicas).await {
                            warn!("{} start hook failed for job {}: {}", feature.name(), job_id, e);
                        }
                    }
                }
            }
            state => {
                self.ctx
                    .reporter
                    .change_state(job_id, StateChange::new(state, status))
                    .await?;
            }
        }
        Ok(())
    }
}

/// Run [`JobManager::monitor_once`] every `monitor_interval` until shutdown
pub fn spawn_monitoring(manager: Arc<JobManager>) -> watch::Sender<bool> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let interval = manager.config.monitor_interval;
        info!("Starting job monitoring (interval={:?})", interval);
        loop {
            let started = Instant::now();
            match manager.monitor_once().await {
                Ok(summary) if summary.has_activity() => info!(
                    "Monitoring: {} replicas, {} updates, {} terminations, {} expirations, {} restarts",
                    summary.replicas,
                    summary.updates,
                    summary.terminations,
                    summary.expirations,
                    summary.unsuspended
                ),
                Ok(summary) => debug!("Monitoring: {} replicas, no changes", summary.replicas),
                Err(e) => warn!("Monitoring cycle failed: {}", e),
            }

            let wait = interval.saturating_sub(started.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Job monitoring shutting down");
                        break;
                    }
                }
            }
        }
    });

    shutdown_tx
}
