//! Time limits
//!
//! The limit is recorded on the workload at creation. When the job starts
//! the absolute deadline is written next to it, and monitoring cancels
//! roots whose deadline has passed. The monitoring loop recognises the
//! resulting disappearance as an expiry by reading the same annotation.

use std::any::Any;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::{FeatureError, JobContext, JobFeature};
use crate::jobs::model::Job;
use crate::runtime::{ContainerBuilder, ContainerReplica, Replica, RuntimeError};

/// Allowed run time in seconds
pub const MAX_TIME_ANNOTATION: &str = "clusterjobs/max-time";
/// Absolute deadline, RFC 3339
pub const EXPIRY_ANNOTATION: &str = "clusterjobs/expiry";
pub const STARTED_AT_ANNOTATION: &str = "clusterjobs/started-at";

pub fn replica_max_time(replica: &dyn ContainerReplica) -> Option<u64> {
    replica.annotation(MAX_TIME_ANNOTATION)?.parse().ok()
}

pub fn replica_expiry(replica: &dyn ContainerReplica) -> Option<DateTime<Utc>> {
    let raw = replica.annotation(EXPIRY_ANNOTATION)?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// `from + secs`, saturating at the latest representable time
fn deadline(from: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    let secs = i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000);
    from.checked_add_signed(chrono::Duration::seconds(secs))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, Default)]
pub struct ExpiryFeature {
    default_max_time: Option<Duration>,
}

impl ExpiryFeature {
    pub fn new(default_max_time: Option<Duration>) -> Self {
        Self { default_max_time }
    }

    /// Grant a running job more time. Returns the new total allowance in
    /// seconds.
    pub async fn extend(
        &self,
        ctx: &JobContext,
        job_id: &str,
        extension: Duration,
    ) -> Result<u64, FeatureError> {
        let root = ctx
            .runtime
            .retrieve(job_id, 0)
            .await?
            .ok_or_else(|| RuntimeError::ReplicaNotFound(job_id.to_string(), 0))?;

        let current = replica_max_time(root.as_ref())
            .ok_or_else(|| FeatureError::InvalidJob(format!("job {job_id} has no time limit")))?;
        let allowance = current.saturating_add(extension.as_secs());
        root.upsert_annotation(MAX_TIME_ANNOTATION, &allowance.to_string())
            .await?;

        if let Some(expiry) = replica_expiry(root.as_ref()) {
            let expiry = deadline(expiry, extension.as_secs());
            root.upsert_annotation(EXPIRY_ANNOTATION, &expiry.to_rfc3339())
                .await?;
            ctx.cache
                .modify(job_id, |job| job.status.expires_at = Some(expiry));
        }

        ctx.reporter.push_time_allocation(job_id, allowance).await?;
        info!(
            "Extended job {} by {}s (allowance now {}s)",
            job_id,
            extension.as_secs(),
            allowance
        );
        Ok(allowance)
    }
}

#[async_trait]
impl JobFeature for ExpiryFeature {
    fn name(&self) -> &'static str {
        "expiry"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    async fn on_create(
        &self,
        _ctx: &JobContext,
        job: &Job,
        builder: &mut ContainerBuilder,
    ) -> Result<(), FeatureError> {
        let max_time = job
            .specification
            .max_time_secs
            .or(self.default_max_time.map(|d| d.as_secs()));
        if let Some(secs) = max_time {
            builder.upsert_annotation(MAX_TIME_ANNOTATION, secs.to_string());
        }
        Ok(())
    }

    async fn on_job_start(
        &self,
        ctx: &JobContext,
        root: &Replica,
        _replicas: &[Replica],
    ) -> Result<(), FeatureError> {
        // A restarted job keeps its original deadline
        if root.annotation(EXPIRY_ANNOTATION).is_some() {
            return Ok(());
        }
        let Some(max_time) = replica_max_time(root.as_ref()) else {
            return Ok(());
        };

        let now = Utc::now();
        let expiry = deadline(now, max_time);
        root.upsert_annotation(STARTED_AT_ANNOTATION, &now.to_rfc3339())
            .await?;
        root.upsert_annotation(EXPIRY_ANNOTATION, &expiry.to_rfc3339())
            .await?;
        ctx.cache.modify(root.job_id(), |job| {
            job.status.started_at = Some(now);
            job.status.expires_at = Some(expiry);
        });
        Ok(())
    }

    async fn on_job_monitoring(
        &self,
        _ctx: &JobContext,
        replicas: &[Replica],
    ) -> Result<(), FeatureError> {
        let now = Utc::now();
        for root in replicas.iter().filter(|r| r.rank() == 0) {
            let Some(expiry) = replica_expiry(root.as_ref()) else {
                continue;
            };
            if now < expiry {
                continue;
            }
            info!("Job {} has expired, stopping it", root.job_id());
            if let Err(e) = root.cancel(false).await {
                warn!("Failed to stop expired job {}: {}", root.job_id(), e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_saturates() {
        let start = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(deadline(start, 90).to_rfc3339(), "2024-01-01T00:01:30+00:00");
        assert_eq!(deadline(start, u64::MAX), DateTime::<Utc>::MAX_UTC);
    }
}
