//! Job management: model, cache, feature pipeline and the lifecycle
//! manager with its monitoring loop

pub mod cache;
pub mod events;
pub mod features;
pub mod manager;
pub mod model;

pub use cache::JobCache;
pub use events::{JobEvent, JobObservation, ScanTracker};
pub use features::{
    ExpiryFeature, FeatureError, FeatureRegistry, JobContext, JobFeature, LoggingFeature,
    TaskFeature,
};
pub use manager::{spawn_monitoring, JobError, JobManager, JobManagerConfig, MonitorSummary};
pub use model::{Job, JobOwner, JobSpecification, JobState, JobStatus, MountSpec};
