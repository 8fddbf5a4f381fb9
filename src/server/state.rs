use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::jobs::JobManager;
use crate::runtime::{ContainerRuntime, Tunnel};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<JobManager>,
    /// Tunnels handed out to clients, kept open until closed through the API
    pub tunnels: Arc<DashMap<Uuid, Tunnel>>,
    pub started_at: DateTime<Utc>,
    pub max_concurrent_requests: usize,
}

pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 256;

impl AppState {
    pub fn new(manager: Arc<JobManager>) -> Self {
        Self {
            manager,
            tunnels: Arc::new(DashMap::new()),
            started_at: Utc::now(),
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
        }
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.max_concurrent_requests = limit.max(1);
        self
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        self.manager.runtime()
    }

    pub fn register_tunnel(&self, tunnel: Tunnel) -> Uuid {
        let id = tunnel.id;
        self.tunnels.insert(id, tunnel);
        id
    }

    pub fn take_tunnel(&self, id: &Uuid) -> Option<Tunnel> {
        self.tunnels.remove(id).map(|(_, tunnel)| tunnel)
    }

    pub fn open_tunnel_count(&self) -> usize {
        self.tunnels.len()
    }
}
