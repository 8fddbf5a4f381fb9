//! Service configuration
//!
//! Loaded from YAML (`~/.clusterjobs/config.yaml` unless a path is given).
//! Every section and field has a default, so an empty or missing file
//! yields a working local setup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::jobs::JobManagerConfig;
use crate::k8s::ConnectionSource;
use crate::runtime::pods::DEFAULT_NODE_TYPE_LABEL;
use crate::runtime::scheduled::ScheduledRuntimeConfig;

pub const DEFAULT_NAMESPACE: &str = "app-kubernetes";
pub const DEFAULT_PORT: u16 = 8080;

/// Default config file location: ~/.clusterjobs/config.yaml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".clusterjobs")
        .join("config.yaml")
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to expand '{0}': {1}")]
    Expand(String, String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// SBIO: Pure data structures
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub kubernetes: KubernetesConfig,
    pub runtime: RuntimeConfig,
    pub scheduler: SchedulerConfig,
    pub jobs: JobsConfig,
    pub accounting: AccountingConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    pub connection: ConnectionSource,
    pub namespace: String,
    /// Authenticate through a local `kubectl proxy`
    pub use_proxy: bool,
    /// Open tunnels through `kubectl port-forward` instead of the pod IP
    pub port_forward_tunnels: bool,
    /// Product category to node type
    pub category_selectors: BTreeMap<String, String>,
    pub node_type_label: String,
    pub default_node_type: String,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionSource::Auto,
            namespace: DEFAULT_NAMESPACE.to_string(),
            use_proxy: false,
            port_forward_tunnels: false,
            category_selectors: BTreeMap::new(),
            node_type_label: DEFAULT_NODE_TYPE_LABEL.to_string(),
            default_node_type: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeBackend {
    /// One batch workload per job, placed by the cluster's batch scheduler
    #[default]
    Batch,
    /// Bare pods placed by the cluster
    Pods,
    /// Bare pods placed by the in-process scheduler
    Scheduled,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub backend: RuntimeBackend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_ms: u64,
    pub pod_scan_secs: u64,
    pub node_scan_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: 20,
            pod_scan_secs: 30,
            node_scan_secs: 900,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub monitor_interval_secs: u64,
    pub unsuspend_window_secs: u64,
    pub default_max_time_secs: Option<u64>,
    pub check_allocation: bool,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            monitor_interval_secs: 5,
            unsuspend_window_secs: 120,
            default_max_time_secs: None,
            check_allocation: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountingConfig {
    pub base_url: String,
    /// Bearer token; `$VAR` references are expanded at startup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for AccountingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8888".to_string(),
            token: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_concurrent_requests: 256,
        }
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    if content.trim().is_empty() {
        return Ok(Config::default());
    }
    serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Expand `~` and `$VAR` references
pub fn expand_value(value: &str) -> Result<String, ConfigError> {
    shellexpand::full(value)
        .map(|v| v.into_owned())
        .map_err(|e| ConfigError::Expand(value.to_string(), e.to_string()))
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kubernetes.namespace.trim().is_empty() {
            return Err(ConfigError::Invalid("kubernetes.namespace is empty".into()));
        }
        if self.scheduler.tick_ms == 0 {
            return Err(ConfigError::Invalid("scheduler.tick_ms must be positive".into()));
        }
        if self.jobs.monitor_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "jobs.monitor_interval_secs must be positive".into(),
            ));
        }
        if self.server.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid(
                "server.max_concurrent_requests must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn accounting_token(&self) -> Result<Option<String>, ConfigError> {
        self.accounting
            .token
            .as_deref()
            .map(expand_value)
            .transpose()
    }

    pub fn scheduled_runtime(&self) -> ScheduledRuntimeConfig {
        ScheduledRuntimeConfig {
            tick: Duration::from_millis(self.scheduler.tick_ms),
            pod_scan_interval: Duration::from_secs(self.scheduler.pod_scan_secs),
            node_scan_interval: Duration::from_secs(self.scheduler.node_scan_secs),
            default_node_type: self.kubernetes.default_node_type.clone(),
            node_type_label: self.kubernetes.node_type_label.clone(),
        }
    }

    pub fn job_manager(&self) -> JobManagerConfig {
        JobManagerConfig {
            monitor_interval: Duration::from_secs(self.jobs.monitor_interval_secs),
            unsuspend_window: Duration::from_secs(self.jobs.unsuspend_window_secs),
            check_allocation: self.jobs.check_allocation,
        }
    }
}

// ============================================================================
// SBIO: I/O wrapper
// ============================================================================

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
    let config = parse_config(&content)?;
    config.validate()?;
    Ok(config)
}

/// Load an explicitly requested file, or the default file when present
pub fn load_or_default(path: Option<&Path>) -> Result<Config, ConfigError> {
    match path {
        Some(path) => load_config(path),
        None => {
            let path = default_config_path();
            if path.exists() {
                load_config(&path)
            } else {
                Ok(Config::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.kubernetes.namespace, DEFAULT_NAMESPACE);
        assert_eq!(config.runtime.backend, RuntimeBackend::Batch);
        assert_eq!(config.scheduled_runtime().tick, Duration::from_millis(20));
        assert_eq!(
            config.job_manager().unsuspend_window,
            Duration::from_secs(120)
        );
    }

    #[test]
    fn test_load_config_file() {
        let file = create_temp_file(
            r#"
kubernetes:
  connection:
    source: kubeconfig
    context: dev
  namespace: jobs
  category_selectors:
    u1-gpu: gpu
runtime:
  backend: scheduled
scheduler:
  pod_scan_secs: 10
server:
  port: 9090
"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(
            config.kubernetes.connection,
            ConnectionSource::Kubeconfig {
                path: None,
                context: Some("dev".into())
            }
        );
        assert_eq!(config.kubernetes.namespace, "jobs");
        assert_eq!(config.kubernetes.category_selectors["u1-gpu"], "gpu");
        assert_eq!(config.runtime.backend, RuntimeBackend::Scheduled);
        assert_eq!(config.scheduler.pod_scan_secs, 10);
        assert_eq!(config.scheduler.node_scan_secs, 900);
        assert_eq!(config.server.port, 9090);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let file = create_temp_file("scheduler:\n  tick_ms: 0\n");
        assert!(matches!(load_config(file.path()), Err(ConfigError::Invalid(_))));

        let result = parse_config("runtime:\n  backend: slurm\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = load_config(Path::new("/nonexistent/config.yaml"));
        assert!(matches!(result, Err(ConfigError::Io(..))));
    }

    #[test]
    fn test_token_expansion() {
        std::env::set_var("CLUSTERJOBS_TEST_TOKEN", "s3cret");
        let mut config = Config::default();
        config.accounting.token = Some("$CLUSTERJOBS_TEST_TOKEN".into());
        assert_eq!(config.accounting_token().unwrap().as_deref(), Some("s3cret"));

        config.accounting.token = Some("$CLUSTERJOBS_TEST_UNSET_VAR".into());
        assert!(matches!(
            config.accounting_token(),
            Err(ConfigError::Expand(..))
        ));
    }
}
