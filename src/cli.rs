use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::config::{default_config_path, Config, RuntimeBackend};

#[derive(Parser, Debug)]
#[command(name = "clusterjobs")]
#[command(about = "Run and track compute jobs on a Kubernetes cluster")]
#[command(version)]
pub struct Args {
    /// Path to the YAML config file (default: ~/.clusterjobs/config.yaml)
    #[arg(short, long, value_name = "FILE", env = "CLUSTERJOBS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Dry-run mode: validate config and show the resolved settings without running
    #[arg(long)]
    pub dry_run: bool,

    /// Override the server bind address
    #[arg(long, value_name = "ADDR")]
    pub bind_addr: Option<String>,

    /// Override the server port
    #[arg(short, long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Path to a .env file for loading tokens
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Start with maintenance mode enabled
    #[arg(long)]
    pub paused: bool,
}

impl Args {
    /// Config file this invocation reads
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(default_config_path)
    }
}

/// Apply command line overrides on top of the loaded config
pub fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(ref addr) = args.bind_addr {
        config.server.bind_addr = addr.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
}

// ============================================================================
// SBIO: Pure display logic (no I/O - returns formatted strings)
// ============================================================================

fn backend_name(backend: RuntimeBackend) -> &'static str {
    match backend {
        RuntimeBackend::Batch => "batch (one batch workload per job)",
        RuntimeBackend::Pods => "pods (one bare pod per replica)",
        RuntimeBackend::Scheduled => "scheduled (bare pods placed by the in-process scheduler)",
    }
}

/// Format a dry-run output showing the resolved configuration.
/// Pure function - returns a formatted string.
pub fn format_dry_run(config: &Config, args: &Args) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "clusterjobs v{} - Dry Run Mode\n\n",
        env!("CARGO_PKG_VERSION")
    ));
    output.push_str(&format!("Config: {}\n\n", args.config_path().display()));

    output.push_str(&format!("Runtime: {}\n", backend_name(config.runtime.backend)));
    output.push_str(&format!("Namespace: {}\n", config.kubernetes.namespace));
    if config.runtime.backend == RuntimeBackend::Scheduled {
        output.push_str(&format!(
            "Scheduler: tick {}ms, pod scan {}s, node scan {}s\n",
            config.scheduler.tick_ms, config.scheduler.pod_scan_secs, config.scheduler.node_scan_secs
        ));
    }

    if !config.kubernetes.category_selectors.is_empty() {
        output.push_str(&format!(
            "\nCategories ({}):\n",
            config.kubernetes.category_selectors.len()
        ));
        for (category, node_type) in &config.kubernetes.category_selectors {
            output.push_str(&format!(
                "  - {} -> {}={}\n",
                category, config.kubernetes.node_type_label, node_type
            ));
        }
    }

    output.push_str(&format!("\nAccounting: {}\n", config.accounting.base_url));
    match config.jobs.default_max_time_secs {
        Some(secs) => output.push_str(&format!("Default max time: {}s\n", secs)),
        None => output.push_str("Default max time: unlimited\n"),
    }
    output.push_str(&format!(
        "Server: {}:{}\n",
        config.server.bind_addr, config.server.port
    ));

    output.push_str("\nResolved configuration:\n");
    match serde_yaml::to_string(config) {
        Ok(yaml) => {
            for line in yaml.lines() {
                output.push_str(&format!("  {}\n", line));
            }
        }
        Err(e) => output.push_str(&format!("  <unprintable: {}>\n", e)),
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let args = Args::try_parse_from([
            "clusterjobs",
            "-vv",
            "--config",
            "/etc/clusterjobs.yaml",
            "--port",
            "9000",
            "--dry-run",
        ])
        .unwrap();

        assert_eq!(args.verbose, 2);
        assert_eq!(args.config_path(), PathBuf::from("/etc/clusterjobs.yaml"));
        assert_eq!(args.port, Some(9000));
        assert!(args.dry_run);
        assert!(!args.paused);
    }

    #[test]
    fn test_overrides_replace_server_settings() {
        let args =
            Args::try_parse_from(["clusterjobs", "--bind-addr", "127.0.0.1", "-p", "9100"]).unwrap();
        let mut config = Config::default();

        apply_overrides(&mut config, &args);

        assert_eq!(config.server.bind_addr, "127.0.0.1");
        assert_eq!(config.server.port, 9100);
    }

    #[test]
    fn test_dry_run_lists_categories() {
        let args = Args::try_parse_from(["clusterjobs", "--config", "c.yaml"]).unwrap();
        let mut config = Config::default();
        config.runtime.backend = RuntimeBackend::Scheduled;
        config
            .kubernetes
            .category_selectors
            .insert("u1-gpu".to_string(), "gpu-node".to_string());

        let output = format_dry_run(&config, &args);

        assert!(output.contains("Dry Run Mode"));
        assert!(output.contains("Runtime: scheduled"));
        assert!(output.contains("Scheduler: tick 20ms"));
        assert!(output.contains("u1-gpu -> ucloud.dk/machine=gpu-node"));
        assert!(output.contains("namespace: app-kubernetes"));
    }
}
