//! Compute job supervision on a Kubernetes-style cluster
//!
//! - `k8s`: resource API client
//! - `scheduler`: bin-packing replica placement
//! - `runtime`: container runtimes backed by batch workloads or bare pods
//! - `jobs`: job model, feature pipeline and monitoring loop
//! - `accounting`: client for the authority that owns jobs and billing
//! - `server`: HTTP API

pub mod accounting;
pub mod cli;
pub mod config;
pub mod jobs;
pub mod k8s;
pub mod runtime;
pub mod scheduler;
pub mod server;
