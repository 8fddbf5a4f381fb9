//! Cluster resource API access
//!
//! - `locator`: addressing of resources by group/version/namespace/name
//! - `connection`: kubeconfig, in-cluster and direct connection sources
//! - `auth`: bearer token, basic auth and local proxy strategies
//! - `client`: CRUD, patch, watch and streamed sub-resources
//! - `objects`: typed views of the objects the runtimes use
//! - `quantity`: resource quantity parsing

pub mod auth;
pub mod client;
pub mod connection;
pub mod locator;
pub mod objects;
pub mod quantity;

pub use auth::{AuthMethod, KubectlProxy};
pub use client::{escape_pointer, ClientConfig, ClientError, JsonPatchOp, PatchType, ResourceClient};
pub use connection::{resolve, Connection, ConnectionSource};
pub use locator::{resources, ResourceLocator, API_GROUP_CORE, NAMESPACE_ANY};
