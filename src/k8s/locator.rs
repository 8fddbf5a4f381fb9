//! Addressing of cluster resources
//!
//! A locator names one resource type (optionally one object) under an
//! API group, version and namespace, and renders the request path for it.

use std::fmt;

/// Group name of the legacy core API (`/api/v1`)
pub const API_GROUP_CORE: &str = "";

/// Namespace wildcard: the path is rendered without a namespace segment
pub const NAMESPACE_ANY: &str = "#ANY";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLocator {
    pub api_group: String,
    pub version: String,
    pub resource_type: String,
    pub name: Option<String>,
    pub namespace: Option<String>,
}

impl ResourceLocator {
    pub fn new(
        api_group: impl Into<String>,
        version: impl Into<String>,
        resource_type: impl Into<String>,
    ) -> Self {
        Self {
            api_group: api_group.into(),
            version: version.into(),
            resource_type: resource_type.into(),
            name: None,
            namespace: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_name_and_namespace(
        self,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        self.with_name(name).with_namespace(namespace)
    }

    /// Render the request path, relative to the API server root.
    ///
    /// `operation` addresses a sub-resource of a named object (e.g. `log`).
    pub fn path(&self, operation: Option<&str>) -> String {
        let mut path = String::new();
        if self.api_group == API_GROUP_CORE {
            path.push_str("/api/");
        } else {
            path.push_str("/apis/");
            path.push_str(&self.api_group);
            path.push('/');
        }
        path.push_str(&self.version);
        path.push('/');

        if let Some(ns) = &self.namespace {
            if ns != NAMESPACE_ANY {
                path.push_str("namespaces/");
                path.push_str(ns);
                path.push('/');
            }
        }

        path.push_str(&self.resource_type);

        if let Some(name) = &self.name {
            path.push('/');
            path.push_str(name);
        }

        if let Some(op) = operation {
            path.push('/');
            path.push_str(op);
        }

        path
    }
}

impl fmt::Display for ResourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path(None))
    }
}

/// Locators for the resource types used by the runtime backends
pub mod resources {
    use super::{ResourceLocator, API_GROUP_CORE};

    pub fn pods() -> ResourceLocator {
        ResourceLocator::new(API_GROUP_CORE, "v1", "pods")
    }

    pub fn nodes() -> ResourceLocator {
        ResourceLocator::new(API_GROUP_CORE, "v1", "nodes")
    }

    pub fn services() -> ResourceLocator {
        ResourceLocator::new(API_GROUP_CORE, "v1", "services")
    }

    pub fn namespaces() -> ResourceLocator {
        ResourceLocator::new(API_GROUP_CORE, "v1", "namespaces")
    }

    pub fn network_policies() -> ResourceLocator {
        ResourceLocator::new("networking.k8s.io", "v1", "networkpolicies")
    }

    pub fn batch_jobs() -> ResourceLocator {
        ResourceLocator::new("batch.volcano.sh", "v1alpha1", "jobs")
    }
}
