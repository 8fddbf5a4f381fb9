//! Resolution of cluster connection settings
//!
//! Supports kubeconfig files, the in-cluster service account and a direct
//! URL. `Auto` picks in-cluster when a service account token is mounted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::auth::{AuthMethod, KubectlProxy, PROXY_PORT};
use super::client::ClientError;

pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
pub const IN_CLUSTER_URL: &str = "https://kubernetes.default.svc";

// ============================================================================
// SBIO: Pure data structures
// ============================================================================

/// Where connection settings come from
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(tag = "source", rename_all = "kebab-case")]
pub enum ConnectionSource {
    #[default]
    Auto,
    Kubeconfig {
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        context: Option<String>,
    },
    InCluster {
        #[serde(default)]
        service_url: Option<String>,
    },
    Direct {
        url: String,
        #[serde(default)]
        token: Option<String>,
    },
}

/// Fully resolved connection settings
#[derive(Debug, Clone)]
pub struct Connection {
    pub master_url: String,
    pub auth: AuthMethod,
    pub namespace: Option<String>,
    pub ca_cert_pem: Option<Vec<u8>>,
    pub insecure: bool,
}

impl Connection {
    pub fn new(master_url: impl Into<String>, auth: AuthMethod) -> Self {
        Self {
            master_url: master_url.into(),
            auth,
            namespace: None,
            ca_cert_pem: None,
            insecure: false,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct KubeConfig {
    #[serde(default)]
    pub clusters: Vec<NamedCluster>,
    #[serde(default)]
    pub contexts: Vec<NamedContext>,
    #[serde(default)]
    pub users: Vec<NamedUser>,
    #[serde(rename = "current-context", default)]
    pub current_context: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: ClusterEntry,
}

#[derive(Debug, Deserialize)]
pub struct ClusterEntry {
    pub server: String,
    #[serde(rename = "certificate-authority-data", default)]
    pub certificate_authority_data: Option<String>,
    #[serde(rename = "certificate-authority", default)]
    pub certificate_authority: Option<String>,
    #[serde(rename = "insecure-skip-tls-verify", default)]
    pub insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: ContextEntry,
}

#[derive(Debug, Deserialize)]
pub struct ContextEntry {
    pub cluster: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NamedUser {
    pub name: String,
    pub user: UserEntry,
}

#[derive(Debug, Default, Deserialize)]
pub struct UserEntry {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl KubeConfig {
    pub fn from_str(content: &str) -> Result<Self, ClientError> {
        serde_yaml::from_str(content)
            .map_err(|e| ClientError::Config(format!("invalid kubeconfig: {e}")))
    }

    /// Resolve a context (or the current one) into a connection.
    /// Certificate files referenced by path are not read here.
    pub fn connection(&self, context: Option<&str>) -> Result<Connection, ClientError> {
        let context_name = context
            .map(str::to_string)
            .or_else(|| self.current_context.clone())
            .ok_or_else(|| ClientError::Config("kubeconfig has no current-context".into()))?;

        let ctx = self
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .ok_or_else(|| ClientError::Config(format!("unknown context '{context_name}'")))?;

        let cluster = self
            .clusters
            .iter()
            .find(|c| c.name == ctx.context.cluster)
            .ok_or_else(|| {
                ClientError::Config(format!("unknown cluster '{}'", ctx.context.cluster))
            })?;

        let user = ctx
            .context
            .user
            .as_ref()
            .and_then(|name| self.users.iter().find(|u| &u.name == name))
            .map(|u| &u.user);

        let auth = match user {
            Some(UserEntry {
                token: Some(token), ..
            }) => AuthMethod::Token(token.clone()),
            Some(UserEntry {
                username: Some(username),
                password: Some(password),
                ..
            }) => AuthMethod::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            _ => AuthMethod::Anonymous,
        };

        let ca_cert_pem = match &cluster.cluster.certificate_authority_data {
            Some(data) => Some(
                base64::engine::general_purpose::STANDARD
                    .decode(data.trim())
                    .map_err(|e| ClientError::Config(format!("invalid CA data: {e}")))?,
            ),
            None => None,
        };

        Ok(Connection {
            master_url: cluster.cluster.server.clone(),
            auth,
            namespace: ctx.context.namespace.clone(),
            ca_cert_pem,
            insecure: cluster.cluster.insecure_skip_tls_verify,
        })
    }
}

// ============================================================================
// SBIO: I/O implementation
// ============================================================================

fn default_kubeconfig_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("KUBECONFIG") {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    dirs::home_dir().map(|home| home.join(".kube").join("config"))
}

fn expand_path(path: &str) -> Result<PathBuf, ClientError> {
    shellexpand::full(path)
        .map(|p| PathBuf::from(p.as_ref()))
        .map_err(|e| ClientError::Config(format!("cannot expand '{path}': {e}")))
}

fn load_kubeconfig(path: &Path, context: Option<&str>) -> Result<Connection, ClientError> {
    let content = std::fs::read_to_string(path)?;
    let config = KubeConfig::from_str(&content)?;
    let mut connection = config.connection(context)?;

    if connection.ca_cert_pem.is_none() {
        let ca_path = config
            .contexts
            .iter()
            .find(|c| Some(c.name.as_str()) == context.or(config.current_context.as_deref()))
            .and_then(|ctx| config.clusters.iter().find(|c| c.name == ctx.context.cluster))
            .and_then(|c| c.cluster.certificate_authority.clone());
        if let Some(ca_path) = ca_path {
            connection.ca_cert_pem = Some(std::fs::read(expand_path(&ca_path)?)?);
        }
    }

    Ok(connection)
}

fn load_in_cluster(service_url: Option<&str>) -> Result<Connection, ClientError> {
    let dir = Path::new(SERVICE_ACCOUNT_DIR);
    let token = std::fs::read_to_string(dir.join("token"))?;
    let ca_cert_pem = std::fs::read(dir.join("ca.crt")).ok();
    let namespace = std::fs::read_to_string(dir.join("namespace"))
        .ok()
        .map(|ns| ns.trim().to_string());

    Ok(Connection {
        master_url: service_url.unwrap_or(IN_CLUSTER_URL).to_string(),
        auth: AuthMethod::Token(token.trim().to_string()),
        namespace,
        ca_cert_pem,
        insecure: false,
    })
}

/// Resolve a connection source. With `use_proxy` every request is routed
/// through a local `kubectl proxy`, which handles credentials itself.
pub fn resolve(source: &ConnectionSource, use_proxy: bool) -> Result<Connection, ClientError> {
    let mut connection = match source {
        ConnectionSource::Direct { url, token } => Connection::new(
            url.clone(),
            token
                .clone()
                .map(AuthMethod::Token)
                .unwrap_or(AuthMethod::Anonymous),
        ),
        ConnectionSource::InCluster { service_url } => load_in_cluster(service_url.as_deref())?,
        ConnectionSource::Kubeconfig { path, context } => {
            let path = match path {
                Some(p) => expand_path(p)?,
                None => default_kubeconfig_path()
                    .ok_or_else(|| ClientError::Config("no home directory".into()))?,
            };
            load_kubeconfig(&path, context.as_deref())?
        }
        ConnectionSource::Auto => {
            if Path::new(SERVICE_ACCOUNT_DIR).join("token").exists() {
                debug!("Using in-cluster service account");
                load_in_cluster(None)?
            } else {
                let path = default_kubeconfig_path()
                    .ok_or_else(|| ClientError::Config("no home directory".into()))?;
                debug!("Using kubeconfig at {}", path.display());
                load_kubeconfig(&path, None)?
            }
        }
    };

    if use_proxy {
        connection.auth = AuthMethod::Proxy(Arc::new(KubectlProxy::new(PROXY_PORT)));
    }

    Ok(connection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: dev
clusters:
  - name: dev-cluster
    cluster:
      server: https://dev.example:6443
      insecure-skip-tls-verify: true
  - name: prod-cluster
    cluster:
      server: https://prod.example:6443
contexts:
  - name: dev
    context:
      cluster: dev-cluster
      user: dev-user
      namespace: jobs
  - name: prod
    context:
      cluster: prod-cluster
      user: prod-user
users:
  - name: dev-user
    user:
      token: dev-token
  - name: prod-user
    user:
      username: admin
      password: hunter2
"#;

    #[test]
    fn test_current_context() {
        let config = KubeConfig::from_str(KUBECONFIG).unwrap();
        let conn = config.connection(None).unwrap();
        assert_eq!(conn.master_url, "https://dev.example:6443");
        assert_eq!(conn.namespace.as_deref(), Some("jobs"));
        assert!(conn.insecure);
        assert!(matches!(conn.auth, AuthMethod::Token(ref t) if t == "dev-token"));
    }

    #[test]
    fn test_explicit_context_with_basic_auth() {
        let config = KubeConfig::from_str(KUBECONFIG).unwrap();
        let conn = config.connection(Some("prod")).unwrap();
        assert_eq!(conn.master_url, "https://prod.example:6443");
        assert!(matches!(conn.auth, AuthMethod::Basic { ref username, .. } if username == "admin"));
    }

    #[test]
    fn test_unknown_context() {
        let config = KubeConfig::from_str(KUBECONFIG).unwrap();
        assert!(matches!(
            config.connection(Some("staging")),
            Err(ClientError::Config(_))
        ));
    }

    #[test]
    fn test_resolve_kubeconfig_file_with_proxy() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(KUBECONFIG.as_bytes()).unwrap();

        let source = ConnectionSource::Kubeconfig {
            path: Some(file.path().display().to_string()),
            context: None,
        };
        let conn = resolve(&source, true).unwrap();
        assert!(matches!(conn.auth, AuthMethod::Proxy(_)));
        assert_eq!(conn.auth.effective_base_url(&conn.master_url), "http://localhost:42010");
    }

    #[test]
    fn test_source_from_yaml() {
        let source: ConnectionSource =
            serde_yaml::from_str("source: direct\nurl: http://127.0.0.1:8001\n").unwrap();
        assert_eq!(
            source,
            ConnectionSource::Direct {
                url: "http://127.0.0.1:8001".to_string(),
                token: None
            }
        );
    }
}
