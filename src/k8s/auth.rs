//! Authentication strategies for the cluster API
//!
//! Resolved once per client lifetime. The proxy strategy keeps a local
//! `kubectl proxy` subprocess alive and routes every request through it.

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use reqwest::RequestBuilder;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Default port of the local proxy subprocess
pub const PROXY_PORT: u16 = 42010;

#[derive(Clone)]
pub enum AuthMethod {
    /// No credentials (e.g. an already-authenticated local endpoint)
    Anonymous,
    Token(String),
    Basic { username: String, password: String },
    Proxy(Arc<KubectlProxy>),
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Anonymous => write!(f, "Anonymous"),
            AuthMethod::Token(_) => write!(f, "Token(***)"),
            AuthMethod::Basic { username, .. } => write!(f, "Basic({username}:***)"),
            AuthMethod::Proxy(p) => write!(f, "Proxy(port={})", p.port),
        }
    }
}

impl AuthMethod {
    /// Attach credentials to an outgoing request
    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            AuthMethod::Token(token) => request.bearer_auth(token),
            AuthMethod::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            AuthMethod::Anonymous | AuthMethod::Proxy(_) => request,
        }
    }

    /// Value of the `Authorization` header, for transports that are not
    /// built through reqwest (exec websockets).
    pub fn authorization_header(&self) -> Option<String> {
        match self {
            AuthMethod::Token(token) => Some(format!("Bearer {token}")),
            AuthMethod::Basic { username, password } => {
                let raw = format!("{username}:{password}");
                Some(format!(
                    "Basic {}",
                    base64::engine::general_purpose::STANDARD.encode(raw)
                ))
            }
            AuthMethod::Anonymous | AuthMethod::Proxy(_) => None,
        }
    }

    /// The base URL requests should actually go to
    pub fn effective_base_url(&self, master_url: &str) -> String {
        match self {
            AuthMethod::Proxy(p) => p.base_url(),
            _ => master_url.trim_end_matches('/').to_string(),
        }
    }

    /// Make sure the transport is usable before a request is sent
    pub async fn prepare(&self) -> std::io::Result<()> {
        match self {
            AuthMethod::Proxy(p) => p.ensure_running().await,
            _ => Ok(()),
        }
    }
}

/// A `kubectl proxy` subprocess, restarted whenever it has exited
pub struct KubectlProxy {
    port: u16,
    kubectl: String,
    child: Mutex<Option<Child>>,
}

impl KubectlProxy {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            kubectl: "kubectl".to_string(),
            child: Mutex::new(None),
        }
    }

    /// Use a specific kubectl binary
    pub fn with_binary(mut self, kubectl: impl Into<String>) -> Self {
        self.kubectl = kubectl.into();
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }

    pub async fn ensure_running(&self) -> std::io::Result<()> {
        let mut guard = self.child.lock().await;

        let alive = match guard.as_mut() {
            Some(child) => match child.try_wait()? {
                None => true,
                Some(status) => {
                    warn!("kubectl proxy exited with {}, restarting", status);
                    false
                }
            },
            None => false,
        };

        if alive {
            return Ok(());
        }

        info!("Starting kubectl proxy on port {}", self.port);
        let child = Command::new(&self.kubectl)
            .arg("proxy")
            .arg("--disable-filter=true")
            .arg("--port")
            .arg(self.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        *guard = Some(child);
        drop(guard);

        // Give the proxy a moment to bind its port
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_auth_header() {
        let auth = AuthMethod::Basic {
            username: "admin".to_string(),
            password: "secret".to_string(),
        };
        assert_eq!(
            auth.authorization_header().as_deref(),
            Some("Basic YWRtaW46c2VjcmV0")
        );
    }

    #[test]
    fn test_debug_hides_credentials() {
        let auth = AuthMethod::Token("abc123".to_string());
        assert!(!format!("{:?}", auth).contains("abc123"));
    }

    #[test]
    fn test_proxy_rewrites_base_url() {
        let auth = AuthMethod::Proxy(Arc::new(KubectlProxy::new(PROXY_PORT)));
        assert_eq!(
            auth.effective_base_url("https://cluster.example:6443"),
            "http://localhost:42010"
        );
        let token = AuthMethod::Token("t".to_string());
        assert_eq!(
            token.effective_base_url("https://cluster.example:6443/"),
            "https://cluster.example:6443"
        );
    }
}
