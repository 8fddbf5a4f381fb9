//! Generic client for the cluster resource API
//!
//! CRUD, patch, watch and raw sub-resource access against any resource
//! addressed by a [`ResourceLocator`]. Connection failures are retried a
//! bounded number of times; every non-2xx response becomes
//! [`ClientError::Status`].

use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method, Response, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use super::connection::Connection;
use super::locator::ResourceLocator;
use super::objects::{ObjectList, WatchEvent};

/// Errors talking to the cluster API
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Cluster API returned {status} for {method} {path}: {body}")]
    Status {
        status: u16,
        method: String,
        path: String,
        body: String,
    },

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchType {
    Merge,
    Json,
    Strategic,
}

impl PatchType {
    pub fn content_type(&self) -> &'static str {
        match self {
            PatchType::Merge => "application/merge-patch+json",
            PatchType::Json => "application/json-patch+json",
            PatchType::Strategic => "application/strategic-merge-patch+json",
        }
    }
}

/// One RFC 6902 operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonPatchOp {
    pub op: &'static str,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl JsonPatchOp {
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: "add",
            path: path.into(),
            value: Some(value),
        }
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: "replace",
            path: path.into(),
            value: Some(value),
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            op: "remove",
            path: path.into(),
            value: None,
        }
    }
}

/// Escape a map key for use inside a JSON pointer
pub fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Timeout of ordinary (non-streaming) requests
    pub request_timeout: Duration,
    /// Attempts per request when the connection itself fails
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_attempts: 5,
            retry_delay: Duration::from_secs(1),
        }
    }
}

type Query<'a> = &'a [(&'a str, &'a str)];

pub struct ResourceClient {
    connection: Connection,
    http: Client,
    streaming: Client,
    config: ClientConfig,
}

impl ResourceClient {
    pub fn new(connection: Connection) -> Result<Self, ClientError> {
        Self::with_config(connection, ClientConfig::default())
    }

    pub fn with_config(connection: Connection, config: ClientConfig) -> Result<Self, ClientError> {
        let http = Self::build_http(&connection, Some(config.request_timeout))?;
        let streaming = Self::build_http(&connection, None)?;
        Ok(Self {
            connection,
            http,
            streaming,
            config,
        })
    }

    fn build_http(connection: &Connection, timeout: Option<Duration>) -> Result<Client, ClientError> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(connection.insecure);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(pem) = &connection.ca_cert_pem {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem)?);
        }
        Ok(builder.build()?)
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Namespace configured by the connection source, if any
    pub fn default_namespace(&self) -> Option<&str> {
        self.connection.namespace.as_deref()
    }

    pub fn url(
        &self,
        locator: &ResourceLocator,
        operation: Option<&str>,
        query: Query<'_>,
    ) -> Result<Url, ClientError> {
        let base = self.connection.auth.effective_base_url(&self.connection.master_url);
        let mut url = Url::parse(&format!("{}{}", base, locator.path(operation)))
            .map_err(|e| ClientError::Config(format!("invalid URL: {e}")))?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query.iter());
        }
        Ok(url)
    }

    /// Websocket URL for a sub-resource (exec)
    pub fn websocket_url(
        &self,
        locator: &ResourceLocator,
        operation: Option<&str>,
        query: Query<'_>,
    ) -> Result<String, ClientError> {
        let url = self.url(locator, operation, query)?.to_string();
        Ok(if let Some(rest) = url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            url
        })
    }

    async fn execute(
        &self,
        method: Method,
        locator: &ResourceLocator,
        operation: Option<&str>,
        query: Query<'_>,
        body: Option<(Vec<u8>, &'static str)>,
        streaming: bool,
    ) -> Result<Response, ClientError> {
        let url = self.url(locator, operation, query)?;
        let client = if streaming { &self.streaming } else { &self.http };

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.connection.auth.prepare().await?;

            let mut request = client
                .request(method.clone(), url.clone())
                .header(ACCEPT, "application/json");
            request = self.connection.auth.apply(request);
            if let Some((bytes, content_type)) = &body {
                request = request.header(CONTENT_TYPE, *content_type).body(bytes.clone());
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    debug!("{} {} failed with {}: {}", method, url.path(), status, body);
                    return Err(ClientError::Status {
                        status,
                        method: method.to_string(),
                        path: url.path().to_string(),
                        body,
                    });
                }
                Err(e) if e.is_connect() && attempt < self.config.max_attempts => {
                    warn!(
                        "Connection to cluster API failed (attempt {}/{}): {}",
                        attempt, self.config.max_attempts, e
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, locator: &ResourceLocator) -> Result<T, ClientError> {
        let response = self.execute(Method::GET, locator, None, &[], None, false).await?;
        Ok(response.json().await?)
    }

    /// Like [`get`](Self::get) but a missing object is `None`
    pub async fn get_optional<T: DeserializeOwned>(
        &self,
        locator: &ResourceLocator,
    ) -> Result<Option<T>, ClientError> {
        match self.get(locator).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn list<T: DeserializeOwned>(
        &self,
        locator: &ResourceLocator,
        query: Query<'_>,
    ) -> Result<ObjectList<T>, ClientError> {
        let response = self.execute(Method::GET, locator, None, query, None, false).await?;
        Ok(response.json().await?)
    }

    /// List every page, following continue tokens
    pub async fn list_all<T: DeserializeOwned>(
        &self,
        locator: &ResourceLocator,
        query: Query<'_>,
    ) -> Result<Vec<T>, ClientError> {
        let mut items = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut params: Vec<(&str, &str)> = query.to_vec();
            if let Some(t) = token.as_deref() {
                params.push(("continue", t));
            }
            let page: ObjectList<T> = self.list(locator, &params).await?;
            items.extend(page.items);
            match page.metadata.continue_token {
                Some(next) if !next.is_empty() => token = Some(next),
                _ => return Ok(items),
            }
        }
    }

    pub async fn create<B: Serialize, T: DeserializeOwned>(
        &self,
        locator: &ResourceLocator,
        body: &B,
    ) -> Result<T, ClientError> {
        let bytes = serde_json::to_vec(body)?;
        let response = self
            .execute(Method::POST, locator, None, &[], Some((bytes, "application/json")), false)
            .await?;
        Ok(response.json().await?)
    }

    pub async fn replace<B: Serialize, T: DeserializeOwned>(
        &self,
        locator: &ResourceLocator,
        body: &B,
    ) -> Result<T, ClientError> {
        let bytes = serde_json::to_vec(body)?;
        let response = self
            .execute(Method::PUT, locator, None, &[], Some((bytes, "application/json")), false)
            .await?;
        Ok(response.json().await?)
    }

    pub async fn patch<T: DeserializeOwned>(
        &self,
        locator: &ResourceLocator,
        patch: &Value,
        patch_type: PatchType,
    ) -> Result<T, ClientError> {
        let bytes = serde_json::to_vec(patch)?;
        let response = self
            .execute(
                Method::PATCH,
                locator,
                None,
                &[],
                Some((bytes, patch_type.content_type())),
                false,
            )
            .await?;
        Ok(response.json().await?)
    }

    pub async fn json_patch(
        &self,
        locator: &ResourceLocator,
        ops: &[JsonPatchOp],
    ) -> Result<Value, ClientError> {
        self.patch(locator, &serde_json::to_value(ops)?, PatchType::Json).await
    }

    pub async fn delete(&self, locator: &ResourceLocator) -> Result<(), ClientError> {
        self.delete_with_query(locator, &[]).await
    }

    pub async fn delete_with_query(
        &self,
        locator: &ResourceLocator,
        query: Query<'_>,
    ) -> Result<(), ClientError> {
        self.execute(Method::DELETE, locator, None, query, None, false)
            .await?;
        Ok(())
    }

    /// Delete an object; returns false if it did not exist
    pub async fn delete_if_exists(&self, locator: &ResourceLocator) -> Result<bool, ClientError> {
        match self.delete(locator).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Raw text of a sub-resource (e.g. a log download)
    pub async fn get_text(
        &self,
        locator: &ResourceLocator,
        operation: Option<&str>,
        query: Query<'_>,
    ) -> Result<String, ClientError> {
        let response = self
            .execute(Method::GET, locator, operation, query, None, false)
            .await?;
        Ok(response.text().await?)
    }

    /// Lines of a long-running streamed response. Ends at EOF or at the
    /// first read error.
    pub async fn stream_lines(
        &self,
        locator: &ResourceLocator,
        operation: Option<&str>,
        query: Query<'_>,
    ) -> Result<BoxStream<'static, std::io::Result<String>>, ClientError> {
        let response = self
            .execute(Method::GET, locator, operation, query, None, true)
            .await?;
        let bytes = response.bytes_stream().map_err(std::io::Error::other);
        let lines = BufReader::new(StreamReader::new(bytes)).lines();

        Ok(stream::unfold(Some(lines), |state| async move {
            let mut lines = state?;
            match lines.next_line().await {
                Ok(Some(line)) => Some((Ok(line), Some(lines))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed())
    }

    /// Watch a collection. Each line of the response is one event.
    pub async fn watch<T: DeserializeOwned + Send + 'static>(
        &self,
        locator: &ResourceLocator,
        query: Query<'_>,
    ) -> Result<BoxStream<'static, Result<WatchEvent<T>, ClientError>>, ClientError> {
        let mut params: Vec<(&str, &str)> = query.to_vec();
        params.push(("watch", "true"));
        let lines = self.stream_lines(locator, None, &params).await?;

        Ok(lines
            .try_filter(|line| futures::future::ready(!line.trim().is_empty()))
            .map(|line| match line {
                Ok(line) => serde_json::from_str::<WatchEvent<T>>(&line).map_err(ClientError::from),
                Err(e) => Err(ClientError::from(e)),
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::auth::AuthMethod;
    use crate::k8s::locator::resources;

    fn client() -> ResourceClient {
        ResourceClient::new(Connection::new(
            "https://cluster.example:6443",
            AuthMethod::Anonymous,
        ))
        .unwrap()
    }

    #[test]
    fn test_url_with_query() {
        let url = client()
            .url(
                &resources::pods().with_namespace("apps"),
                None,
                &[("labelSelector", "volcano.sh/job-name=j-1")],
            )
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://cluster.example:6443/api/v1/namespaces/apps/pods?labelSelector=volcano.sh%2Fjob-name%3Dj-1"
        );
    }

    #[test]
    fn test_websocket_url() {
        let url = client()
            .websocket_url(
                &resources::pods().with_name_and_namespace("p", "apps"),
                Some("exec"),
                &[("tty", "true")],
            )
            .unwrap();
        assert_eq!(
            url,
            "wss://cluster.example:6443/api/v1/namespaces/apps/pods/p/exec?tty=true"
        );
    }

    #[test]
    fn test_escape_pointer() {
        assert_eq!(escape_pointer("jobs.cluster/expiry"), "jobs.cluster~1expiry");
        assert_eq!(escape_pointer("a~b"), "a~0b");
    }

    #[test]
    fn test_status_error_classification() {
        let err = ClientError::Status {
            status: 409,
            method: "POST".into(),
            path: "/api/v1/pods".into(),
            body: String::new(),
        };
        assert!(err.is_conflict());
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_json_patch_serialization() {
        let ops = vec![
            JsonPatchOp::add("/spec/ingress/-", serde_json::json!({"from": []})),
            JsonPatchOp::remove("/metadata/annotations/x"),
        ];
        let value = serde_json::to_value(&ops).unwrap();
        assert_eq!(value[0]["op"], "add");
        assert!(value[1].get("value").is_none());
    }
}
