//! HTTP implementation of [`AccountingClient`]

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{AccountingClient, AccountingError, JobUpdate};
use crate::jobs::{Job, JobSpecification};

#[derive(Serialize)]
struct RegisterRequest<'a> {
    specification: &'a JobSpecification,
    user: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    project: Option<&'a str>,
}

#[derive(Deserialize)]
struct RegisterResponse {
    id: Option<String>,
}

#[derive(Deserialize)]
struct AllocationResponse {
    allowed: bool,
}

#[derive(Clone)]
pub struct HttpAccountingClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpAccountingClient {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, AccountingError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);
        let req = self.client.request(method, url);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, AccountingError> {
        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AccountingError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl AccountingClient for HttpAccountingClient {
    async fn register(
        &self,
        specification: &JobSpecification,
        user: &str,
        project: Option<&str>,
    ) -> Result<String, AccountingError> {
        let body = RegisterRequest {
            specification,
            user,
            project,
        };
        let response = self
            .send(self.request(Method::POST, "/jobs/register").json(&body))
            .await?;
        let registered: RegisterResponse = response.json().await?;
        registered.id.ok_or(AccountingError::MissingId)
    }

    async fn retrieve(&self, job_id: &str) -> Result<Job, AccountingError> {
        let req = self.request(Method::GET, &format!("/jobs/{job_id}"));
        match self.send(req).await {
            Ok(response) => Ok(response.json().await?),
            Err(AccountingError::Api { status: 404, .. }) => {
                Err(AccountingError::NotFound(job_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn update(&self, updates: Vec<JobUpdate>) -> Result<(), AccountingError> {
        if updates.is_empty() {
            return Ok(());
        }
        self.send(self.request(Method::POST, "/jobs/update").json(&updates))
            .await?;
        Ok(())
    }

    async fn check_allocation(&self, job: &Job) -> Result<bool, AccountingError> {
        let response = self
            .send(self.request(Method::POST, "/jobs/check-allocation").json(job))
            .await?;
        let allocation: AllocationResponse = response.json().await?;
        Ok(allocation.allowed)
    }

    async fn browse_active(&self) -> Result<Vec<Job>, AccountingError> {
        let response = self.send(self.request(Method::GET, "/jobs/active")).await?;
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        let client =
            HttpAccountingClient::new("http://accounting:8080/", None, Duration::from_secs(5))
                .unwrap();
        assert_eq!(client.base_url(), "http://accounting:8080");
    }

    #[test]
    fn test_register_request_omits_missing_project() {
        let spec: JobSpecification = serde_json::from_value(serde_json::json!({
            "resources": {"cpu_millis": 1000, "memory_bytes": 0, "gpus": 0},
            "product_category": "cpu",
            "image": "alpine"
        }))
        .unwrap();
        let body = RegisterRequest {
            specification: &spec,
            user: "alice",
            project: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["user"], "alice");
        assert!(json.get("project").is_none());
    }
}
