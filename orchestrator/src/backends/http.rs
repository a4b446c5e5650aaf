//! HTTP execution backend
//!
//! Talks to a remote job runner:
//!
//! - `POST {base}/jobs` submits a job; `409 Conflict` means the name is taken
//! - `GET {base}/jobs/{name}` reports its phase; `404` means never submitted

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, error};
use url::Url;

use super::{BackendError, ExecutionBackend, ExecutionJob, JobHandle, JobStatus};

/// Execution backend backed by a job-runner REST endpoint
pub struct HttpExecutionBackend {
    client: Client,
    base_url: Url,
    token: Option<String>,
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        BackendError::Unavailable(err.to_string())
    }
}

impl HttpExecutionBackend {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = Client::builder().timeout(timeout).build()?;

        // A trailing slash keeps `join` from dropping the last path segment
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalized)
            .map_err(|e| BackendError::Rejected(format!("invalid job runner url {base_url}: {e}")))?;

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url, BackendError> {
        self.base_url
            .join(path)
            .map_err(|e| BackendError::Rejected(format!("invalid job path {path}: {e}")))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    async fn failure(method: &str, response: Response) -> BackendError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!("HTTP {} failed: {} - {}", method, status, body);
        if status.is_client_error() {
            BackendError::Rejected(format!("{}: {}", status, body))
        } else {
            BackendError::Unavailable(format!("{}: {}", status, body))
        }
    }
}

#[async_trait]
impl ExecutionBackend for HttpExecutionBackend {
    async fn submit(&self, job: &ExecutionJob) -> Result<JobHandle, BackendError> {
        let url = self.url("jobs")?;
        debug!("POST {} ({})", url, job.name);

        let response = self
            .authorize(self.client.post(url))
            .json(job)
            .send()
            .await?;

        match response.status() {
            StatusCode::CONFLICT => Ok(JobHandle {
                name: job.name.clone(),
                created: false,
            }),
            status if status.is_success() => Ok(JobHandle {
                name: job.name.clone(),
                created: true,
            }),
            _ => Err(Self::failure("POST", response).await),
        }
    }

    async fn status(&self, name: &str) -> Result<Option<JobStatus>, BackendError> {
        let url = self.url(&format!("jobs/{}", name))?;
        debug!("GET {}", url);

        let response = self.authorize(self.client.get(url)).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            _ => Err(Self::failure("GET", response).await),
        }
    }
}
