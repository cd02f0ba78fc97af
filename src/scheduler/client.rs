use serde::Deserialize;

use crate::config::RemoteConfig;
use crate::error::{DispatchError, Result};
use crate::scheduler::service::API_KEY_HEADER;
use crate::scheduler::Job;

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// HTTP client for the scheduler service's three endpoints.
///
/// Every request carries the API key and is bounded by the configured
/// timeout; a non-2xx reply becomes [`DispatchError::Rejected`].
#[derive(Debug, Clone)]
pub struct SchedulerClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl SchedulerClient {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| DispatchError::transport(None, e))?;
        Ok(Self {
            http,
            base_url: config.connect_uri.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(&self, route: &str, job: Option<&Job>) -> Result<reqwest::Response> {
        let job_name = job.map(|j| j.name.as_str());
        let mut request = self
            .http
            .post(format!("{}/{}", self.base_url, route))
            .header(API_KEY_HEADER, &self.api_key);
        if let Some(job) = job {
            request = request.json(job);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DispatchError::transport(job_name, e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or(body);
        Err(DispatchError::Rejected {
            job: job_name.map(str::to_string),
            status: status.as_u16(),
            message,
        })
    }

    /// Push a job onto the service's queue.
    pub async fn add_job(&self, job: &Job) -> Result<()> {
        self.post("add_job", Some(job)).await?;
        Ok(())
    }

    /// Take the next job, waiting server-side until one is available.
    pub async fn get_job(&self) -> Result<Job> {
        let response = self.post("get_job", None).await?;
        response
            .json::<Job>()
            .await
            .map_err(|e| DispatchError::transport(None, e))
    }

    /// Tell the service to stop blocking pollers once its queue is empty.
    pub async fn stop_server(&self) -> Result<()> {
        self.post("stop_server", None).await?;
        Ok(())
    }
}
