//! HTTP client for a submission gateway.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::config::SubmitterConfig;
use crate::error::{ControlError, ControlResult};

use super::{StopRequest, SubmitRequest, SubmitResponse, Submitter};

#[derive(Deserialize)]
struct StopResponse {
    savepoint: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// [`Submitter`] that forwards requests to a gateway over HTTP.
#[derive(Debug, Clone)]
pub struct GatewaySubmitter {
    client: Client,
    base_url: String,
}

impl GatewaySubmitter {
    /// Create a new gateway client from configuration.
    pub fn new(config: &SubmitterConfig) -> ControlResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(ControlError::Http)?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_owned(),
        })
    }

    async fn failure(action: &str, response: reqwest::Response) -> ControlError {
        let status = response.status();
        let detail = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        ControlError::submission(format!("{action} failed ({status}): {detail}"))
    }
}

#[async_trait]
impl Submitter for GatewaySubmitter {
    async fn submit(&self, request: &SubmitRequest) -> ControlResult<SubmitResponse> {
        let url = format!("{}/submit", self.base_url);
        debug!(job_name = %request.job_name, url = %url, "submitting job");
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(ControlError::Http)?;

        if !response.status().is_success() {
            return Err(Self::failure("submit", response).await);
        }
        response.json().await.map_err(ControlError::Http)
    }

    async fn stop(&self, request: &StopRequest) -> ControlResult<Option<String>> {
        let url = format!("{}/stop", self.base_url);
        debug!(cluster_app_id = %request.cluster_app_id, url = %url, "stopping job");
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(ControlError::Http)?;

        if !response.status().is_success() {
            return Err(Self::failure("stop", response).await);
        }
        let body: StopResponse = response.json().await.map_err(ControlError::Http)?;
        Ok(body.savepoint)
    }

    async fn job_name_in_use(&self, job_name: &str) -> ControlResult<bool> {
        let url = format!("{}/jobs/{job_name}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(ControlError::Http)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Err(Self::failure("job lookup", response).await),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalised() {
        let submitter = GatewaySubmitter::new(&SubmitterConfig {
            url: "http://gateway:8091/".to_owned(),
            timeout_secs: 5,
        })
        .unwrap();
        assert_eq!(submitter.base_url, "http://gateway:8091");
    }

    #[test]
    fn stop_response_without_savepoint() {
        let body: StopResponse = serde_json::from_str("{}").unwrap();
        assert!(body.savepoint.is_none());
        let body: StopResponse = serde_json::from_str(r#"{"savepoint":"s3://sp/1"}"#).unwrap();
        assert_eq!(body.savepoint.as_deref(), Some("s3://sp/1"));
    }
}
