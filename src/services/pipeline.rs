use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::models::external_job::{ExternalStatus, StatusReport};

/// Status and output lookups against the external processing pipeline.
#[async_trait]
pub trait PipelineClient: Send + Sync {
    async fn get_status(&self, external_id: &str) -> Result<StatusReport, PipelineError>;

    /// The job's output archive (`output.tar.gz`).
    async fn download_output(&self, external_id: &str) -> Result<Vec<u8>, PipelineError>;
}

/// Body of `GET {base}/job/{id}/status`.
#[derive(Debug, Deserialize)]
struct JobStatusResponse {
    state: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    exit_status: Option<i32>,
}

impl JobStatusResponse {
    fn into_report(self) -> StatusReport {
        let mut status = ExternalStatus::from_pipeline_state(&self.state);
        // A process that finished "successfully" with a non-zero exit code did not.
        if status == ExternalStatus::Succeeded && self.exit_status.is_some_and(|code| code != 0) {
            status = ExternalStatus::Failed;
        }
        StatusReport {
            status,
            state: self.state,
            detail: self.status,
        }
    }
}

pub struct HttpPipelineClient {
    http: Client,
    base_url: String,
}

impl HttpPipelineClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, PipelineError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PipelineClient for HttpPipelineClient {
    async fn get_status(&self, external_id: &str) -> Result<StatusReport, PipelineError> {
        let url = format!("{}/job/{}/status", self.base_url, external_id);
        let response = self.http.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        let parsed: JobStatusResponse = serde_json::from_str(&body)?;
        Ok(parsed.into_report())
    }

    async fn download_output(&self, external_id: &str) -> Result<Vec<u8>, PipelineError> {
        let url = format!("{}/job/{}/output", self.base_url, external_id);
        let response = self.http.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.bytes().await?.to_vec())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Pipeline returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unreadable status body: {0}")]
    Parse(#[from] serde_json::Error),
}

impl PipelineError {
    /// Client errors other than timeouts and throttling will not go away on retry.
    pub fn is_permanent(&self) -> bool {
        matches!(self, PipelineError::Status { status, .. }
            if (400..500).contains(status) && *status != 408 && *status != 429)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> StatusReport {
        serde_json::from_str::<JobStatusResponse>(body)
            .unwrap()
            .into_report()
    }

    #[test]
    fn test_success_body() {
        let report = parse(
            r#"{"elapsed_time":"27.3","exit_status":0,"job_id":"j1","pid":"11539",
                "state":"SUCCESS","status":"Process terminated with success"}"#,
        );
        assert_eq!(report.status, ExternalStatus::Succeeded);
        assert_eq!(report.detail, "Process terminated with success");
    }

    #[test]
    fn test_nonzero_exit_is_failure() {
        let report = parse(r#"{"state":"SUCCESS","status":"done","exit_status":2}"#);
        assert_eq!(report.status, ExternalStatus::Failed);
    }

    #[test]
    fn test_permanent_statuses() {
        let status = |status| PipelineError::Status {
            status,
            body: String::new(),
        };
        assert!(status(404).is_permanent());
        assert!(!status(429).is_permanent());
        assert!(!status(503).is_permanent());
    }

    #[test]
    fn test_running_body() {
        let report = parse(r#"{"state":"STARTED","status":"Job is running"}"#);
        assert_eq!(report.status, ExternalStatus::Running);
    }
}
