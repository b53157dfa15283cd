use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::ConnectorConfig;
use crate::domain::UploadStatus;
use crate::error::CollaboratorError;

use super::Uploader;

/// Client for the remote upload connector, which moves staged content
/// into the destination storage under the given subdirectory.
#[derive(Clone)]
pub struct HttpUploader {
    http: Client,
    config: ConnectorConfig,
}

#[derive(Serialize)]
struct RelayRequest<'a> {
    subdirectory: &'a str,
}

#[derive(Deserialize)]
struct RelayResponse {
    status: String,
}

impl HttpUploader {
    pub fn new(http: Client, config: ConnectorConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn relay(&self, subdirectory: &str) -> Result<UploadStatus, CollaboratorError> {
        let endpoint = format!("{}/transfers", self.config.base_url.trim_end_matches('/'));
        let mut request = self.http.post(&endpoint).json(&RelayRequest { subdirectory });
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        let response: RelayResponse = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        response
            .status
            .parse()
            .map_err(|_| CollaboratorError::UnexpectedResponse {
                endpoint,
                detail: format!("unknown upload status `{}`", response.status),
            })
    }
}

/// Used when the upload connector is disabled in configuration.
pub struct StubUploader;

#[async_trait]
impl Uploader for StubUploader {
    async fn relay(&self, subdirectory: &str) -> Result<UploadStatus, CollaboratorError> {
        tracing::debug!(target: "uploader", subdirectory, "upload connector disabled, reporting completed");
        Ok(UploadStatus::Completed)
    }
}
