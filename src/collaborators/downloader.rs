use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::ConnectorConfig;
use crate::domain::DownloadStatus;
use crate::error::CollaboratorError;

use super::{AccountPage, Downloader, FetchOutcome};

/// Client for the remote download connector. The connector stages the
/// content itself; this side only learns the outcome and the owner.
#[derive(Clone)]
pub struct HttpDownloader {
    http: Client,
    config: ConnectorConfig,
}

#[derive(Serialize)]
struct FetchRequest<'a> {
    post_id: &'a str,
}

#[derive(Deserialize)]
struct FetchResponse {
    status: String,
    owner: Option<String>,
}

#[derive(Deserialize)]
struct ListResponse {
    items: Vec<String>,
    cursor: Option<String>,
}

impl HttpDownloader {
    pub fn new(http: Client, config: ConnectorConfig) -> Self {
        Self { http, config }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch(&self, post_id: &str) -> Result<FetchOutcome, CollaboratorError> {
        let endpoint = self.endpoint("posts/fetch");
        let mut request = self.http.post(&endpoint).json(&FetchRequest { post_id });
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        let response: FetchResponse = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let status: DownloadStatus =
            response
                .status
                .parse()
                .map_err(|_| CollaboratorError::UnexpectedResponse {
                    endpoint: endpoint.clone(),
                    detail: format!("unknown download status `{}`", response.status),
                })?;

        Ok(FetchOutcome {
            status,
            owner: response.owner,
        })
    }

    async fn list_account_items(
        &self,
        account: &str,
        cursor: Option<&str>,
    ) -> Result<AccountPage, CollaboratorError> {
        let endpoint = self.endpoint(&format!("accounts/{account}/items"));
        let mut request = self.http.get(&endpoint);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        let response: ListResponse = request
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(AccountPage {
            items: response.items,
            cursor: response.cursor,
        })
    }
}

/// Used when the download connector is disabled in configuration: every
/// fetch reports success so the rest of the pipeline stays exercisable.
pub struct StubDownloader;

#[async_trait]
impl Downloader for StubDownloader {
    async fn fetch(&self, post_id: &str) -> Result<FetchOutcome, CollaboratorError> {
        tracing::debug!(target: "downloader", post_id, "download connector disabled, reporting completed");
        Ok(FetchOutcome {
            status: DownloadStatus::Completed,
            owner: Some("undefined".to_string()),
        })
    }

    async fn list_account_items(
        &self,
        _account: &str,
        _cursor: Option<&str>,
    ) -> Result<AccountPage, CollaboratorError> {
        Ok(AccountPage {
            items: Vec::new(),
            cursor: None,
        })
    }
}
