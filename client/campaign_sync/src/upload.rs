//! Metadata store uploads.
//!
//! The upload endpoint accepts one raw blob (an image or a JSON document) and
//! answers `{"url": "..."}` pointing at the stored content. A response
//! without a usable url is an upload failure.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::Deserialize;
use tracing::info;

use crate::errors::{CampaignError, Result};

/// Content handed to the metadata store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub file_name: Option<String>,
}

impl Blob {
    pub fn json(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            content_type: "application/json".to_string(),
            file_name: Some("metadata.json".to_string()),
        }
    }
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Store `blob`; returns the URL it can be fetched from.
    async fn upload(&self, blob: Blob) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: Option<String>,
}

pub struct HttpUploadStore {
    client: Client,
    endpoint: Option<String>,
    token: Option<String>,
}

impl HttpUploadStore {
    pub fn new(client: Client, endpoint: Option<String>, token: Option<String>) -> Self {
        Self {
            client,
            endpoint,
            token,
        }
    }
}

#[async_trait]
impl MetadataStore for HttpUploadStore {
    async fn upload(&self, blob: Blob) -> Result<String> {
        let endpoint = self
            .endpoint
            .as_deref()
            .ok_or_else(|| CampaignError::Upload("no upload endpoint configured".to_string()))?;

        let size = blob.bytes.len();
        let mut request = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, blob.content_type.as_str())
            .body(blob.bytes);
        if let Some(name) = &blob.file_name {
            request = request.header("X-File-Name", name.as_str());
        }
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| CampaignError::Upload(format!("request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CampaignError::Upload(format!("upload endpoint answered {status}")));
        }

        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| CampaignError::Upload(format!("malformed response: {e}")))?;

        match body.url.filter(|url| !url.trim().is_empty()) {
            Some(url) => {
                info!("Uploaded {size} bytes ({}) to {url}", blob.content_type);
                Ok(url)
            }
            None => Err(CampaignError::Upload("response carried no url".to_string())),
        }
    }
}
