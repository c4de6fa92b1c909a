//! Off-chain metadata resolution.
//!
//! A metadata blob that cannot be fetched or parsed never fails the listing:
//! [`MetadataSource::resolve`] answers [`Resolution::Unresolved`] and the
//! aggregator renders placeholders for that one campaign.

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use crate::campaigns::CampaignMetadata;

const IPFS_SCHEME: &str = "ipfs://";
const LEGACY_IPFS_SCHEME: &str = "ipfs://ipfs/";

/// Outcome of resolving one metadata URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(CampaignMetadata),
    /// Fetch or parse failed; carries the reason for logging.
    Unresolved(String),
}

impl Resolution {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    /// Metadata to render; empty for unresolved blobs.
    pub fn into_metadata(self) -> CampaignMetadata {
        match self {
            Self::Resolved(metadata) => metadata,
            Self::Unresolved(_) => CampaignMetadata::default(),
        }
    }
}

#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Fetch and parse the metadata at `uri`. Never fails.
    async fn resolve(&self, uri: &str) -> Resolution;
}

/// Rewrite content-addressed `ipfs://` links onto an HTTP gateway.
pub fn normalize_uri(uri: &str, gateway: &str) -> String {
    let trimmed = uri.trim();
    if let Some(path) = trimmed.strip_prefix(LEGACY_IPFS_SCHEME) {
        format!("{gateway}{path}")
    } else if let Some(path) = trimmed.strip_prefix(IPFS_SCHEME) {
        format!("{gateway}{path}")
    } else {
        trimmed.to_string()
    }
}

/// Resolver that fetches metadata JSON over plain HTTP GET.
#[derive(Clone)]
pub struct HttpResolver {
    client: Client,
    gateway: String,
}

impl HttpResolver {
    pub fn new(client: Client, gateway: impl Into<String>) -> Self {
        Self {
            client,
            gateway: gateway.into(),
        }
    }

    async fn fetch(&self, url: &str) -> Result<CampaignMetadata, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {status}"));
        }

        let mut metadata: CampaignMetadata = response
            .json()
            .await
            .map_err(|e| format!("malformed JSON: {e}"))?;
        metadata.image = metadata
            .image
            .map(|image| normalize_uri(&image, &self.gateway));
        Ok(metadata)
    }
}

#[async_trait]
impl MetadataSource for HttpResolver {
    async fn resolve(&self, uri: &str) -> Resolution {
        let url = normalize_uri(uri, &self.gateway);
        if url.is_empty() {
            return Resolution::Unresolved("empty metadata URI".to_string());
        }

        match self.fetch(&url).await {
            Ok(metadata) => {
                debug!("Resolved metadata from {url}");
                Resolution::Resolved(metadata)
            }
            Err(reason) => {
                warn!("Metadata unresolved for {url}: {reason}");
                Resolution::Unresolved(reason)
            }
        }
    }
}
