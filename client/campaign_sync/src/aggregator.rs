//! Campaign aggregation: on-chain records merged with off-chain metadata.
//!
//! A pass is: one `getActiveCampaigns()` read, concurrent metadata fan-out
//! for the active records, then a merge in contract order. A failed read
//! fails the pass; a failed metadata fetch only costs that campaign its
//! title/description/image.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::campaigns::CampaignView;
use crate::errors::Result;
use crate::gateway::ContractGateway;
use crate::metadata::MetadataSource;

pub struct Aggregator {
    gateway: Arc<dyn ContractGateway>,
    resolver: Arc<dyn MetadataSource>,
}

impl Aggregator {
    pub fn new(gateway: Arc<dyn ContractGateway>, resolver: Arc<dyn MetadataSource>) -> Self {
        Self { gateway, resolver }
    }

    /// Run one aggregation pass.
    pub async fn collect(&self) -> Result<Vec<CampaignView>> {
        let records = self.gateway.list_active_campaigns().await?;
        let total = records.len();

        // Inactive records are dropped even if the contract already filters them.
        let active: Vec<_> = records.into_iter().filter(|r| r.is_active).collect();

        let resolutions = join_all(
            active
                .iter()
                .map(|record| self.resolver.resolve(&record.metadata_uri)),
        )
        .await;

        let views: Vec<CampaignView> = active
            .into_iter()
            .zip(resolutions)
            .map(|(record, resolution)| CampaignView::merge(record, resolution))
            .collect();

        let unresolved = views.iter().filter(|v| !v.metadata_resolved).count();
        info!(
            "Aggregated {} active of {} campaigns ({} with placeholder metadata)",
            views.len(),
            total,
            unresolved
        );
        Ok(views)
    }
}

/// Latest published listing.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ListingState {
    Loading,
    Ready {
        generation: u64,
        campaigns: Vec<CampaignView>,
    },
    /// The pass failed; `refresh` is the retry action.
    Failed { message: String, retryable: bool },
}

/// Publishes aggregation results, discarding those of superseded passes.
pub struct CampaignFeed {
    aggregator: Aggregator,
    generation: AtomicU64,
    state: watch::Sender<ListingState>,
}

impl CampaignFeed {
    pub fn new(aggregator: Aggregator) -> Self {
        let (state, _) = watch::channel(ListingState::Loading);
        Self {
            aggregator,
            generation: AtomicU64::new(0),
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ListingState> {
        self.state.subscribe()
    }

    pub fn current(&self) -> ListingState {
        self.state.borrow().clone()
    }

    /// Campaign `id` from the last published listing, if any.
    pub fn find(&self, id: u64) -> Option<CampaignView> {
        match &*self.state.borrow() {
            ListingState::Ready { campaigns, .. } => campaigns.iter().find(|c| c.id == id).cloned(),
            _ => None,
        }
    }

    /// Run a fresh pass and publish it unless a newer pass started meanwhile.
    ///
    /// The pass result is returned to the caller either way.
    pub async fn refresh(&self) -> Result<Vec<CampaignView>> {
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let result = self.aggregator.collect().await;

        if let Err(e) = &result {
            error!("Aggregation pass {ticket} failed: {e}");
        }

        // Checked under the channel lock, so an older pass can never
        // overwrite a newer one that published first.
        let published = self.state.send_if_modified(|state| {
            if self.generation.load(Ordering::SeqCst) != ticket {
                return false;
            }
            *state = match &result {
                Ok(campaigns) => ListingState::Ready {
                    generation: ticket,
                    campaigns: campaigns.clone(),
                },
                Err(e) => ListingState::Failed {
                    message: e.to_string(),
                    retryable: e.is_retryable(),
                },
            };
            true
        });
        if !published {
            debug!("Discarding superseded aggregation pass {ticket}");
        }
        result
    }

    /// Re-aggregate every `interval` until `shutdown` fires.
    pub async fn run_periodic(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        info!("Periodic refresh every {}s", interval.as_secs());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Periodic refresh stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {
                    // Failures are published to the feed.
                    let _ = self.refresh().await;
                }
            }
        }
    }
}
