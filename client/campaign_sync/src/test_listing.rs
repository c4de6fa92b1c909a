//! Listing scenarios: aggregation passes over the scripted chain.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ethers::providers::Provider;
use ethers::types::U256;
use reqwest::Client;
use tokio::sync::{oneshot, Mutex, Notify};

use crate::aggregator::{Aggregator, CampaignFeed, ListingState};
use crate::campaigns::{CampaignPhase, CampaignRecord, PLACEHOLDER_DESCRIPTION, PLACEHOLDER_TITLE};
use crate::errors::{CampaignError, Result};
use crate::gateway::{ContractGateway, EvmGateway, TxHash};
use crate::rpc::RpcClient;
use crate::test_support::{campaign, days_from_now, ether, harness, StubResolver, CONTRACT};

#[tokio::test]
async fn inactive_campaigns_are_never_listed() {
    let mut deleted = campaign(1, ether(5), U256::zero(), days_from_now(10));
    deleted.is_active = false;
    let h = harness(vec![
        campaign(0, ether(10), ether(2), days_from_now(10)),
        deleted,
        campaign(2, ether(3), ether(1), days_from_now(10)),
    ]);

    let views = h.feed.refresh().await.unwrap();
    let ids: Vec<u64> = views.iter().map(|v| v.id).collect();
    assert_eq!(ids, vec![0, 2]);
}

#[tokio::test]
async fn unreachable_metadata_falls_back_to_placeholders() {
    let h = harness(vec![
        campaign(0, ether(10), ether(2), days_from_now(10)),
        campaign(1, ether(4), U256::zero(), days_from_now(10)),
    ]);
    h.resolver
        .insert("ipfs://meta-0", "Clean water", "https://img.example/water.png");

    let views = h.feed.refresh().await.unwrap();
    assert_eq!(views.len(), 2);

    assert_eq!(views[0].title, "Clean water");
    assert!(views[0].metadata_resolved);

    assert_eq!(views[1].title, PLACEHOLDER_TITLE);
    assert_eq!(views[1].description, PLACEHOLDER_DESCRIPTION);
    assert_eq!(views[1].image, "");
    assert!(!views[1].metadata_resolved);
    assert_eq!(views[1].target, "4.0");
}

#[tokio::test]
async fn failed_read_publishes_retryable_failure() {
    let h = harness(vec![campaign(0, ether(10), ether(2), days_from_now(10))]);
    h.chain.fail_reads(true);

    let err = h.feed.refresh().await.unwrap_err();
    assert!(matches!(err, CampaignError::ChainRead(_)));
    match h.feed.current() {
        ListingState::Failed { retryable, .. } => assert!(retryable),
        other => panic!("expected failed listing, got {other:?}"),
    }

    h.chain.fail_reads(false);
    h.feed.refresh().await.unwrap();
    assert!(matches!(h.feed.current(), ListingState::Ready { .. }));
}

#[tokio::test]
async fn missing_provider_is_a_connection_error() {
    // Reserve a port, then free it so nothing is listening there.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = RpcClient::new(Client::new(), format!("http://{addr}"), 0);
    let gateway = EvmGateway::new(Provider::new(transport), CONTRACT.parse().unwrap(), None);

    let err = gateway.list_active_campaigns().await.unwrap_err();
    assert!(matches!(err, CampaignError::Connection(_)), "{err}");
}

#[tokio::test]
async fn past_deadline_campaign_is_shown_but_not_donatable() {
    let h = harness(vec![campaign(0, ether(10), ether(2), days_from_now(-1))]);

    let views = h.feed.refresh().await.unwrap();
    let view = &views[0];
    let now = Utc::now();
    assert_eq!(view.phase(now), CampaignPhase::DeadlinePassed);
    assert_eq!(view.phase(now).label(), "Campaign deadline passed, awaiting claim");
    assert!(!view.accepts_donations(now));
}

#[tokio::test]
async fn subscribers_see_published_listing() {
    let h = harness(vec![campaign(0, ether(10), ether(2), days_from_now(10))]);
    let mut rx = h.feed.subscribe();
    assert!(matches!(*rx.borrow(), ListingState::Loading));

    h.feed.refresh().await.unwrap();
    rx.changed().await.unwrap();
    match &*rx.borrow() {
        ListingState::Ready {
            generation,
            campaigns,
        } => {
            assert_eq!(*generation, 1);
            assert_eq!(campaigns[0].amount_collected, "2.0");
        }
        other => panic!("expected ready listing, got {other:?}"),
    };
}

/// Gateway whose first read blocks until released.
struct GatedGateway {
    first: Mutex<Option<oneshot::Receiver<()>>>,
    entered: Notify,
}

#[async_trait]
impl ContractGateway for GatedGateway {
    async fn list_active_campaigns(&self) -> Result<Vec<CampaignRecord>> {
        let gate = self.first.lock().await.take();
        match gate {
            Some(gate) => {
                self.entered.notify_one();
                let _ = gate.await;
                Ok(vec![campaign(0, ether(10), ether(1), days_from_now(10))])
            }
            None => Ok(vec![campaign(0, ether(10), ether(7), days_from_now(10))]),
        }
    }

    async fn donate(&self, _: u64, _: U256) -> Result<TxHash> {
        unreachable!()
    }

    async fn update_campaign(&self, _: u64, _: &str, _: U256, _: u64) -> Result<TxHash> {
        unreachable!()
    }

    async fn delete_campaign(&self, _: u64) -> Result<TxHash> {
        unreachable!()
    }
}

#[tokio::test]
async fn superseded_pass_is_not_published() {
    let (release, gate) = oneshot::channel();
    let gateway = Arc::new(GatedGateway {
        first: Mutex::new(Some(gate)),
        entered: Notify::new(),
    });
    let feed = Arc::new(CampaignFeed::new(Aggregator::new(
        gateway.clone(),
        Arc::new(StubResolver::default()),
    )));

    let slow = tokio::spawn({
        let feed = feed.clone();
        async move { feed.refresh().await }
    });
    gateway.entered.notified().await;

    // A newer pass completes while the first is still outstanding.
    let fresh = feed.refresh().await.unwrap();
    assert_eq!(fresh[0].amount_collected, "7.0");
    let mut rx = feed.subscribe();
    rx.borrow_and_update();

    release.send(()).unwrap();
    let stale = tokio::time::timeout(Duration::from_secs(5), slow)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stale[0].amount_collected, "1.0");
    assert!(!rx.has_changed().unwrap(), "stale pass notified subscribers");

    match feed.current() {
        ListingState::Ready {
            generation,
            campaigns,
        } => {
            assert_eq!(generation, 2);
            assert_eq!(campaigns[0].amount_collected, "7.0");
        }
        other => panic!("expected ready listing, got {other:?}"),
    }
}
