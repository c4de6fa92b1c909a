//! Campaign sync: entry point.
//!
//! Aggregates the contract's campaigns with their off-chain metadata in the
//! background and exposes listing plus donate/update/delete actions over a
//! small Axum REST API.

use std::sync::Arc;

use ethers::providers::Provider;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use campaign_sync::aggregator::{Aggregator, CampaignFeed};
use campaign_sync::api::{self, ApiState};
use campaign_sync::config::Config;
use campaign_sync::gateway::EvmGateway;
use campaign_sync::metadata::HttpResolver;
use campaign_sync::orchestrator::MutationOrchestrator;
use campaign_sync::rpc::RpcClient;
use campaign_sync::upload::HttpUploadStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // One HTTP client for RPC, metadata and uploads.
    let mut builder = Client::builder();
    if let Some(timeout) = config.http_timeout {
        builder = builder.timeout(timeout);
    }
    let client = builder.build()?;

    // ─── Chain and metadata plumbing ──────────────────────
    let transport = RpcClient::new(client.clone(), config.rpc_url.clone(), config.rpc_max_retries);
    let provider = Provider::new(transport).interval(config.confirmation_poll);
    let gateway = Arc::new(EvmGateway::new(
        provider,
        config.contract_address,
        config.signer_address,
    ));
    let resolver = Arc::new(HttpResolver::new(client.clone(), config.ipfs_gateway.clone()));
    let store = Arc::new(HttpUploadStore::new(
        client,
        config.upload_url.clone(),
        config.upload_token.clone(),
    ));
    if config.upload_url.is_none() {
        warn!("UPLOAD_URL not set; campaign updates will fail at the upload step");
    }

    let feed = Arc::new(CampaignFeed::new(Aggregator::new(gateway.clone(), resolver)));
    let orchestrator = Arc::new(MutationOrchestrator::new(gateway, store, feed.clone()));

    // ─── Background aggregation ───────────────────────────
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let feed = feed.clone();
        async move {
            // Failures are published to the feed.
            let _ = feed.refresh().await;
        }
    });
    if let Some(interval) = config.refresh_interval {
        tokio::spawn(feed.clone().run_periodic(interval, shutdown.clone()));
    }

    // ─── REST API ─────────────────────────────────────────
    let api_state = Arc::new(ApiState { feed, orchestrator });
    let app = api::router(api_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!(
        "API listening on http://{addr} (contract {:?}, rpc {})",
        config.contract_address, config.rpc_url
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}
