//! Axum REST API handlers.
//!
//! Every mutating request is handed to its own task, so a client that hangs
//! up mid-request never abandons a submitted transaction: the orchestration
//! still runs to confirmation and the slot still returns to idle.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use crate::aggregator::{CampaignFeed, ListingState};
use crate::campaigns::{CampaignPhase, CampaignView};
use crate::errors::{CampaignError, Result};
use crate::orchestrator::{
    ActionKind, ActionOutcome, ImageUpload, MutationOrchestrator, SlotSnapshot, UpdateForm,
};

#[derive(Clone)]
pub struct ApiState {
    pub feed: Arc<CampaignFeed>,
    pub orchestrator: Arc<MutationOrchestrator>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/campaigns", get(list_campaigns))
        .route("/campaigns/refresh", post(refresh_campaigns))
        .route("/campaigns/:id", put(update_campaign).delete(delete_campaign))
        .route("/campaigns/:id/donate", post(donate))
        .route("/campaigns/:id/actions", get(campaign_actions))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub retryable: bool,
}

/// A campaign as rendered on a card.
#[derive(Serialize)]
pub struct CampaignCard {
    #[serde(flatten)]
    pub campaign: CampaignView,
    pub owner_short: String,
    pub phase: CampaignPhase,
    pub phase_label: &'static str,
    pub progress_percent: f64,
    pub progress_bar_percent: f64,
    pub can_donate: bool,
}

impl CampaignCard {
    fn new(campaign: CampaignView) -> Self {
        let now = Utc::now();
        let phase = campaign.phase(now);
        Self {
            owner_short: campaign.owner_short(),
            phase,
            phase_label: phase.label(),
            progress_percent: campaign.progress_percent(),
            progress_bar_percent: campaign.progress_bar_percent(),
            can_donate: campaign.accepts_donations(now),
            campaign,
        }
    }
}

#[derive(Serialize)]
pub struct CampaignsResponse {
    pub generation: u64,
    pub count: usize,
    pub campaigns: Vec<CampaignCard>,
}

impl CampaignsResponse {
    fn new(generation: u64, campaigns: Vec<CampaignView>) -> Self {
        Self {
            generation,
            count: campaigns.len(),
            campaigns: campaigns.into_iter().map(CampaignCard::new).collect(),
        }
    }
}

#[derive(Serialize)]
pub struct ActionResponse {
    pub campaign_id: u64,
    pub action: &'static str,
    pub tx_hash: String,
}

#[derive(Serialize)]
pub struct ActionsResponse {
    pub campaign_id: u64,
    pub slots: BTreeMap<&'static str, SlotSnapshot>,
}

#[derive(Debug, Deserialize)]
pub struct DonateRequest {
    pub amount: String,
}

/// Fields left out keep the campaign's current values.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub target: Option<String>,
    pub deadline: Option<String>,
    pub image: Option<String>,
    pub image_upload: Option<UploadPayload>,
}

#[derive(Debug, Deserialize)]
pub struct UploadPayload {
    pub file_name: String,
    pub content_type: String,
    /// Base64-encoded file contents.
    pub data: String,
}

impl UpdateRequest {
    fn into_form(self, current: Option<&CampaignView>) -> Result<UpdateForm> {
        let mut form = current.map(UpdateForm::from_view).unwrap_or_default();
        if let Some(title) = self.title {
            form.title = title;
        }
        if let Some(description) = self.description {
            form.description = description;
        }
        if let Some(target) = self.target {
            form.target = target;
        }
        if let Some(deadline) = self.deadline {
            form.deadline = deadline;
        }
        if let Some(image) = self.image {
            form.image = image;
        }
        if let Some(upload) = self.image_upload {
            let bytes = STANDARD
                .decode(upload.data.as_bytes())
                .map_err(|e| CampaignError::Validation(format!("image_upload.data: {e}")))?;
            form.image_upload = Some(ImageUpload {
                file_name: upload.file_name,
                content_type: upload.content_type,
                bytes,
            });
        }
        Ok(form)
    }
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /campaigns`
///
/// Returns the last published listing. `202` while the first pass is still
/// running; a failed pass answers with its error and whether to retry.
pub async fn list_campaigns(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.feed.current() {
        ListingState::Loading => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "loading" })),
        )
            .into_response(),
        ListingState::Ready {
            generation,
            campaigns,
        } => (
            StatusCode::OK,
            Json(CampaignsResponse::new(generation, campaigns)),
        )
            .into_response(),
        ListingState::Failed { message, retryable } => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: message,
                retryable,
            }),
        )
            .into_response(),
    }
}

/// `POST /campaigns/refresh`
///
/// Runs a fresh aggregation pass and returns its result.
pub async fn refresh_campaigns(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    match state.feed.refresh().await {
        Ok(campaigns) => {
            let generation = match state.feed.current() {
                ListingState::Ready { generation, .. } => generation,
                _ => 0,
            };
            (
                StatusCode::OK,
                Json(CampaignsResponse::new(generation, campaigns)),
            )
                .into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// `POST /campaigns/:id/donate`
pub async fn donate(
    State(state): State<Arc<ApiState>>,
    Path(campaign_id): Path<u64>,
    Json(body): Json<DonateRequest>,
) -> impl IntoResponse {
    let orchestrator = state.orchestrator.clone();
    let task =
        tokio::spawn(async move { orchestrator.donate(campaign_id, &body.amount).await });
    action_response(campaign_id, ActionKind::Donate, task.await)
}

/// `PUT /campaigns/:id`
pub async fn update_campaign(
    State(state): State<Arc<ApiState>>,
    Path(campaign_id): Path<u64>,
    Json(body): Json<UpdateRequest>,
) -> impl IntoResponse {
    let current = state.feed.find(campaign_id);
    let form = match body.into_form(current.as_ref()) {
        Ok(form) => form,
        Err(e) => return error_response(&e),
    };
    let orchestrator = state.orchestrator.clone();
    let task = tokio::spawn(async move { orchestrator.update(campaign_id, form).await });
    action_response(campaign_id, ActionKind::Update, task.await)
}

/// `DELETE /campaigns/:id`
pub async fn delete_campaign(
    State(state): State<Arc<ApiState>>,
    Path(campaign_id): Path<u64>,
) -> impl IntoResponse {
    let orchestrator = state.orchestrator.clone();
    let task = tokio::spawn(async move { orchestrator.delete(campaign_id).await });
    action_response(campaign_id, ActionKind::Delete, task.await)
}

/// `GET /campaigns/:id/actions`
///
/// Per-action slot state and last feedback for one campaign.
pub async fn campaign_actions(
    State(state): State<Arc<ApiState>>,
    Path(campaign_id): Path<u64>,
) -> impl IntoResponse {
    let slots = ActionKind::ALL
        .iter()
        .map(|kind| (kind.as_str(), state.orchestrator.slot(campaign_id, *kind)))
        .collect();
    Json(ActionsResponse { campaign_id, slots })
}

// ─────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────

fn action_response(
    campaign_id: u64,
    kind: ActionKind,
    joined: std::result::Result<Result<ActionOutcome>, tokio::task::JoinError>,
) -> Response {
    match joined {
        Ok(Ok(ActionOutcome::Confirmed { tx_hash })) => (
            StatusCode::OK,
            Json(ActionResponse {
                campaign_id,
                action: kind.as_str(),
                tx_hash,
            }),
        )
            .into_response(),
        Ok(Ok(ActionOutcome::AlreadyInFlight)) => (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: format!("{} already in flight for campaign {campaign_id}", kind.as_str()),
                retryable: true,
            }),
        )
            .into_response(),
        Ok(Err(e)) => error_response(&e),
        Err(e) => {
            error!("{} task for campaign {campaign_id} aborted: {e}", kind.as_str());
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                    retryable: true,
                }),
            )
                .into_response()
        }
    }
}

fn error_response(err: &CampaignError) -> Response {
    let status = match err {
        CampaignError::Validation(_) => StatusCode::BAD_REQUEST,
        CampaignError::TransactionRejected(_) => StatusCode::CONFLICT,
        CampaignError::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
        CampaignError::ChainRead(_) | CampaignError::ChainWrite(_) | CampaignError::Upload(_) => {
            StatusCode::BAD_GATEWAY
        }
        CampaignError::Unconfirmed(_) => StatusCode::GATEWAY_TIMEOUT,
        CampaignError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            retryable: err.is_retryable(),
        }),
    )
        .into_response()
}
