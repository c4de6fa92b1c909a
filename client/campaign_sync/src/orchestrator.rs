//! Mutation orchestration: one state-changing user action end to end.
//!
//! Every action runs in a slot keyed by `(campaign id, action kind)`:
//!
//! ```text
//! Idle ──► InFlight ──► Succeeded ──► Idle   (refresh runs while Succeeded)
//!              └──────► Failed ─────► Idle
//! ```
//!
//! A trigger is accepted only from `Idle`. A second trigger on a busy slot is
//! a no-op answered with [`ActionOutcome::AlreadyInFlight`]; it is never
//! queued. Input validation happens before the slot is taken, so invalid
//! input never reaches the gateway.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{NaiveDate, Utc};
use ethers::types::U256;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::aggregator::CampaignFeed;
use crate::campaigns::{CampaignMetadata, CampaignPhase, CampaignView};
use crate::errors::{CampaignError, Result};
use crate::gateway::{ContractGateway, TxHash};
use crate::units::parse_ether;
use crate::upload::{Blob, MetadataStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Donate,
    Update,
    Delete,
}

impl ActionKind {
    pub const ALL: [ActionKind; 3] = [Self::Donate, Self::Update, Self::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Donate => "donate",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    #[default]
    Idle,
    InFlight,
    Succeeded,
    Failed,
}

impl ActionState {
    fn can_transition_to(self, next: ActionState) -> bool {
        use ActionState::*;
        matches!(
            (self, next),
            (Idle, InFlight) | (InFlight, Succeeded) | (InFlight, Failed) | (Succeeded, Idle) | (Failed, Idle)
        )
    }
}

/// Last user-visible outcome of a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Feedback {
    Succeeded { tx_hash: TxHash },
    Failed { message: String, retryable: bool },
}

impl Feedback {
    fn failed(err: &CampaignError) -> Self {
        Self::Failed {
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }

    /// Terminal slot state this outcome settles in.
    fn state(&self) -> ActionState {
        match self {
            Self::Succeeded { .. } => ActionState::Succeeded,
            Self::Failed { .. } => ActionState::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The transaction is included on chain and the listing was refreshed.
    Confirmed { tx_hash: TxHash },
    /// The slot was busy; nothing was submitted.
    AlreadyInFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SlotKey {
    campaign_id: u64,
    kind: ActionKind,
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} campaign {}", self.kind.as_str(), self.campaign_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SlotSnapshot {
    pub state: ActionState,
    pub feedback: Option<Feedback>,
}

// ─────────────────────────────────────────────────────────
// Slot table
// ─────────────────────────────────────────────────────────

#[derive(Default)]
struct SlotTable {
    slots: Mutex<HashMap<SlotKey, SlotSnapshot>>,
}

impl SlotTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<SlotKey, SlotSnapshot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the slot if it is idle.
    fn begin(&self, key: SlotKey) -> Option<SlotGuard<'_>> {
        let mut slots = self.lock();
        let slot = slots.entry(key).or_default();
        if slot.state != ActionState::Idle {
            return None;
        }
        slot.state = ActionState::InFlight;
        debug!("{key}: Idle -> InFlight");
        Some(SlotGuard {
            table: self,
            key,
            released: false,
        })
    }

    fn transition(&self, key: SlotKey, next: ActionState) {
        let mut slots = self.lock();
        let slot = slots.entry(key).or_default();
        if slot.state.can_transition_to(next) {
            debug!("{key}: {:?} -> {next:?}", slot.state);
            slot.state = next;
        } else {
            warn!("{key}: refusing transition {:?} -> {next:?}", slot.state);
        }
    }

    fn record(&self, key: SlotKey, feedback: Feedback) {
        self.lock().entry(key).or_default().feedback = Some(feedback);
    }

    /// Record feedback unless an action holds the slot. Returns whether it was written.
    fn record_if_idle(&self, key: SlotKey, feedback: Feedback) -> bool {
        let mut slots = self.lock();
        let slot = slots.entry(key).or_default();
        if slot.state != ActionState::Idle {
            return false;
        }
        slot.feedback = Some(feedback);
        true
    }

    fn snapshot(&self, key: SlotKey) -> SlotSnapshot {
        self.lock().get(&key).cloned().unwrap_or_default()
    }
}

/// Exclusive hold on one slot; returns it to `Idle` when dropped.
struct SlotGuard<'a> {
    table: &'a SlotTable,
    key: SlotKey,
    released: bool,
}

impl SlotGuard<'_> {
    fn transition(&self, next: ActionState) {
        self.table.transition(self.key, next);
    }

    /// Settle in the outcome's terminal state, then return to `Idle`.
    fn finish(mut self, feedback: Feedback) {
        if self.table.snapshot(self.key).state == ActionState::InFlight {
            self.table.transition(self.key, feedback.state());
        }
        self.table.record(self.key, feedback);
        self.table.transition(self.key, ActionState::Idle);
        self.released = true;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            // Orchestration future dropped mid-flight.
            warn!("{}: released without completing", self.key);
            self.table.lock().entry(self.key).or_default().state = ActionState::Idle;
        }
    }
}

// ─────────────────────────────────────────────────────────
// Update form
// ─────────────────────────────────────────────────────────

/// A file chosen in upload mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// User input for the update action.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateForm {
    pub title: String,
    pub description: String,
    /// Decimal ether amount.
    pub target: String,
    /// `YYYY-MM-DD`, read as UTC midnight.
    pub deadline: String,
    /// Image URL field; used unless a file is uploaded.
    pub image: String,
    /// Set in upload mode once a file is chosen.
    pub image_upload: Option<ImageUpload>,
}

impl UpdateForm {
    /// Form prefilled with the campaign's current values.
    pub fn from_view(view: &CampaignView) -> Self {
        Self {
            title: view.title.clone(),
            description: view.description.clone(),
            target: view.target.clone(),
            deadline: view.deadline_date().format("%Y-%m-%d").to_string(),
            image: view.image.clone(),
            image_upload: None,
        }
    }

    fn validate(self, today: NaiveDate) -> Result<ValidatedUpdate> {
        let title = required(&self.title, "title")?;
        let description = required(&self.description, "description")?;

        let target = parse_ether(&self.target)?;
        if target.is_zero() {
            return Err(CampaignError::Validation(
                "target must be greater than zero".to_string(),
            ));
        }

        let date = NaiveDate::parse_from_str(self.deadline.trim(), "%Y-%m-%d").map_err(|_| {
            CampaignError::Validation(format!("invalid deadline '{}': expected YYYY-MM-DD", self.deadline))
        })?;
        if date < today {
            return Err(CampaignError::Validation("deadline cannot be in the past".to_string()));
        }
        let deadline = date
            .and_hms_opt(0, 0, 0)
            .and_then(|midnight| u64::try_from(midnight.and_utc().timestamp()).ok())
            .ok_or_else(|| CampaignError::Validation("deadline out of range".to_string()))?;

        if let Some(upload) = &self.image_upload {
            if !upload.content_type.starts_with("image/") {
                return Err(CampaignError::Validation(format!(
                    "uploaded file must be an image, got {}",
                    upload.content_type
                )));
            }
            if upload.bytes.is_empty() {
                return Err(CampaignError::Validation("uploaded image is empty".to_string()));
            }
        } else {
            required(&self.image, "image URL")?;
        }

        Ok(ValidatedUpdate {
            title,
            description,
            image_url: self.image.trim().to_string(),
            image_upload: self.image_upload,
            target,
            deadline,
        })
    }
}

#[derive(Debug)]
struct ValidatedUpdate {
    title: String,
    description: String,
    image_url: String,
    image_upload: Option<ImageUpload>,
    target: U256,
    deadline: u64,
}

fn required(value: &str, field: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(CampaignError::Validation(format!("{field} is required")))
    } else {
        Ok(trimmed.to_string())
    }
}

// ─────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────

pub struct MutationOrchestrator {
    gateway: Arc<dyn ContractGateway>,
    store: Arc<dyn MetadataStore>,
    feed: Arc<CampaignFeed>,
    slots: SlotTable,
}

impl MutationOrchestrator {
    pub fn new(
        gateway: Arc<dyn ContractGateway>,
        store: Arc<dyn MetadataStore>,
        feed: Arc<CampaignFeed>,
    ) -> Self {
        Self {
            gateway,
            store,
            feed,
            slots: SlotTable::default(),
        }
    }

    pub fn slot(&self, campaign_id: u64, kind: ActionKind) -> SlotSnapshot {
        self.slots.snapshot(SlotKey { campaign_id, kind })
    }

    /// Donate `amount` (decimal ether) to a campaign.
    pub async fn donate(&self, campaign_id: u64, amount: &str) -> Result<ActionOutcome> {
        let key = SlotKey {
            campaign_id,
            kind: ActionKind::Donate,
        };
        let amount = self.reject_invalid(key, self.validate_donation(campaign_id, amount))?;
        self.run(key, || self.gateway.donate(campaign_id, amount)).await
    }

    /// Upload new metadata and point the campaign at it.
    pub async fn update(&self, campaign_id: u64, form: UpdateForm) -> Result<ActionOutcome> {
        let key = SlotKey {
            campaign_id,
            kind: ActionKind::Update,
        };
        let update = self.reject_invalid(key, form.validate(Utc::now().date_naive()))?;
        self.run(key, || self.apply_update(campaign_id, update)).await
    }

    /// Deactivate a campaign. Irreversible.
    pub async fn delete(&self, campaign_id: u64) -> Result<ActionOutcome> {
        let key = SlotKey {
            campaign_id,
            kind: ActionKind::Delete,
        };
        self.run(key, || self.gateway.delete_campaign(campaign_id)).await
    }

    fn validate_donation(&self, campaign_id: u64, amount: &str) -> Result<U256> {
        let amount = parse_ether(amount)?;
        if amount.is_zero() {
            return Err(CampaignError::Validation(
                "donation amount must be greater than zero".to_string(),
            ));
        }
        if let Some(view) = self.feed.find(campaign_id) {
            let phase = view.phase(Utc::now());
            if phase != CampaignPhase::Open {
                return Err(CampaignError::Validation(format!(
                    "campaign {campaign_id} is not accepting donations: {}",
                    phase.label()
                )));
            }
        }
        Ok(amount)
    }

    fn reject_invalid<T>(&self, key: SlotKey, validated: Result<T>) -> Result<T> {
        validated.map_err(|e| {
            info!("{key}: rejected before submission: {e}");
            // A running action owns the slot's feedback.
            if !self.slots.record_if_idle(key, Feedback::failed(&e)) {
                debug!("{key}: busy, keeping in-flight feedback");
            }
            e
        })
    }

    async fn apply_update(&self, campaign_id: u64, update: ValidatedUpdate) -> Result<TxHash> {
        let image = match update.image_upload {
            Some(upload) => {
                self.store
                    .upload(Blob {
                        bytes: upload.bytes,
                        content_type: upload.content_type,
                        file_name: Some(upload.file_name),
                    })
                    .await?
            }
            None => update.image_url,
        };

        let metadata = CampaignMetadata {
            title: Some(update.title),
            description: Some(update.description),
            image: Some(image),
        };
        let json = serde_json::to_vec(&metadata)
            .map_err(|e| CampaignError::Upload(format!("encoding metadata: {e}")))?;
        let metadata_uri = self.store.upload(Blob::json(json)).await?;

        self.gateway
            .update_campaign(campaign_id, &metadata_uri, update.target, update.deadline)
            .await
    }

    async fn run<F, Fut>(&self, key: SlotKey, op: F) -> Result<ActionOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TxHash>>,
    {
        let Some(slot) = self.slots.begin(key) else {
            info!("{key}: already in flight, ignoring trigger");
            return Ok(ActionOutcome::AlreadyInFlight);
        };

        match op().await {
            Ok(tx_hash) => {
                slot.transition(ActionState::Succeeded);
                if let Err(e) = self.feed.refresh().await {
                    warn!("{key}: confirmed in {tx_hash} but refresh failed: {e}");
                }
                info!("{key}: succeeded");
                slot.finish(Feedback::Succeeded {
                    tx_hash: tx_hash.clone(),
                });
                Ok(ActionOutcome::Confirmed { tx_hash })
            }
            Err(e) => {
                warn!("{key}: failed: {e}");
                slot.transition(ActionState::Failed);
                if matches!(e, CampaignError::Unconfirmed(_)) {
                    // The transaction may still have landed.
                    if let Err(refresh) = self.feed.refresh().await {
                        warn!("{key}: refresh after unconfirmed write failed: {refresh}");
                    }
                }
                slot.finish(Feedback::failed(&e));
                Err(e)
            }
        }
    }
}
