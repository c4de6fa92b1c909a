//! Campaign data model.
//!
//! * [`CampaignRecord`]: the authoritative on-chain record.
//! * [`CampaignMetadata`]: best-effort off-chain JSON (title, description, image).
//! * [`CampaignView`]: the merge of both, rebuilt from scratch on every
//!   aggregation pass and never persisted.

use chrono::{DateTime, NaiveDate, Utc};
use ethers::abi::{ParamType, Token};
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};

use crate::errors::{CampaignError, Result};
use crate::metadata::Resolution;
use crate::units::{format_ether, percent_of};

pub const PLACEHOLDER_TITLE: &str = "Untitled Campaign";
pub const PLACEHOLDER_DESCRIPTION: &str = "No description available";

/// Raw on-chain campaign as returned by `getActiveCampaigns()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignRecord {
    /// Position in the contract's campaign array.
    pub id: u64,
    /// Lowercase `0x`-prefixed address.
    pub owner: String,
    pub metadata_uri: String,
    /// Funding target in wei.
    pub target: U256,
    /// Unix seconds.
    pub deadline: u64,
    /// Wei collected so far; never decreases.
    pub amount_collected: U256,
    pub claimed: bool,
    /// Once false, never true again.
    pub is_active: bool,
}

impl CampaignRecord {
    /// ABI layout of one element of the `getActiveCampaigns()` result.
    pub fn param_type() -> ParamType {
        ParamType::Tuple(vec![
            ParamType::Address,
            ParamType::String,
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Bool,
            ParamType::Bool,
        ])
    }

    /// Rebuild a record from a decoded tuple at position `id`.
    pub fn from_token(id: u64, token: Token) -> Result<Self> {
        let malformed = |field: &str| CampaignError::ChainRead(format!("campaign {id}: bad {field}"));

        let mut fields = token.into_tuple().ok_or_else(|| malformed("tuple"))?.into_iter();
        let mut next = |field: &str| fields.next().ok_or_else(|| malformed(field));

        let owner = next("owner")?.into_address().ok_or_else(|| malformed("owner"))?;
        let metadata_uri = next("uri")?.into_string().ok_or_else(|| malformed("uri"))?;
        let target = next("target")?.into_uint().ok_or_else(|| malformed("target"))?;
        let deadline = next("deadline")?.into_uint().ok_or_else(|| malformed("deadline"))?;
        let amount_collected = next("amount")?.into_uint().ok_or_else(|| malformed("amount"))?;
        let claimed = next("claimed")?.into_bool().ok_or_else(|| malformed("claimed"))?;
        let is_active = next("active")?.into_bool().ok_or_else(|| malformed("active"))?;

        if deadline > U256::from(i64::MAX as u64) {
            return Err(CampaignError::ChainRead(format!(
                "campaign {id}: deadline {deadline} out of range"
            )));
        }

        Ok(CampaignRecord {
            id,
            owner: format!("{owner:?}"),
            metadata_uri,
            target,
            deadline: deadline.low_u64(),
            amount_collected,
            claimed,
            is_active,
        })
    }

    /// Inverse of [`CampaignRecord::from_token`].
    pub fn to_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Address(self.owner.parse::<Address>().unwrap_or_default()),
            Token::String(self.metadata_uri.clone()),
            Token::Uint(self.target),
            Token::Uint(U256::from(self.deadline)),
            Token::Uint(self.amount_collected),
            Token::Bool(self.claimed),
            Token::Bool(self.is_active),
        ])
    }
}

/// Off-chain campaign metadata. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignMetadata {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

/// Where a campaign stands at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignPhase {
    /// Accepting donations.
    Open,
    /// Deadline reached; the owner has not withdrawn yet.
    DeadlinePassed,
    /// Funds withdrawn by the owner.
    Claimed,
}

impl CampaignPhase {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Open => "Accepting donations",
            Self::DeadlinePassed => "Campaign deadline passed, awaiting claim",
            Self::Claimed => "Campaign funds claimed",
        }
    }
}

/// Display model for one campaign.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignView {
    pub id: u64,
    pub owner: String,
    pub title: String,
    pub description: String,
    pub image: String,
    pub metadata_uri: String,
    /// Ether display string, e.g. `10.0`.
    pub target: String,
    pub amount_collected: String,
    #[serde(skip)]
    pub target_wei: U256,
    #[serde(skip)]
    pub collected_wei: U256,
    pub deadline: DateTime<Utc>,
    pub claimed: bool,
    pub is_active: bool,
    /// False when placeholders stand in for unreachable metadata.
    pub metadata_resolved: bool,
}

impl CampaignView {
    pub fn merge(record: CampaignRecord, resolution: Resolution) -> Self {
        let metadata_resolved = resolution.is_resolved();
        let metadata = resolution.into_metadata();

        let title = non_empty(metadata.title).unwrap_or_else(|| PLACEHOLDER_TITLE.to_string());
        let description =
            non_empty(metadata.description).unwrap_or_else(|| PLACEHOLDER_DESCRIPTION.to_string());

        CampaignView {
            id: record.id,
            owner: record.owner,
            title,
            description,
            image: non_empty(metadata.image).unwrap_or_default(),
            metadata_uri: record.metadata_uri,
            target: format_ether(record.target),
            amount_collected: format_ether(record.amount_collected),
            target_wei: record.target,
            collected_wei: record.amount_collected,
            deadline: timestamp_to_datetime(record.deadline),
            claimed: record.claimed,
            is_active: record.is_active,
            metadata_resolved,
        }
    }

    /// Collected as a percentage of target; may exceed 100.
    pub fn progress_percent(&self) -> f64 {
        percent_of(self.collected_wei, self.target_wei)
    }

    /// Progress clamped for a progress bar.
    pub fn progress_bar_percent(&self) -> f64 {
        self.progress_percent().min(100.0)
    }

    pub fn phase(&self, now: DateTime<Utc>) -> CampaignPhase {
        if self.claimed {
            CampaignPhase::Claimed
        } else if now >= self.deadline {
            CampaignPhase::DeadlinePassed
        } else {
            CampaignPhase::Open
        }
    }

    pub fn accepts_donations(&self, now: DateTime<Utc>) -> bool {
        self.phase(now) == CampaignPhase::Open
    }

    /// `0x12....abcd` form of the owner address.
    pub fn owner_short(&self) -> String {
        let head: String = self.owner.chars().take(4).collect();
        let tail: String = self.owner.chars().skip(38).take(4).collect();
        format!("{head}....{tail}")
    }

    /// Deadline as the calendar date used by the update form.
    pub fn deadline_date(&self) -> NaiveDate {
        self.deadline.date_naive()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn timestamp_to_datetime(secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(|s| DateTime::from_timestamp(s, 0))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
