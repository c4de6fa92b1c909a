//! Campaign sync: keeps a crowdfunding client consistent with its contract.
//!
//! Reads campaigns from an EVM contract, enriches them with off-chain
//! metadata, and drives the donate/update/delete transactions that mutate
//! them. The binary exposes all of this over a small Axum API.

pub mod aggregator;
pub mod api;
pub mod campaigns;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod metadata;
pub mod orchestrator;
pub mod rpc;
pub mod units;
pub mod upload;

#[cfg(test)]
mod test_listing;
#[cfg(test)]
mod test_mutations;

pub use aggregator::{Aggregator, CampaignFeed, ListingState};
pub use campaigns::{CampaignPhase, CampaignRecord, CampaignView};
pub use config::Config;
pub use errors::{CampaignError, Result};
pub use gateway::{ContractGateway, EvmGateway};
pub use orchestrator::{ActionKind, ActionOutcome, MutationOrchestrator, UpdateForm};
