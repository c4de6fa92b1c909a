//! Application-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CampaignError {
    /// Bad user input, caught before any network call.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No provider or signer available.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Chain read error: {0}")]
    ChainRead(String),

    /// RPC failure or revert on a state-changing call.
    #[error("Chain write error: {0}")]
    ChainWrite(String),

    /// Submitted, but inclusion could not be established. Never retried:
    /// the transaction may still land.
    #[error("Transaction submitted but unconfirmed: {0}")]
    Unconfirmed(String),

    /// The signer declined the transaction.
    #[error("Transaction rejected: {0}")]
    TransactionRejected(String),

    #[error("Upload error: {0}")]
    Upload(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CampaignError {
    /// Whether re-issuing the same intent may succeed without changing input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::ChainRead(_) | Self::ChainWrite(_) | Self::Upload(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CampaignError>;
