//! Application configuration loaded from environment variables.

use std::time::Duration;

use ethers::types::Address;

use crate::errors::{CampaignError, Result};

pub const DEFAULT_IPFS_GATEWAY: &str = "https://gateway.pinata.cloud/ipfs/";

#[derive(Debug, Clone)]
pub struct Config {
    /// JSON-RPC provider endpoint (e.g. http://127.0.0.1:8545)
    pub rpc_url: String,
    /// The crowdfunding contract address
    pub contract_address: Address,
    /// Account used for writes; falls back to the first `eth_accounts` entry
    pub signer_address: Option<Address>,
    /// HTTP gateway prefix substituted for `ipfs://`
    pub ipfs_gateway: String,
    /// Endpoint accepting metadata/image uploads and answering `{url}`
    pub upload_url: Option<String>,
    /// Bearer token for the upload endpoint
    pub upload_token: Option<String>,
    /// Port for the REST API server
    pub api_port: u16,
    /// Interval between confirmation polls
    pub confirmation_poll: Duration,
    /// Retries for transient read failures
    pub rpc_max_retries: u32,
    /// Periodic re-aggregation interval; `None` disables the loop
    pub refresh_interval: Option<Duration>,
    /// Optional HTTP client timeout; unset means calls may block indefinitely
    pub http_timeout: Option<Duration>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let contract_address = var("CONTRACT_ADDRESS").ok_or_else(|| {
            CampaignError::Config("CONTRACT_ADDRESS environment variable is required".to_string())
        })?;
        let contract_address = parse_address("CONTRACT_ADDRESS", &contract_address)?;

        let signer_address = var("SIGNER_ADDRESS")
            .map(|signer| parse_address("SIGNER_ADDRESS", &signer))
            .transpose()?;

        let mut ipfs_gateway = var("IPFS_GATEWAY").unwrap_or_else(|| DEFAULT_IPFS_GATEWAY.to_string());
        if !ipfs_gateway.ends_with('/') {
            ipfs_gateway.push('/');
        }

        let refresh_secs: u64 = parse_or(&var, "REFRESH_INTERVAL_SECS", 0)?;
        let http_timeout = match var("HTTP_TIMEOUT_SECS") {
            Some(raw) => Some(Duration::from_secs(raw.parse().map_err(|_| {
                CampaignError::Config("Invalid HTTP_TIMEOUT_SECS".to_string())
            })?)),
            None => None,
        };

        Ok(Config {
            rpc_url: var("RPC_URL").unwrap_or_else(|| "http://127.0.0.1:8545".to_string()),
            contract_address,
            signer_address,
            ipfs_gateway,
            upload_url: var("UPLOAD_URL"),
            upload_token: var("UPLOAD_TOKEN"),
            api_port: parse_or(&var, "API_PORT", 3001)?,
            confirmation_poll: Duration::from_millis(parse_or(&var, "CONFIRMATION_POLL_MS", 1000)?),
            rpc_max_retries: parse_or(&var, "RPC_MAX_RETRIES", 3)?,
            refresh_interval: (refresh_secs > 0).then(|| Duration::from_secs(refresh_secs)),
            http_timeout,
        })
    }
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| CampaignError::Config(format!("Invalid {key}"))),
        None => Ok(default),
    }
}

fn parse_address(key: &str, value: &str) -> Result<Address> {
    let invalid = || CampaignError::Config(format!("{key} must be a 0x-prefixed 20-byte hex address"));
    let value = value.trim();
    if !value.starts_with("0x") {
        return Err(invalid());
    }
    value.parse::<Address>().map_err(|_| invalid())
}
