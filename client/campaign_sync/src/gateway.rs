//! Contract gateway: the only path to campaign state on chain.
//!
//! | Operation                | Contract call                                      |
//! |--------------------------|----------------------------------------------------|
//! | `list_active_campaigns`  | `getActiveCampaigns()` (read)                      |
//! | `donate`                 | `donateToCampaign(uint256)` payable                |
//! | `update_campaign`        | `updateCampaign(uint256,string,uint256,uint256)`   |
//! | `delete_campaign`        | `deleteCampaign(uint256)`                          |
//!
//! Every write suspends until the transaction is included in a block and its
//! receipt reports success. A caller never sees `Ok` for state that is not
//! durable on chain.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::providers::{JsonRpcClient, Middleware, PendingTransaction, Provider, ProviderError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, H256, U256, U64};
use ethers::utils::id;
use tracing::{debug, info, warn};

use crate::campaigns::CampaignRecord;
use crate::errors::{CampaignError, Result};
use crate::rpc::{transport_failure, RpcFailure, SEND_TRANSACTION, USER_REJECTED_CODE};

pub const GET_ACTIVE_CAMPAIGNS: &str = "getActiveCampaigns()";
pub const DONATE_TO_CAMPAIGN: &str = "donateToCampaign(uint256)";
pub const UPDATE_CAMPAIGN: &str = "updateCampaign(uint256,string,uint256,uint256)";
pub const DELETE_CAMPAIGN: &str = "deleteCampaign(uint256)";

/// Confirmed hashes remembered for replay detection.
const CONFIRMED_HISTORY: usize = 1024;

/// `0x`-prefixed transaction hash.
pub type TxHash = String;

#[async_trait]
pub trait ContractGateway: Send + Sync {
    /// All campaigns the contract reports, in contract order.
    async fn list_active_campaigns(&self) -> Result<Vec<CampaignRecord>>;

    /// Send `amount` wei to campaign `campaign_id`.
    async fn donate(&self, campaign_id: u64, amount: U256) -> Result<TxHash>;

    async fn update_campaign(
        &self,
        campaign_id: u64,
        metadata_uri: &str,
        target: U256,
        deadline: u64,
    ) -> Result<TxHash>;

    /// Irreversibly deactivate a campaign.
    async fn delete_campaign(&self, campaign_id: u64) -> Result<TxHash>;
}

/// Calldata for `signature` applied to `args`.
pub fn encode_call(signature: &str, args: &[Token]) -> Bytes {
    let mut data = id(signature).to_vec();
    data.extend(abi::encode(args));
    Bytes::from(data)
}

/// Insertion-ordered set of confirmed hashes with a fixed capacity.
#[derive(Debug)]
struct ConfirmedHashes {
    seen: HashSet<H256>,
    order: VecDeque<H256>,
    capacity: usize,
}

impl ConfirmedHashes {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn contains(&self, hash: &H256) -> bool {
        self.seen.contains(hash)
    }

    /// False if `hash` was already recorded.
    fn insert(&mut self, hash: H256) -> bool {
        if !self.seen.insert(hash) {
            return false;
        }
        self.order.push_back(hash);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// Gateway to an EVM contract through an ethers [`Provider`].
///
/// The provider's polling interval paces confirmation polling.
pub struct EvmGateway<P> {
    provider: Provider<P>,
    contract: Address,
    signer: Option<Address>,
    confirmed: Mutex<ConfirmedHashes>,
}

impl<P: JsonRpcClient + 'static> EvmGateway<P> {
    pub fn new(provider: Provider<P>, contract: Address, signer: Option<Address>) -> Self {
        Self {
            provider,
            contract,
            signer,
            confirmed: Mutex::new(ConfirmedHashes::new(CONFIRMED_HISTORY)),
        }
    }

    /// Configured signer, else the first account the provider exposes.
    async fn signer(&self) -> Result<Address> {
        if let Some(signer) = self.signer {
            return Ok(signer);
        }
        let accounts = self.provider.get_accounts().await.map_err(read_error)?;
        accounts
            .into_iter()
            .next()
            .ok_or_else(|| CampaignError::Connection("no signer account available".to_string()))
    }

    fn history(&self) -> MutexGuard<'_, ConfirmedHashes> {
        self.confirmed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submit, then wait for one confirmation.
    async fn submit(&self, action: &str, data: Bytes, value: Option<U256>) -> Result<TxHash> {
        let mut tx = TransactionRequest::new()
            .from(self.signer().await?)
            .to(self.contract)
            .data(data);
        if let Some(value) = value {
            tx = tx.value(value);
        }

        // Sent as-is: the signer fills gas and nonce.
        let hash: H256 = self
            .provider
            .request(SEND_TRANSACTION, [tx])
            .await
            .map_err(write_error)?;
        info!("{action}: submitted transaction {hash:?}");

        if self.history().contains(&hash) {
            warn!("{action}: signer returned already-confirmed transaction {hash:?}");
            return Err(already_counted(hash));
        }

        // Transient lookup failures are polled through, never surfaced.
        let receipt = match PendingTransaction::new(hash, &self.provider).await {
            Ok(Some(receipt)) => receipt,
            Ok(None) => {
                warn!("{action}: transaction {hash:?} disappeared from the node");
                return Err(CampaignError::Unconfirmed(format!(
                    "{hash:?} was dropped before inclusion"
                )));
            }
            Err(e) => {
                warn!("{action}: lost track of transaction {hash:?}: {e}");
                return Err(CampaignError::Unconfirmed(format!("{hash:?}: {e}")));
            }
        };

        if receipt.status != Some(U64::from(1)) {
            return Err(CampaignError::ChainWrite(format!("transaction {hash:?} reverted")));
        }

        // A hash confirms once; a concurrent waiter on the same hash loses.
        if !self.history().insert(hash) {
            return Err(already_counted(hash));
        }

        info!("{action}: transaction {hash:?} confirmed");
        Ok(format!("{hash:?}"))
    }
}

#[async_trait]
impl<P: JsonRpcClient + 'static> ContractGateway for EvmGateway<P> {
    async fn list_active_campaigns(&self) -> Result<Vec<CampaignRecord>> {
        let call: TypedTransaction = TransactionRequest::new()
            .to(self.contract)
            .data(encode_call(GET_ACTIVE_CAMPAIGNS, &[]))
            .into();
        let raw = self.provider.call(&call, None).await.map_err(read_error)?;

        let ty = ParamType::Array(Box::new(CampaignRecord::param_type()));
        let rows = abi::decode(&[ty], &raw)
            .map_err(|e| CampaignError::ChainRead(format!("decoding campaigns: {e}")))?
            .into_iter()
            .next()
            .and_then(Token::into_array)
            .unwrap_or_default();

        let records = rows
            .into_iter()
            .enumerate()
            .map(|(index, row)| CampaignRecord::from_token(index as u64, row))
            .collect::<Result<Vec<_>>>()?;

        debug!("Contract returned {} campaigns", records.len());
        Ok(records)
    }

    async fn donate(&self, campaign_id: u64, amount: U256) -> Result<TxHash> {
        if amount.is_zero() {
            return Err(CampaignError::Validation(
                "donation amount must be greater than zero".to_string(),
            ));
        }
        let data = encode_call(DONATE_TO_CAMPAIGN, &[Token::Uint(U256::from(campaign_id))]);
        self.submit("donate", data, Some(amount)).await
    }

    async fn update_campaign(
        &self,
        campaign_id: u64,
        metadata_uri: &str,
        target: U256,
        deadline: u64,
    ) -> Result<TxHash> {
        let data = encode_call(
            UPDATE_CAMPAIGN,
            &[
                Token::Uint(U256::from(campaign_id)),
                Token::String(metadata_uri.to_string()),
                Token::Uint(target),
                Token::Uint(U256::from(deadline)),
            ],
        );
        self.submit("update", data, None).await
    }

    async fn delete_campaign(&self, campaign_id: u64) -> Result<TxHash> {
        let data = encode_call(DELETE_CAMPAIGN, &[Token::Uint(U256::from(campaign_id))]);
        self.submit("delete", data, None).await
    }
}

fn already_counted(hash: H256) -> CampaignError {
    CampaignError::ChainWrite(format!(
        "transaction {hash:?} was already confirmed; refusing to count it twice"
    ))
}

fn read_error(err: ProviderError) -> CampaignError {
    match transport_failure(&err) {
        Some(RpcFailure::Unreachable(reason)) => CampaignError::Connection(reason.clone()),
        _ => CampaignError::ChainRead(err.to_string()),
    }
}

fn write_error(err: ProviderError) -> CampaignError {
    match transport_failure(&err) {
        Some(RpcFailure::Unreachable(reason)) => CampaignError::Connection(reason.clone()),
        Some(RpcFailure::Rpc(rpc)) if rpc.code == USER_REJECTED_CODE => {
            CampaignError::TransactionRejected(rpc.message.clone())
        }
        _ => CampaignError::ChainWrite(err.to_string()),
    }
}
