use std::str::FromStr;
use std::time::Duration;

use alloy::{
    contract::{ContractInstance, Interface},
    dyn_abi::DynSolValue,
    json_abi::JsonAbi,
    primitives::{Address, U256},
    providers::{DynProvider, Provider, ProviderBuilder},
    signers::local::PrivateKeySigner,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde_json::json;

use crate::error::DealError;
use crate::networks::Network;

const READ_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("chain unavailable: {0}")]
    Unavailable(String),
    #[error("contract reverted: {0}")]
    Reverted(String),
}

impl From<ChainError> for DealError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Unavailable(msg) => DealError::ChainUnavailable(msg),
            ChainError::Reverted(msg) => DealError::Internal(anyhow::anyhow!(msg)),
        }
    }
}

/// Write/read access to the per-deal escrow contracts on one EVM network.
/// Holds the single backend operator key; nothing else signs. The client
/// never retries — callers own the retry policy.
#[async_trait]
pub trait EscrowChain: Send + Sync {
    /// The network this client is connected to.
    fn network(&self) -> Network;

    async fn release_funds_after_approval_period(
        &self,
        contract: &str,
    ) -> Result<String, ChainError>;

    async fn cancel_escrow_and_refund_buyer(&self, contract: &str)
        -> Result<String, ChainError>;

    async fn read_contract_state(&self, contract: &str) -> Result<u8, ChainError>;

    async fn balance_of(&self, address: &str) -> Result<U256, ChainError>;
}

#[derive(Clone)]
pub struct EvmChainClient {
    provider: DynProvider,
    interface: Interface,
    network: Network,
    operator: Address,
}

impl EvmChainClient {
    /// Connects the operator wallet to the network and verifies reachability
    /// by fetching the current block number before declaring itself ready.
    pub async fn connect(rpc_url: &str, private_key: &str, network: Network) -> Result<Self> {
        let url = Url::parse(rpc_url).with_context(|| format!("parsing RPC url: {rpc_url}"))?;

        let signer = PrivateKeySigner::from_str(private_key.trim_start_matches("0x"))
            .context("parsing backend wallet private key")?;
        let operator = signer.address();

        let provider = ProviderBuilder::new()
            .wallet(signer)
            .connect_http(url)
            .erased();

        let block = provider
            .get_block_number()
            .await
            .context("verifying network reachability")?;
        tracing::info!(network = %network, block, operator = %operator, "Chain client ready");

        let abi: JsonAbi = serde_json::from_value(json!([
            {
                "type": "function",
                "name": "releaseFundsAfterApprovalPeriod",
                "inputs": [],
                "outputs": [],
                "stateMutability": "nonpayable"
            },
            {
                "type": "function",
                "name": "cancelEscrowAndRefundBuyer",
                "inputs": [],
                "outputs": [],
                "stateMutability": "nonpayable"
            },
            {
                "type": "function",
                "name": "getContractState",
                "inputs": [],
                "outputs": [ { "type": "uint8" } ],
                "stateMutability": "view"
            }
        ]))
        .context("constructing escrow ABI")?;

        Ok(Self {
            provider,
            interface: Interface::new(abi),
            network,
            operator,
        })
    }

    /// Address of the backend operator wallet.
    pub fn operator(&self) -> Address {
        self.operator
    }

    fn contract(&self, address: &str) -> Result<ContractInstance<DynProvider>, ChainError> {
        let address = Address::from_str(address)
            .map_err(|e| ChainError::Reverted(format!("invalid contract address: {e}")))?;
        Ok(ContractInstance::new(
            address,
            self.provider.clone(),
            self.interface.clone(),
        ))
    }

    /// Sends one escrow method call and waits for a single confirmation.
    async fn send_contract_call(
        &self,
        contract: &str,
        method: &str,
    ) -> Result<String, ChainError> {
        let instance = self.contract(contract)?;
        let call = instance
            .function(method, &[])
            .map_err(|e| ChainError::Reverted(format!("building {method} call: {e}")))?;

        let send = async {
            let pending = call.send().await.map_err(classify_send_error)?;
            let tx_hash = *pending.tx_hash();
            pending
                .get_receipt()
                .await
                .map_err(|e| ChainError::Unavailable(format!("waiting for receipt: {e}")))?;
            Ok::<String, ChainError>(format!("{tx_hash:#x}"))
        };

        tokio::time::timeout(WRITE_TIMEOUT, send)
            .await
            .map_err(|_| ChainError::Unavailable(format!("{method} timed out")))?
    }
}

fn classify_send_error(err: alloy::contract::Error) -> ChainError {
    let msg = err.to_string();
    if msg.to_lowercase().contains("revert") {
        ChainError::Reverted(msg)
    } else {
        ChainError::Unavailable(msg)
    }
}

#[async_trait]
impl EscrowChain for EvmChainClient {
    fn network(&self) -> Network {
        self.network
    }

    async fn release_funds_after_approval_period(
        &self,
        contract: &str,
    ) -> Result<String, ChainError> {
        self.send_contract_call(contract, "releaseFundsAfterApprovalPeriod")
            .await
    }

    async fn cancel_escrow_and_refund_buyer(
        &self,
        contract: &str,
    ) -> Result<String, ChainError> {
        self.send_contract_call(contract, "cancelEscrowAndRefundBuyer")
            .await
    }

    async fn read_contract_state(&self, contract: &str) -> Result<u8, ChainError> {
        let instance = self.contract(contract)?;
        let call = instance
            .function("getContractState", &[])
            .map_err(|e| ChainError::Reverted(format!("building getContractState call: {e}")))?;

        let read = async {
            let values = call.call().await.map_err(classify_send_error)?;
            match values.first() {
                Some(DynSolValue::Uint(state, _)) => Ok(state.to::<u8>()),
                other => Err(ChainError::Reverted(format!(
                    "unexpected contract state value: {other:?}"
                ))),
            }
        };

        tokio::time::timeout(READ_TIMEOUT, read)
            .await
            .map_err(|_| ChainError::Unavailable("getContractState timed out".to_string()))?
    }

    async fn balance_of(&self, address: &str) -> Result<U256, ChainError> {
        let address = Address::from_str(address)
            .map_err(|e| ChainError::Reverted(format!("invalid address: {e}")))?;
        let read = self.provider.get_balance(address);
        tokio::time::timeout(READ_TIMEOUT, read)
            .await
            .map_err(|_| ChainError::Unavailable("balance read timed out".to_string()))?
            .map_err(|e| ChainError::Unavailable(e.to_string()))
    }
}
