use std::str::FromStr;
use std::time::Duration;

use alloy::{
    dyn_abi::DynSolValue,
    json_abi::JsonAbi,
    network::TransactionBuilder,
    primitives::{Address, U256},
    providers::{Provider, ProviderBuilder},
    rpc::types::TransactionRequest,
    signers::local::PrivateKeySigner,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;

use crate::networks::Network;

const DEPLOY_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("{0}")]
    Generic(String),
}

#[derive(Debug, Clone)]
pub struct DeploymentRequest {
    pub seller_wallet: String,
    pub buyer_wallet: String,
    pub amount: U256,
    pub network: Network,
}

#[derive(Debug, Clone)]
pub struct Deployment {
    pub contract_address: String,
    pub deploy_tx_hash: String,
}

/// Deploys one escrow contract per deal. Failure here is never fatal to deal
/// creation; callers record it in the timeline instead.
#[async_trait]
pub trait EscrowDeployer: Send + Sync {
    async fn deploy(&self, request: &DeploymentRequest) -> Result<Deployment, DeployError>;
}

/// ABI + creation bytecode of the escrow contract, loaded once at startup
/// and immutable thereafter.
#[derive(Debug, Clone, Deserialize)]
pub struct EscrowArtifact {
    pub abi: JsonAbi,
    pub bytecode: String,
}

impl EscrowArtifact {
    pub fn embedded() -> Result<Self> {
        serde_json::from_str(include_str!("artifacts/property_escrow.json"))
            .context("parsing embedded escrow artifact")
    }
}

pub struct ArtifactDeployer {
    artifact: EscrowArtifact,
    rpc_url: String,
    private_key: String,
    service_fee_wallet: String,
}

impl ArtifactDeployer {
    pub fn new(
        artifact: EscrowArtifact,
        rpc_url: impl Into<String>,
        private_key: impl Into<String>,
        service_fee_wallet: impl Into<String>,
    ) -> Self {
        ArtifactDeployer {
            artifact,
            rpc_url: rpc_url.into(),
            private_key: private_key.into(),
            service_fee_wallet: service_fee_wallet.into(),
        }
    }

    /// Everything that can be checked without touching the network.
    fn validate(&self, request: &DeploymentRequest) -> Result<DeployArgs, DeployError> {
        if self.rpc_url.trim().is_empty() {
            return Err(DeployError::InvalidArgument(
                "RPC URL is not configured.".to_string(),
            ));
        }
        if !self.private_key.starts_with("0x") {
            return Err(DeployError::InvalidArgument(
                "Deployer private key must be 0x-prefixed hex.".to_string(),
            ));
        }
        if request.amount.is_zero() {
            return Err(DeployError::InvalidArgument(
                "Escrow amount must be greater than zero.".to_string(),
            ));
        }
        if !request.network.is_evm() {
            return Err(DeployError::InvalidArgument(format!(
                "Cannot deploy an escrow contract on {}.",
                request.network
            )));
        }
        let seller = Address::from_str(&request.seller_wallet).map_err(|_| {
            DeployError::InvalidArgument(format!(
                "Seller wallet {} is not a valid address.",
                request.seller_wallet
            ))
        })?;
        let buyer = Address::from_str(&request.buyer_wallet).map_err(|_| {
            DeployError::InvalidArgument(format!(
                "Buyer wallet {} is not a valid address.",
                request.buyer_wallet
            ))
        })?;
        let service_wallet = Address::from_str(&self.service_fee_wallet).map_err(|_| {
            DeployError::InvalidArgument("Service fee wallet is misconfigured.".to_string())
        })?;
        Ok(DeployArgs {
            seller,
            buyer,
            service_wallet,
        })
    }

    fn deploy_code(&self, args: &DeployArgs, amount: U256) -> Result<Vec<u8>, DeployError> {
        let bytecode = hex::decode(self.artifact.bytecode.trim_start_matches("0x"))
            .map_err(|e| DeployError::InvalidArgument(format!("artifact bytecode: {e}")))?;
        let ctor_args = DynSolValue::Tuple(vec![
            DynSolValue::Address(args.seller),
            DynSolValue::Address(args.buyer),
            DynSolValue::Uint(amount, 256),
            DynSolValue::Address(args.service_wallet),
        ])
        .abi_encode_params();

        let mut code = bytecode;
        code.extend_from_slice(&ctor_args);
        Ok(code)
    }
}

struct DeployArgs {
    seller: Address,
    buyer: Address,
    service_wallet: Address,
}

#[async_trait]
impl EscrowDeployer for ArtifactDeployer {
    async fn deploy(&self, request: &DeploymentRequest) -> Result<Deployment, DeployError> {
        let args = self.validate(request)?;
        let code = self.deploy_code(&args, request.amount)?;

        let url = Url::parse(&self.rpc_url)
            .map_err(|e| DeployError::InvalidArgument(format!("RPC url: {e}")))?;
        let signer = PrivateKeySigner::from_str(self.private_key.trim_start_matches("0x"))
            .map_err(|e| DeployError::InvalidArgument(format!("deployer key: {e}")))?;
        let provider = ProviderBuilder::new()
            .wallet(signer)
            .connect_http(url)
            .erased();

        let tx = TransactionRequest::default().with_deploy_code(code);

        let send = async {
            let pending = provider
                .send_transaction(tx)
                .await
                .map_err(classify_deploy_error)?;
            let tx_hash = *pending.tx_hash();
            let receipt = pending
                .get_receipt()
                .await
                .map_err(|e| DeployError::NetworkError(format!("waiting for receipt: {e}")))?;
            let contract_address = receipt.contract_address.ok_or_else(|| {
                DeployError::Generic("deployment receipt carries no contract address".to_string())
            })?;
            Ok::<Deployment, DeployError>(Deployment {
                contract_address: format!("{contract_address:#x}"),
                deploy_tx_hash: format!("{tx_hash:#x}"),
            })
        };

        tokio::time::timeout(DEPLOY_TIMEOUT, send)
            .await
            .map_err(|_| DeployError::NetworkError("deployment timed out".to_string()))?
    }
}

fn classify_deploy_error(err: alloy::transports::RpcError<alloy::transports::TransportErrorKind>) -> DeployError {
    let msg = err.to_string();
    let lowered = msg.to_lowercase();
    if lowered.contains("insufficient funds") {
        DeployError::InsufficientFunds(msg)
    } else if lowered.contains("invalid") || lowered.contains("odd number of digits") {
        DeployError::InvalidArgument(msg)
    } else if lowered.contains("connect")
        || lowered.contains("timed out")
        || lowered.contains("error sending request")
    {
        DeployError::NetworkError(msg)
    } else {
        DeployError::Generic(msg)
    }
}
