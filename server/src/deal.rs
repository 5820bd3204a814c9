use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::Principal;
use crate::cross_chain::CrossChainEngine;
use crate::deployer::{DeploymentRequest, EscrowDeployer};
use crate::error::DealError;
use crate::model::{
    amount_to_base_units, Condition, ConditionKind, ConditionStatus, CrossChainTransaction,
    CrossChainTxStatus, Deal, DealStatus, Party, TimelineEvent, COND_BRIDGE_SETUP,
    COND_BRIDGE_TRANSFER, COND_FUNDS_LOCKED, COND_NETWORK_VALIDATION, NATIVE_DECIMALS,
};
use crate::networks::{infer_network, Network};
use crate::services::user_service::UserDirectory;
use crate::store::{DealStore, Page};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateDealRequest {
    pub initiated_by: Party,
    pub property_address: String,
    pub amount: f64,
    pub other_party_email: String,
    pub buyer_wallet_address: String,
    pub seller_wallet_address: String,
    #[serde(default)]
    pub initial_conditions: Vec<InitialCondition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitialCondition {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReviewConditionRequest {
    pub deal_id: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub cross_chain_tx_hash: Option<String>,
    #[serde(default)]
    pub cross_chain_step_number: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SyncStatusRequest {
    pub new_smart_contract_status: DealStatus,
    pub event_message: String,
    #[serde(default)]
    pub final_approval_deadline_iso: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dispute_resolution_deadline_iso: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StartFinalApprovalRequest {
    pub final_approval_deadline_iso: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RaiseDisputeRequest {
    pub dispute_resolution_deadline_iso: DateTime<Utc>,
    #[serde(default)]
    pub condition_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecuteStepRequest {
    pub step_number: u32,
    #[serde(default)]
    pub tx_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TransferRequest {
    pub tx_hash: String,
    #[serde(default)]
    pub bridge_tx_hash: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossChainStatus {
    pub deal_id: String,
    pub deal_status: DealStatus,
    pub transaction: Option<CrossChainTransaction>,
}

/// The deal lifecycle: owns every status transition, the condition protocol,
/// and the best-effort contract/bridge setup around creation.
pub struct DealService {
    store: Arc<dyn DealStore>,
    users: Arc<dyn UserDirectory>,
    engine: Arc<CrossChainEngine>,
    deployer: Option<Arc<dyn EscrowDeployer>>,
}

impl DealService {
    pub fn new(
        store: Arc<dyn DealStore>,
        users: Arc<dyn UserDirectory>,
        engine: Arc<CrossChainEngine>,
        deployer: Option<Arc<dyn EscrowDeployer>>,
    ) -> Self {
        DealService {
            store,
            users,
            engine,
            deployer,
        }
    }

    pub async fn create(
        &self,
        principal: &Principal,
        request: CreateDealRequest,
    ) -> Result<Deal, DealError> {
        if request.property_address.trim().is_empty() {
            return Err(DealError::InvalidArgument(
                "Property address is required.".to_string(),
            ));
        }
        let amount = amount_to_base_units(request.amount, NATIVE_DECIMALS)?;

        for condition in &request.initial_conditions {
            if condition.id.trim().is_empty()
                || condition.kind.trim().is_empty()
                || condition.description.trim().is_empty()
            {
                return Err(DealError::InvalidArgument(
                    "Each initial condition needs an id, a type and a description.".to_string(),
                ));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for condition in &request.initial_conditions {
            if !seen.insert(condition.id.as_str()) {
                return Err(DealError::InvalidArgument(format!(
                    "Duplicate condition id: {}.",
                    condition.id
                )));
            }
        }

        let buyer_network = infer_network(&request.buyer_wallet_address).ok_or_else(|| {
            DealError::InvalidArgument(format!(
                "Buyer wallet address {} is not valid on any supported network.",
                request.buyer_wallet_address
            ))
        })?;
        let seller_network = infer_network(&request.seller_wallet_address).ok_or_else(|| {
            DealError::InvalidArgument(format!(
                "Seller wallet address {} is not valid on any supported network.",
                request.seller_wallet_address
            ))
        })?;

        if request
            .buyer_wallet_address
            .eq_ignore_ascii_case(&request.seller_wallet_address)
        {
            return Err(DealError::InvalidArgument(
                "Buyer and seller wallets must be distinct.".to_string(),
            ));
        }

        let other_party = self
            .users
            .user_by_email(&request.other_party_email)
            .await?
            .ok_or_else(|| {
                DealError::NotFound(format!(
                    "No user found with email {}.",
                    request.other_party_email
                ))
            })?;
        if other_party.id == principal.id {
            return Err(DealError::InvalidArgument(
                "The other party must be a different user.".to_string(),
            ));
        }

        let (buyer_id, seller_id) = match request.initiated_by {
            Party::Buyer => (principal.id.clone(), other_party.id.clone()),
            Party::Seller => (other_party.id.clone(), principal.id.clone()),
        };

        let is_cross_chain =
            buyer_network != seller_network || !buyer_network.is_evm() || !seller_network.is_evm();
        let bridge_required = buyer_network != seller_network;

        let mut conditions: Vec<Condition> = request
            .initial_conditions
            .iter()
            .map(|c| {
                Condition::new(
                    c.id.clone(),
                    ConditionKind::from(c.kind.clone()),
                    c.description.clone(),
                )
            })
            .collect();
        if is_cross_chain {
            conditions.extend(cross_chain_conditions(
                buyer_network,
                seller_network,
                bridge_required,
            ));
        }

        let now = Utc::now();
        let deal = Deal {
            id: Uuid::new_v4().to_string(),
            buyer_id,
            seller_id,
            buyer_wallet: request.buyer_wallet_address.clone(),
            seller_wallet: request.seller_wallet_address.clone(),
            initiated_by: request.initiated_by,
            property_address: request.property_address.trim().to_string(),
            amount,
            buyer_network,
            seller_network,
            is_cross_chain,
            smart_contract_address: None,
            status: match request.initiated_by {
                Party::Buyer => DealStatus::PendingSellerReview,
                Party::Seller => DealStatus::PendingBuyerReview,
            },
            conditions,
            final_approval_deadline: None,
            dispute_resolution_deadline: None,
            funds_deposited_by_buyer: false,
            funds_released_to_seller: false,
            cross_chain_transaction_id: None,
            timeline: vec![TimelineEvent::by(&principal.id, "Deal created")],
            processing_error: None,
            created_at: now,
            updated_at: now,
        };

        self.store.create_deal(&deal).await?;
        info!(deal_id = %deal.id, is_cross_chain, "Deal created");

        // Contract deployment and bridge preparation are best effort: their
        // failures become timeline entries, never a failed creation.
        self.deploy_contract(&deal).await;
        if is_cross_chain {
            self.prepare_cross_chain(&deal).await;
        }

        self.store
            .deal(&deal.id)
            .await?
            .ok_or_else(|| DealError::Internal(anyhow::anyhow!("created deal disappeared")))
    }

    async fn deploy_contract(&self, deal: &Deal) {
        let (address, event) = self.deployment_outcome(deal).await;

        let result = self
            .store
            .transact(
                &deal.id,
                Box::new(move |txn| {
                    if let Some(address) = address {
                        txn.deal.smart_contract_address = Some(address);
                    }
                    txn.deal.timeline.push(event);
                    Ok(())
                }),
            )
            .await;
        if let Err(err) = result {
            warn!(deal_id = %deal.id, "Failed to record deployment outcome: {err}");
        }
    }

    async fn deployment_outcome(&self, deal: &Deal) -> (Option<String>, TimelineEvent) {
        let Some(deployer) = &self.deployer else {
            return (
                None,
                TimelineEvent::system("Contract deployment skipped: deployer not configured"),
            );
        };
        let Some(network) = [deal.buyer_network, deal.seller_network]
            .into_iter()
            .find(Network::is_evm)
        else {
            return (
                None,
                TimelineEvent::system("Contract deployment skipped: no EVM network involved"),
            );
        };
        if !network.validate_address(&deal.seller_wallet)
            || !network.validate_address(&deal.buyer_wallet)
        {
            return (
                None,
                TimelineEvent::system(
                    "Contract deployment skipped: escrow requires EVM wallets on both sides",
                ),
            );
        }

        match deployer
            .deploy(&DeploymentRequest {
                seller_wallet: deal.seller_wallet.clone(),
                buyer_wallet: deal.buyer_wallet.clone(),
                amount: deal.amount,
                network,
            })
            .await
        {
            Ok(deployment) => (
                Some(deployment.contract_address),
                TimelineEvent::system("Escrow contract deployed")
                    .with_tx_hash(deployment.deploy_tx_hash),
            ),
            Err(err) => {
                warn!(deal_id = %deal.id, "Contract deployment failed: {err}");
                (
                    None,
                    TimelineEvent::system(format!("Contract deployment failed: {err}")),
                )
            }
        }
    }

    async fn prepare_cross_chain(&self, deal: &Deal) {
        let event: TimelineEvent;
        let mut tx_id = None;
        match self.engine.prepare_transaction(deal).await {
            Ok(tx) => {
                event = match (&tx.bridge_info, tx.status) {
                    (Some(info), _) => TimelineEvent::system(format!(
                        "Cross-chain transaction prepared via {}",
                        info.bridge
                    )),
                    (None, CrossChainTxStatus::Failed) => {
                        let reason = tx
                            .steps
                            .first()
                            .and_then(|s| s.error.clone())
                            .unwrap_or_else(|| "no route".to_string());
                        TimelineEvent::system(format!("Bridge route unavailable: {reason}"))
                    }
                    (None, _) => TimelineEvent::system("Cross-chain transaction prepared"),
                };
                tx_id = Some(tx.id);
            }
            Err(err) => {
                warn!(deal_id = %deal.id, "Cross-chain setup failed: {err}");
                event = TimelineEvent::system(format!("Cross-chain setup failed: {err}"));
            }
        }

        let result = self
            .store
            .transact(
                &deal.id,
                Box::new(move |txn| {
                    txn.deal.cross_chain_transaction_id = tx_id;
                    txn.deal.timeline.push(event);
                    Ok(())
                }),
            )
            .await;
        if let Err(err) = result {
            warn!(deal_id = %deal.id, "Failed to record cross-chain preparation: {err}");
        }
    }

    pub async fn get(&self, principal: &Principal, deal_id: &str) -> Result<Deal, DealError> {
        let deal = self
            .store
            .deal(deal_id)
            .await?
            .ok_or_else(|| DealError::NotFound(format!("Deal {deal_id} not found.")))?;
        if !deal.is_participant(&principal.id) {
            return Err(DealError::Forbidden(
                "You are not a participant in this deal.".to_string(),
            ));
        }
        Ok(deal)
    }

    pub async fn list(&self, principal: &Principal, page: Page) -> Result<Vec<Deal>, DealError> {
        self.store.deals_for_participant(&principal.id, page).await
    }

    pub async fn review_condition(
        &self,
        principal: &Principal,
        condition_id: &str,
        request: ReviewConditionRequest,
    ) -> Result<Deal, DealError> {
        if request.status == ConditionStatus::PendingBuyerAction {
            return Err(DealError::InvalidArgument(
                "A review must either fulfill or withdraw the condition.".to_string(),
            ));
        }

        let principal_id = principal.id.clone();
        let condition_id_owned = condition_id.to_string();
        let target = request.status;
        let notes = request.notes.clone();
        let tx_hash = request.cross_chain_tx_hash.clone();

        let txn = self
            .store
            .transact(
                &request.deal_id,
                Box::new(move |txn| {
                    if !txn.deal.is_buyer(&principal_id) {
                        return Err(DealError::Forbidden(
                            "Only the buyer can review conditions.".to_string(),
                        ));
                    }
                    let condition =
                        txn.deal.condition_mut(&condition_id_owned).ok_or_else(|| {
                            DealError::NotFound(format!(
                                "Condition {condition_id_owned} not found."
                            ))
                        })?;
                    if condition.status == target {
                        return Err(DealError::Conflict(format!(
                            "Condition {condition_id_owned} is already in the requested status."
                        )));
                    }
                    if condition.status == ConditionStatus::FulfilledByBuyer
                        && target == ConditionStatus::ActionWithdrawnByBuyer
                    {
                        return Err(DealError::Conflict(
                            "A fulfilled condition can only be withdrawn through a dispute."
                                .to_string(),
                        ));
                    }

                    condition.status = target;
                    if notes.is_some() {
                        condition.notes = notes;
                    }
                    if tx_hash.is_some() {
                        condition.cross_chain_tx_hash = tx_hash.clone();
                    }
                    condition.updated_at = Utc::now();

                    let label = match target {
                        ConditionStatus::FulfilledByBuyer => "fulfilled",
                        ConditionStatus::ActionWithdrawnByBuyer => "withdrawn",
                        ConditionStatus::PendingBuyerAction => unreachable!("rejected above"),
                    };
                    txn.deal.timeline.push(TimelineEvent::by(
                        &principal_id,
                        format!("Condition '{condition_id_owned}' {label} by buyer"),
                    ));
                    Ok(())
                }),
            )
            .await?;

        // Cross-chain conditions reviewed with a step number also drive the
        // matching engine step.
        let is_cross_chain_condition = txn
            .deal
            .condition(condition_id)
            .is_some_and(|c| c.kind == ConditionKind::CrossChain);
        if is_cross_chain_condition {
            if let (Some(step_no), Some(tx_id)) = (
                request.cross_chain_step_number,
                txn.deal.cross_chain_transaction_id.clone(),
            ) {
                self.engine
                    .execute_step(&tx_id, step_no, request.cross_chain_tx_hash)
                    .await?;
            }
        }

        self.get(principal, &request.deal_id).await
    }

    pub async fn sync_status(
        &self,
        principal: &Principal,
        deal_id: &str,
        request: SyncStatusRequest,
    ) -> Result<Deal, DealError> {
        let now = Utc::now();
        for deadline in [
            request.final_approval_deadline_iso,
            request.dispute_resolution_deadline_iso,
        ]
        .into_iter()
        .flatten()
        {
            if deadline <= now {
                return Err(DealError::InvalidArgument(
                    "Deadlines must be in the future.".to_string(),
                ));
            }
        }

        let principal_id = principal.id.clone();
        let txn = self
            .store
            .transact(
                deal_id,
                Box::new(move |txn| {
                    if !txn.deal.is_participant(&principal_id) {
                        return Err(DealError::Forbidden(
                            "You are not a participant in this deal.".to_string(),
                        ));
                    }

                    let target = request.new_smart_contract_status;
                    if txn.deal.status == target {
                        // Observed state already matches; still record the event.
                        txn.deal
                            .timeline
                            .push(TimelineEvent::by(&principal_id, request.event_message));
                    } else {
                        txn.deal.transition_to(
                            target,
                            TimelineEvent::by(&principal_id, request.event_message),
                        )?;
                    }

                    if matches!(
                        target,
                        DealStatus::InEscrow
                            | DealStatus::AwaitingFulfillment
                            | DealStatus::ReadyForFinalApproval
                    ) {
                        txn.deal.funds_deposited_by_buyer = true;
                    }
                    if let Some(deadline) = request.final_approval_deadline_iso {
                        txn.deal.final_approval_deadline = Some(deadline);
                    }
                    if let Some(deadline) = request.dispute_resolution_deadline_iso {
                        txn.deal.dispute_resolution_deadline = Some(deadline);
                    }
                    Ok(())
                }),
            )
            .await?;
        Ok(txn.deal)
    }

    pub async fn start_final_approval(
        &self,
        principal: &Principal,
        deal_id: &str,
        request: StartFinalApprovalRequest,
    ) -> Result<Deal, DealError> {
        if request.final_approval_deadline_iso <= Utc::now() {
            return Err(DealError::InvalidArgument(
                "The final approval deadline must be in the future.".to_string(),
            ));
        }

        let principal_id = principal.id.clone();
        let txn = self
            .store
            .transact(
                deal_id,
                Box::new(move |txn| {
                    if !txn.deal.is_buyer(&principal_id) {
                        return Err(DealError::Forbidden(
                            "Only the buyer can start the final approval period.".to_string(),
                        ));
                    }
                    if !txn.deal.all_conditions_fulfilled() {
                        return Err(DealError::Conflict(
                            "All conditions must be fulfilled before starting the final approval period."
                                .to_string(),
                        ));
                    }
                    if !txn.deal.funds_deposited_by_buyer {
                        return Err(DealError::Conflict(
                            "Funds must be deposited before starting the final approval period."
                                .to_string(),
                        ));
                    }
                    txn.deal.transition_to(
                        DealStatus::InFinalApproval,
                        TimelineEvent::by(&principal_id, "Final approval period started"),
                    )?;
                    txn.deal.final_approval_deadline =
                        Some(request.final_approval_deadline_iso);
                    Ok(())
                }),
            )
            .await?;
        Ok(txn.deal)
    }

    pub async fn raise_dispute(
        &self,
        principal: &Principal,
        deal_id: &str,
        request: RaiseDisputeRequest,
    ) -> Result<Deal, DealError> {
        if request.dispute_resolution_deadline_iso <= Utc::now() {
            return Err(DealError::InvalidArgument(
                "The dispute resolution deadline must be in the future.".to_string(),
            ));
        }

        let principal_id = principal.id.clone();
        let txn = self
            .store
            .transact(
                deal_id,
                Box::new(move |txn| {
                    if !txn.deal.is_buyer(&principal_id) {
                        return Err(DealError::Forbidden(
                            "Only the buyer can raise a dispute via this sync endpoint."
                                .to_string(),
                        ));
                    }
                    if txn.deal.status == DealStatus::InDispute {
                        return Err(DealError::Conflict(
                            "Deal is already in dispute.".to_string(),
                        ));
                    }
                    txn.deal.transition_to(
                        DealStatus::InDispute,
                        TimelineEvent::by(&principal_id, "Dispute raised by buyer"),
                    )?;
                    txn.deal.dispute_resolution_deadline =
                        Some(request.dispute_resolution_deadline_iso);

                    if let Some(condition_id) = &request.condition_id {
                        if let Some(condition) = txn.deal.condition_mut(condition_id) {
                            if condition.status == ConditionStatus::FulfilledByBuyer {
                                condition.status = ConditionStatus::ActionWithdrawnByBuyer;
                                condition.updated_at = Utc::now();
                                txn.deal.timeline.push(TimelineEvent::by(
                                    &principal_id,
                                    format!(
                                        "Condition '{condition_id}' withdrawn as part of the dispute"
                                    ),
                                ));
                            }
                        }
                    }
                    Ok(())
                }),
            )
            .await?;
        Ok(txn.deal)
    }

    pub async fn execute_cross_chain_step(
        &self,
        principal: &Principal,
        deal_id: &str,
        request: ExecuteStepRequest,
    ) -> Result<CrossChainStatus, DealError> {
        let deal = self.get(principal, deal_id).await?;
        let tx_id = deal.cross_chain_transaction_id.clone().ok_or_else(|| {
            DealError::Conflict("Deal has no cross-chain transaction.".to_string())
        })?;
        let txn = self
            .engine
            .execute_step(&tx_id, request.step_number, request.tx_hash)
            .await?;
        Ok(CrossChainStatus {
            deal_id: txn.deal.id.clone(),
            deal_status: txn.deal.status,
            transaction: txn.cross_chain,
        })
    }

    pub async fn cross_chain_status(
        &self,
        principal: &Principal,
        deal_id: &str,
    ) -> Result<CrossChainStatus, DealError> {
        let deal = self.get(principal, deal_id).await?;
        let transaction = self.store.transaction_for_deal(deal_id).await?;
        Ok(CrossChainStatus {
            deal_id: deal.id.clone(),
            deal_status: deal.status,
            transaction,
        })
    }

    /// Drives bridge steps 1 and 2 with caller-supplied transaction hashes.
    /// Gated on every non-cross-chain condition being fulfilled first.
    pub async fn cross_chain_transfer(
        &self,
        principal: &Principal,
        deal_id: &str,
        request: TransferRequest,
    ) -> Result<CrossChainStatus, DealError> {
        let deal = self.get(principal, deal_id).await?;
        if !deal.is_buyer(&principal.id) {
            return Err(DealError::Forbidden(
                "Only the buyer can initiate the cross-chain transfer.".to_string(),
            ));
        }
        let unfulfilled: Vec<&str> = deal
            .conditions
            .iter()
            .filter(|c| {
                c.kind != ConditionKind::CrossChain
                    && c.status != ConditionStatus::FulfilledByBuyer
            })
            .map(|c| c.id.as_str())
            .collect();
        if !unfulfilled.is_empty() {
            return Err(DealError::Conflict(format!(
                "All conditions must be fulfilled before transferring. Pending: {}.",
                unfulfilled.join(", ")
            )));
        }
        let tx_id = deal.cross_chain_transaction_id.clone().ok_or_else(|| {
            DealError::Conflict("Deal has no cross-chain transaction.".to_string())
        })?;

        self.engine
            .execute_step(&tx_id, 1, Some(request.tx_hash))
            .await?;
        let txn = self
            .engine
            .execute_step(&tx_id, 2, request.bridge_tx_hash)
            .await?;

        Ok(CrossChainStatus {
            deal_id: txn.deal.id.clone(),
            deal_status: txn.deal.status,
            transaction: txn.cross_chain,
        })
    }
}

fn cross_chain_conditions(
    buyer_network: Network,
    seller_network: Network,
    bridge_required: bool,
) -> Vec<Condition> {
    let mut conditions = vec![
        Condition::new(
            COND_NETWORK_VALIDATION,
            ConditionKind::CrossChain,
            format!("Network compatibility validated ({buyer_network} to {seller_network})"),
        ),
        Condition::new(
            COND_BRIDGE_SETUP,
            ConditionKind::CrossChain,
            "Cross-chain bridge set up and receipt confirmed",
        ),
        Condition::new(
            COND_FUNDS_LOCKED,
            ConditionKind::CrossChain,
            "Funds locked on the source chain",
        ),
    ];
    if bridge_required {
        conditions.push(Condition::new(
            COND_BRIDGE_TRANSFER,
            ConditionKind::CrossChain,
            "Bridge transfer to the target chain settled",
        ));
    }
    conditions
}
