use std::sync::Arc;

use alloy::primitives::U256;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bridge::{
    BridgeError, BridgeRouter, BridgeTransferStatus, LoggingCallbacks, Route, RouteQuery,
};
use crate::error::DealError;
use crate::model::{
    BridgeInfo, CrossChainTransaction, CrossChainTxStatus, Deal, Step, StepAction, StepStatus,
    TimelineEvent, COND_BRIDGE_SETUP, COND_BRIDGE_TRANSFER, COND_FUNDS_LOCKED,
    COND_NETWORK_VALIDATION, CROSS_CHAIN_SYSTEM,
};
use crate::networks::Network;
use crate::store::{DealStore, DealTxn};

/// Fallback fee model when the aggregator cannot be reached: 0.1% of the
/// transfer (at least one dollar) plus a flat gas allowance.
const FALLBACK_FEE_RATE: f64 = 0.001;
const FALLBACK_FEE_MIN_USD: f64 = 1.0;
const FALLBACK_GAS_USD: f64 = 2.0;

#[derive(Debug, Clone, Serialize)]
pub struct FeeEstimate {
    pub source_network: Network,
    pub target_network: Network,
    #[serde(with = "crate::model::serde_u256")]
    pub amount: U256,
    pub bridge: Option<String>,
    pub fee_usd: f64,
    pub estimated_time_secs: u64,
    pub confidence: &'static str,
    pub fallback_mode: bool,
}

/// Owns the multi-step execution of one cross-chain transaction and
/// propagates progress back into the deal's conditions.
pub struct CrossChainEngine {
    store: Arc<dyn DealStore>,
    router: Arc<dyn BridgeRouter>,
}

enum StepApply {
    InitiateCompleted {
        execution_id: String,
        tx_hash: Option<String>,
    },
    MonitorDone {
        source_tx_hash: Option<String>,
        target_tx_hash: Option<String>,
    },
    MonitorPending,
    DirectCompleted {
        tx_hash: Option<String>,
    },
    Failed {
        error: String,
    },
}

impl CrossChainEngine {
    pub fn new(store: Arc<dyn DealStore>, router: Arc<dyn BridgeRouter>) -> Self {
        CrossChainEngine { store, router }
    }

    /// Plans the bridge route for a freshly created cross-chain deal and
    /// persists the prepared transaction. A missing route or unreachable
    /// aggregator yields a `failed` transaction rather than an error: deal
    /// creation must not abort.
    pub async fn prepare_transaction(
        &self,
        deal: &Deal,
    ) -> Result<CrossChainTransaction, DealError> {
        let now = Utc::now();
        let mut tx = CrossChainTransaction {
            id: Uuid::new_v4().to_string(),
            deal_id: deal.id.clone(),
            from_address: deal.buyer_wallet.clone(),
            to_address: deal.seller_wallet.clone(),
            amount: deal.amount,
            source_network: deal.buyer_network,
            target_network: deal.seller_network,
            bridge_info: None,
            steps: Vec::new(),
            status: CrossChainTxStatus::Prepared,
            last_status_check: None,
            created_at: now,
            updated_at: now,
        };

        for (wallet, network) in [
            (&deal.buyer_wallet, deal.buyer_network),
            (&deal.seller_wallet, deal.seller_network),
        ] {
            if !network.validate_address(wallet) {
                return Err(DealError::InvalidArgument(format!(
                    "Wallet {wallet} is not valid on {network}."
                )));
            }
        }

        let query = RouteQuery {
            from_address: deal.buyer_wallet.clone(),
            to_address: deal.seller_wallet.clone(),
            source_network: deal.buyer_network,
            target_network: deal.seller_network,
            token: deal.buyer_network.native_token().to_string(),
            amount: deal.amount,
        };

        match self.router.plan_route(&query).await {
            Ok(Some(route)) => {
                tx.bridge_info = Some(BridgeInfo {
                    bridge: route.bridge.clone(),
                    estimated_time_secs: route.estimated_time_secs,
                    fee_estimate_usd: route.fee_usd,
                    raw_route: route.raw.clone(),
                });
                tx.steps = canonical_steps();
                info!(
                    deal_id = %deal.id,
                    bridge = %route.bridge,
                    "Prepared cross-chain transaction"
                );
            }
            Ok(None) => {
                tx.status = CrossChainTxStatus::Failed;
                tx.steps = vec![failed_step(format!(
                    "No bridge route available from {} to {}.",
                    deal.buyer_network, deal.seller_network
                ))];
                warn!(deal_id = %deal.id, "No bridge route available");
            }
            Err(err) => {
                tx.status = CrossChainTxStatus::Failed;
                tx.steps = vec![failed_step(format!("Bridge route planning failed: {err}"))];
                warn!(deal_id = %deal.id, "Bridge route planning failed: {err}");
            }
        }

        self.store.create_transaction(&tx).await?;
        Ok(tx)
    }

    /// Executes (or re-polls) one step of a cross-chain transaction. Settled
    /// steps are left untouched and reported as success. External bridge
    /// calls happen before the store transaction so nothing suspends while
    /// holding it.
    pub async fn execute_step(
        &self,
        tx_id: &str,
        step_no: u32,
        supplied_tx_hash: Option<String>,
    ) -> Result<DealTxn, DealError> {
        let tx = self
            .store
            .transaction(tx_id)
            .await?
            .ok_or_else(|| {
                DealError::NotFound(format!("Cross-chain transaction {tx_id} not found."))
            })?;
        let step = tx.step(step_no).ok_or_else(|| {
            DealError::NotFound(format!(
                "Step {step_no} not found on cross-chain transaction {tx_id}."
            ))
        })?;

        if step.is_settled() {
            // Idempotent: nothing to do, report the current state.
            return self.store.transact_cross_chain(tx_id, Box::new(|_| Ok(()))).await;
        }

        let apply = match step.action {
            StepAction::InitiateBridge => self.initiate(&tx, supplied_tx_hash.clone()).await,
            StepAction::MonitorBridge => self.monitor(&tx, step).await,
            StepAction::ConfirmReceipt | StepAction::DirectTransfer => {
                if step.action == StepAction::DirectTransfer && supplied_tx_hash.is_none() {
                    return Err(DealError::InvalidArgument(
                        "A transaction hash is required for a direct transfer step.".to_string(),
                    ));
                }
                StepApply::DirectCompleted {
                    tx_hash: supplied_tx_hash.clone(),
                }
            }
        };

        self.store
            .transact_cross_chain(
                tx_id,
                Box::new(move |txn| apply_step(txn, step_no, apply)),
            )
            .await
    }

    async fn initiate(&self, tx: &CrossChainTransaction, supplied: Option<String>) -> StepApply {
        let Some(info) = &tx.bridge_info else {
            return StepApply::Failed {
                error: "Transaction has no planned bridge route.".to_string(),
            };
        };
        let route = Route {
            bridge: info.bridge.clone(),
            steps: Vec::new(),
            estimated_time_secs: info.estimated_time_secs,
            fee_usd: info.fee_estimate_usd,
            confidence: 100.0,
            raw: info.raw_route.clone(),
        };
        let callbacks = LoggingCallbacks {
            deal_id: tx.deal_id.clone(),
        };
        match self.router.execute(&route, &callbacks).await {
            Ok(execution) => StepApply::InitiateCompleted {
                execution_id: execution.execution_id,
                tx_hash: supplied.or(execution.initial_tx_hash),
            },
            Err(err) => StepApply::Failed {
                error: err.to_string(),
            },
        }
    }

    async fn monitor(&self, tx: &CrossChainTransaction, step: &Step) -> StepApply {
        let execution_id = step.execution_id.clone().or_else(|| {
            tx.steps
                .iter()
                .find_map(|s| s.execution_id.clone())
        });
        let Some(execution_id) = execution_id else {
            return StepApply::Failed {
                error: "Bridge execution has not been initiated.".to_string(),
            };
        };
        match self.router.status(&execution_id).await {
            Ok(update) => match update.status {
                BridgeTransferStatus::Done => StepApply::MonitorDone {
                    source_tx_hash: update.source_tx_hash,
                    target_tx_hash: update.target_tx_hash,
                },
                BridgeTransferStatus::Pending | BridgeTransferStatus::Unknown => {
                    StepApply::MonitorPending
                }
                BridgeTransferStatus::Failed => StepApply::Failed {
                    error: update
                        .substatus
                        .unwrap_or_else(|| "bridge reported failure".to_string()),
                },
            },
            Err(err) => StepApply::Failed {
                error: err.to_string(),
            },
        }
    }

    /// Read-only shadow of route planning. Degrades to the conservative
    /// fallback model when the aggregator cannot produce a route.
    pub async fn estimate_fees(
        &self,
        source_network: Network,
        target_network: Network,
        amount: U256,
    ) -> FeeEstimate {
        let query = RouteQuery {
            from_address: "0x0000000000000000000000000000000000000001".to_string(),
            to_address: "0x0000000000000000000000000000000000000002".to_string(),
            source_network,
            target_network,
            token: source_network.native_token().to_string(),
            amount,
        };

        match self.router.plan_route(&query).await {
            Ok(Some(route)) => FeeEstimate {
                source_network,
                target_network,
                amount,
                bridge: Some(route.bridge),
                fee_usd: route.fee_usd,
                estimated_time_secs: route.estimated_time_secs,
                confidence: "high",
                fallback_mode: false,
            },
            Ok(None) | Err(BridgeError::Unavailable(_)) | Err(BridgeError::Execution(_)) => {
                let tokens = amount.to_string().parse::<f64>().unwrap_or(0.0) / 1e18;
                FeeEstimate {
                    source_network,
                    target_network,
                    amount,
                    bridge: None,
                    fee_usd: (tokens * FALLBACK_FEE_RATE).max(FALLBACK_FEE_MIN_USD)
                        + FALLBACK_GAS_USD,
                    estimated_time_secs: 1800,
                    confidence: "low",
                    fallback_mode: true,
                }
            }
        }
    }
}

fn canonical_steps() -> Vec<Step> {
    vec![
        Step::new(
            1,
            StepAction::InitiateBridge,
            "Initiate the bridge transfer on the source chain",
            Some(COND_FUNDS_LOCKED),
        ),
        Step::new(
            2,
            StepAction::MonitorBridge,
            "Monitor the bridge until the transfer settles",
            Some(COND_BRIDGE_TRANSFER),
        ),
        Step::new(
            3,
            StepAction::ConfirmReceipt,
            "Confirm receipt on the target chain",
            Some(COND_BRIDGE_SETUP),
        ),
    ]
}

fn failed_step(error: String) -> Step {
    let mut step = Step::new(
        1,
        StepAction::InitiateBridge,
        "Initiate the bridge transfer on the source chain",
        Some(COND_FUNDS_LOCKED),
    );
    step.status = StepStatus::Failed;
    step.error = Some(error);
    step
}

fn apply_step(txn: &mut DealTxn, step_no: u32, apply: StepApply) -> Result<(), DealError> {
    let now = Utc::now();
    let tx = txn.cross_chain_mut()?;
    let step = tx.step_mut(step_no).ok_or_else(|| {
        DealError::NotFound(format!("Step {step_no} not found on cross-chain transaction."))
    })?;
    if step.is_settled() {
        // Settled concurrently since the pre-check; keep idempotent.
        return Ok(());
    }

    let mut fulfilled: Vec<(String, Option<String>)> = Vec::new();

    match apply {
        StepApply::MonitorPending => {
            tx.last_status_check = Some(now);
            return Ok(());
        }
        StepApply::InitiateCompleted {
            execution_id,
            tx_hash,
        } => {
            step.status = StepStatus::Completed;
            step.execution_id = Some(execution_id);
            step.tx_hash = tx_hash.clone();
            step.completed_at = Some(now);
            if let Some(mapping) = step.condition_mapping.clone() {
                fulfilled.push((mapping, tx_hash));
            }
            // The monitor step starts as soon as the bridge is initiated.
            if let Some(monitor) = tx
                .steps
                .iter_mut()
                .find(|s| s.action == StepAction::MonitorBridge && !s.is_settled())
            {
                monitor.status = StepStatus::InProgress;
                monitor.started_at = Some(now);
            }
        }
        StepApply::MonitorDone {
            source_tx_hash,
            target_tx_hash,
        } => {
            let hash = target_tx_hash.or(source_tx_hash);
            step.status = StepStatus::Completed;
            step.tx_hash = hash.clone();
            step.completed_at = Some(now);
            if let Some(mapping) = step.condition_mapping.clone() {
                fulfilled.push((mapping, hash.clone()));
            }
            tx.last_status_check = Some(now);
            if let Some(confirm) = tx
                .steps
                .iter_mut()
                .find(|s| s.action == StepAction::ConfirmReceipt && !s.is_settled())
            {
                confirm.status = StepStatus::Completed;
                confirm.tx_hash = hash.clone();
                confirm.completed_at = Some(now);
                if let Some(mapping) = confirm.condition_mapping.clone() {
                    fulfilled.push((mapping, hash));
                }
            }
        }
        StepApply::DirectCompleted { tx_hash } => {
            step.status = StepStatus::Completed;
            step.tx_hash = tx_hash.clone();
            step.completed_at = Some(now);
            if let Some(mapping) = step.condition_mapping.clone() {
                fulfilled.push((mapping, tx_hash));
            }
        }
        StepApply::Failed { error } => {
            step.status = StepStatus::Failed;
            step.error = Some(error.clone());
            step.completed_at = Some(now);
            txn.deal
                .timeline
                .push(TimelineEvent::system(format!(
                    "Cross-chain step {step_no} failed: {error}"
                )));
            let tx = txn.cross_chain_mut()?;
            tx.recompute_status();
            return Ok(());
        }
    }

    tx.recompute_status();
    let completed = tx.status == CrossChainTxStatus::Completed;
    let completion_hash = tx
        .steps
        .iter()
        .rev()
        .find_map(|s| s.tx_hash.clone());

    for (condition_id, tx_hash) in fulfilled {
        auto_fulfill(txn, &condition_id, tx_hash);
    }
    if completed {
        auto_fulfill(txn, COND_NETWORK_VALIDATION, completion_hash);
        txn.deal
            .timeline
            .push(TimelineEvent::system("Cross-chain transaction completed"));
    }
    Ok(())
}

/// Flips a pending cross-chain condition to fulfilled on behalf of the
/// system, recording the triggering transaction hash.
fn auto_fulfill(txn: &mut DealTxn, condition_id: &str, tx_hash: Option<String>) {
    use crate::model::ConditionStatus;

    let Some(condition) = txn.deal.condition_mut(condition_id) else {
        return;
    };
    if condition.status != ConditionStatus::PendingBuyerAction {
        return;
    }
    condition.status = ConditionStatus::FulfilledByBuyer;
    condition.auto_fulfilled_by = Some(CROSS_CHAIN_SYSTEM.to_string());
    condition.cross_chain_tx_hash = tx_hash.clone();
    condition.updated_at = Utc::now();

    let mut event = TimelineEvent::system(format!(
        "Condition '{condition_id}' auto-fulfilled by the cross-chain system"
    ));
    if let Some(hash) = tx_hash {
        event = event.with_tx_hash(hash);
    }
    txn.deal.timeline.push(event);
}
