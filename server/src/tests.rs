use std::sync::{Arc, Mutex};

use alloy::primitives::U256;
use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::auth::Principal;
use crate::bridge::{BridgeStatusUpdate, BridgeTransferStatus, MockBridgeRouter};
use crate::chain::{ChainError, EscrowChain};
use crate::cross_chain::CrossChainEngine;
use crate::deal::{
    CreateDealRequest, DealService, ExecuteStepRequest, InitialCondition, RaiseDisputeRequest,
    ReviewConditionRequest, StartFinalApprovalRequest, SyncStatusRequest, TransferRequest,
};
use crate::deployer::{DeployError, Deployment, DeploymentRequest, EscrowDeployer};
use crate::error::DealError;
use crate::model::{
    Condition, ConditionKind, ConditionStatus, CrossChainTransaction, CrossChainTxStatus, Deal,
    DealStatus, Party, Step, StepAction, StepStatus, TimelineEvent, COND_BRIDGE_SETUP,
    COND_BRIDGE_TRANSFER, COND_FUNDS_LOCKED, COND_NETWORK_VALIDATION, CROSS_CHAIN_SYSTEM,
};
use crate::networks::Network;
use crate::scheduler::{DeadlineScheduler, SchedulerConfig};
use crate::services::user_service::{StaticUserDirectory, User};
use crate::store::{DealStore, MemoryDealStore, Page};

const BUYER_WALLET: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const SELLER_WALLET: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
const SELLER_SOLANA_WALLET: &str = "9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM";
const CONTRACT_ADDRESS: &str = "0xcccccccccccccccccccccccccccccccccccccccc";

fn buyer() -> Principal {
    Principal {
        id: "buyer-1".to_string(),
        email: "buyer@example.com".to_string(),
    }
}

fn seller() -> Principal {
    Principal {
        id: "seller-1".to_string(),
        email: "seller@example.com".to_string(),
    }
}

fn outsider() -> Principal {
    Principal {
        id: "stranger-1".to_string(),
        email: "stranger@example.com".to_string(),
    }
}

struct Harness {
    store: Arc<MemoryDealStore>,
    router: Arc<MockBridgeRouter>,
    engine: Arc<CrossChainEngine>,
    service: DealService,
}

fn harness() -> Harness {
    harness_with(MockBridgeRouter::with_default_route(), None)
}

fn harness_with(
    router: MockBridgeRouter,
    deployer: Option<Arc<dyn EscrowDeployer>>,
) -> Harness {
    let store = Arc::new(MemoryDealStore::new());
    let router = Arc::new(router);
    let engine = Arc::new(CrossChainEngine::new(store.clone(), router.clone()));
    let users = Arc::new(StaticUserDirectory::new(vec![
        User {
            id: "buyer-1".to_string(),
            email: "buyer@example.com".to_string(),
            display_name: None,
        },
        User {
            id: "seller-1".to_string(),
            email: "seller@example.com".to_string(),
            display_name: None,
        },
    ]));
    let service = DealService::new(store.clone(), users, engine.clone(), deployer);
    Harness {
        store,
        router,
        engine,
        service,
    }
}

fn same_chain_request() -> CreateDealRequest {
    CreateDealRequest {
        initiated_by: Party::Buyer,
        property_address: "123 Main St".to_string(),
        amount: 1.5,
        other_party_email: "seller@example.com".to_string(),
        buyer_wallet_address: BUYER_WALLET.to_string(),
        seller_wallet_address: SELLER_WALLET.to_string(),
        initial_conditions: vec![InitialCondition {
            id: "inspection".to_string(),
            kind: "INSPECTION".to_string(),
            description: "Property inspection passes".to_string(),
        }],
    }
}

fn cross_chain_request() -> CreateDealRequest {
    CreateDealRequest {
        seller_wallet_address: SELLER_SOLANA_WALLET.to_string(),
        ..same_chain_request()
    }
}

fn timeline_contains(deal: &Deal, needle: &str) -> bool {
    deal.timeline.iter().any(|e| e.event.contains(needle))
}

// --------------------------------------------------------
//     Chain / deployer doubles
// --------------------------------------------------------

struct MockChain {
    fail: bool,
    calls: Mutex<Vec<String>>,
}

impl MockChain {
    fn ok() -> Self {
        MockChain {
            fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn unavailable() -> Self {
        MockChain {
            fail: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl EscrowChain for MockChain {
    fn network(&self) -> Network {
        Network::Ethereum
    }

    async fn release_funds_after_approval_period(
        &self,
        contract: &str,
    ) -> Result<String, ChainError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("release:{contract}"));
        if self.fail {
            return Err(ChainError::Unavailable("rpc unreachable".to_string()));
        }
        Ok("0xrelease".to_string())
    }

    async fn cancel_escrow_and_refund_buyer(
        &self,
        contract: &str,
    ) -> Result<String, ChainError> {
        self.calls.lock().unwrap().push(format!("cancel:{contract}"));
        if self.fail {
            return Err(ChainError::Unavailable("rpc unreachable".to_string()));
        }
        Ok("0xcancel".to_string())
    }

    async fn read_contract_state(&self, _contract: &str) -> Result<u8, ChainError> {
        Ok(0)
    }

    async fn balance_of(&self, _address: &str) -> Result<U256, ChainError> {
        Ok(U256::ZERO)
    }
}

struct FixedDeployer;

#[async_trait]
impl EscrowDeployer for FixedDeployer {
    async fn deploy(&self, _request: &DeploymentRequest) -> Result<Deployment, DeployError> {
        Ok(Deployment {
            contract_address: CONTRACT_ADDRESS.to_string(),
            deploy_tx_hash: "0xdeploy".to_string(),
        })
    }
}

struct FailingDeployer;

#[async_trait]
impl EscrowDeployer for FailingDeployer {
    async fn deploy(&self, _request: &DeploymentRequest) -> Result<Deployment, DeployError> {
        Err(DeployError::NetworkError("rpc down".to_string()))
    }
}

fn scheduler(h: &Harness, chain: Option<Arc<MockChain>>) -> DeadlineScheduler {
    DeadlineScheduler::new(
        h.store.clone(),
        chain.map(|c| c as Arc<dyn EscrowChain>),
        h.engine.clone(),
        SchedulerConfig::default(),
    )
}

/// A deal seeded directly into the store, bypassing creation, for scheduler
/// and transition tests.
fn seeded_deal(status: DealStatus) -> Deal {
    let now = Utc::now();
    Deal {
        id: format!("deal-{}", uuid::Uuid::new_v4()),
        buyer_id: "buyer-1".to_string(),
        seller_id: "seller-1".to_string(),
        buyer_wallet: BUYER_WALLET.to_string(),
        seller_wallet: SELLER_WALLET.to_string(),
        initiated_by: Party::Buyer,
        property_address: "123 Main St".to_string(),
        amount: U256::from(1_000_000_000_000_000_000u128),
        buyer_network: Network::Ethereum,
        seller_network: Network::Ethereum,
        is_cross_chain: false,
        smart_contract_address: Some(CONTRACT_ADDRESS.to_string()),
        status,
        conditions: vec![],
        final_approval_deadline: None,
        dispute_resolution_deadline: None,
        funds_deposited_by_buyer: true,
        funds_released_to_seller: false,
        cross_chain_transaction_id: None,
        timeline: vec![TimelineEvent::by("buyer-1", "Deal created")],
        processing_error: None,
        created_at: now,
        updated_at: now,
    }
}

// --------------------------------------------------------
//     Creation
// --------------------------------------------------------

#[tokio::test]
async fn buyer_initiated_same_chain_create_without_deployer() {
    let h = harness();
    let deal = h.service.create(&buyer(), same_chain_request()).await.unwrap();

    assert_eq!(deal.status, DealStatus::PendingSellerReview);
    assert_eq!(deal.smart_contract_address, None);
    assert!(!deal.is_cross_chain);
    assert_eq!(deal.buyer_id, "buyer-1");
    assert_eq!(deal.seller_id, "seller-1");
    assert_eq!(deal.amount, U256::from(1_500_000_000_000_000_000u128));
    assert!(timeline_contains(&deal, "Deal created"));
    assert!(timeline_contains(
        &deal,
        "Contract deployment skipped: deployer not configured"
    ));
}

#[tokio::test]
async fn seller_initiated_deal_starts_in_buyer_review() {
    let h = harness();
    let request = CreateDealRequest {
        initiated_by: Party::Seller,
        ..same_chain_request()
    };
    let deal = h.service.create(&seller(), request).await.unwrap();
    assert_eq!(deal.status, DealStatus::PendingBuyerReview);
    // The seller initiated, so the counterparty is the buyer.
    assert_eq!(deal.buyer_id, "buyer-1");
    assert_eq!(deal.seller_id, "seller-1");
}

#[tokio::test]
async fn create_deploys_contract_when_configured() {
    let h = harness_with(
        MockBridgeRouter::with_default_route(),
        Some(Arc::new(FixedDeployer)),
    );
    let deal = h.service.create(&buyer(), same_chain_request()).await.unwrap();
    assert_eq!(
        deal.smart_contract_address.as_deref(),
        Some(CONTRACT_ADDRESS)
    );
    assert!(timeline_contains(&deal, "Escrow contract deployed"));
}

#[tokio::test]
async fn deployment_failure_never_fails_creation() {
    let h = harness_with(
        MockBridgeRouter::with_default_route(),
        Some(Arc::new(FailingDeployer)),
    );
    let deal = h.service.create(&buyer(), same_chain_request()).await.unwrap();
    assert_eq!(deal.smart_contract_address, None);
    assert!(timeline_contains(&deal, "Contract deployment failed"));
}

#[tokio::test]
async fn cross_chain_create_appends_bridge_conditions() {
    let h = harness();
    let deal = h.service.create(&buyer(), cross_chain_request()).await.unwrap();

    assert!(deal.is_cross_chain);
    assert_eq!(deal.buyer_network, Network::Ethereum);
    assert_eq!(deal.seller_network, Network::Solana);

    let ids: Vec<&str> = deal.conditions.iter().map(|c| c.id.as_str()).collect();
    assert!(ids.contains(&"inspection"));
    let cross_chain_ids: Vec<&str> = deal
        .conditions
        .iter()
        .filter(|c| c.kind == ConditionKind::CrossChain)
        .map(|c| c.id.as_str())
        .collect();
    assert_eq!(
        cross_chain_ids,
        vec![
            COND_NETWORK_VALIDATION,
            COND_BRIDGE_SETUP,
            COND_FUNDS_LOCKED,
            COND_BRIDGE_TRANSFER
        ]
    );

    let tx_id = deal.cross_chain_transaction_id.expect("linked transaction");
    let tx = h.store.transaction(&tx_id).await.unwrap().unwrap();
    assert_eq!(tx.steps.len(), 3);
    assert_eq!(tx.status, CrossChainTxStatus::Prepared);
    assert_eq!(tx.bridge_info.unwrap().bridge, "wormhole");
    assert!(timeline_contains(
        &h.store.deal(&deal.id).await.unwrap().unwrap(),
        "Cross-chain transaction prepared via wormhole"
    ));
}

#[tokio::test]
async fn no_route_still_creates_the_deal() {
    let h = harness_with(MockBridgeRouter::without_route(), None);
    let deal = h.service.create(&buyer(), cross_chain_request()).await.unwrap();

    let tx_id = deal.cross_chain_transaction_id.clone().expect("linked transaction");
    let tx = h.store.transaction(&tx_id).await.unwrap().unwrap();
    assert_eq!(tx.status, CrossChainTxStatus::Failed);
    assert_eq!(tx.steps.len(), 1);
    assert!(tx.steps[0].error.as_deref().unwrap().contains("No bridge route"));
    assert!(timeline_contains(&deal, "Bridge route unavailable"));
}

#[tokio::test]
async fn create_rejects_bad_input() {
    let h = harness();

    let mut zero = same_chain_request();
    zero.amount = 0.0;
    assert!(matches!(
        h.service.create(&buyer(), zero).await,
        Err(DealError::InvalidArgument(_))
    ));

    let mut same_wallets = same_chain_request();
    same_wallets.seller_wallet_address = BUYER_WALLET.to_string();
    assert!(matches!(
        h.service.create(&buyer(), same_wallets).await,
        Err(DealError::InvalidArgument(_))
    ));

    let mut unknown = same_chain_request();
    unknown.other_party_email = "nobody@example.com".to_string();
    assert!(matches!(
        h.service.create(&buyer(), unknown).await,
        Err(DealError::NotFound(_))
    ));

    let mut own_email = same_chain_request();
    own_email.other_party_email = "buyer@example.com".to_string();
    assert!(matches!(
        h.service.create(&buyer(), own_email).await,
        Err(DealError::InvalidArgument(_))
    ));

    let mut bad_condition = same_chain_request();
    bad_condition.initial_conditions.push(InitialCondition {
        id: String::new(),
        kind: "CUSTOM".to_string(),
        description: "x".to_string(),
    });
    assert!(matches!(
        h.service.create(&buyer(), bad_condition).await,
        Err(DealError::InvalidArgument(_))
    ));
}

// --------------------------------------------------------
//     Access control
// --------------------------------------------------------

#[tokio::test]
async fn non_participant_cannot_read_a_deal() {
    let h = harness();
    let deal = h.service.create(&buyer(), same_chain_request()).await.unwrap();
    assert!(matches!(
        h.service.get(&outsider(), &deal.id).await,
        Err(DealError::Forbidden(_))
    ));
    assert!(matches!(
        h.service.get(&buyer(), "missing").await,
        Err(DealError::NotFound(_))
    ));
}

#[tokio::test]
async fn list_returns_only_participant_deals_newest_first() {
    let h = harness();
    let first = h.service.create(&buyer(), same_chain_request()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = h.service.create(&buyer(), same_chain_request()).await.unwrap();

    let deals = h.service.list(&buyer(), Page::default()).await.unwrap();
    assert_eq!(deals.len(), 2);
    assert_eq!(deals[0].id, second.id);
    assert_eq!(deals[1].id, first.id);

    let none = h.service.list(&outsider(), Page::default()).await.unwrap();
    assert!(none.is_empty());
}

// --------------------------------------------------------
//     Conditions
// --------------------------------------------------------

#[tokio::test]
async fn buyer_fulfills_a_condition() {
    let h = harness();
    let deal = h.service.create(&buyer(), same_chain_request()).await.unwrap();
    let updated = h
        .service
        .review_condition(
            &buyer(),
            "inspection",
            ReviewConditionRequest {
                deal_id: deal.id.clone(),
                status: ConditionStatus::FulfilledByBuyer,
                notes: Some("inspection report attached".to_string()),
                cross_chain_tx_hash: None,
                cross_chain_step_number: None,
            },
        )
        .await
        .unwrap();

    let condition = updated.condition("inspection").unwrap();
    assert_eq!(condition.status, ConditionStatus::FulfilledByBuyer);
    assert_eq!(condition.notes.as_deref(), Some("inspection report attached"));
    assert!(timeline_contains(&updated, "Condition 'inspection' fulfilled by buyer"));
}

#[tokio::test]
async fn only_the_buyer_reviews_conditions() {
    let h = harness();
    let deal = h.service.create(&buyer(), same_chain_request()).await.unwrap();
    let err = h
        .service
        .review_condition(
            &seller(),
            "inspection",
            ReviewConditionRequest {
                deal_id: deal.id.clone(),
                status: ConditionStatus::FulfilledByBuyer,
                notes: None,
                cross_chain_tx_hash: None,
                cross_chain_step_number: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DealError::Forbidden(_)));
}

#[tokio::test]
async fn fulfilled_condition_only_reverts_through_dispute() {
    let h = harness();
    let deal = h.service.create(&buyer(), same_chain_request()).await.unwrap();
    h.service
        .review_condition(
            &buyer(),
            "inspection",
            ReviewConditionRequest {
                deal_id: deal.id.clone(),
                status: ConditionStatus::FulfilledByBuyer,
                notes: None,
                cross_chain_tx_hash: None,
                cross_chain_step_number: None,
            },
        )
        .await
        .unwrap();

    let err = h
        .service
        .review_condition(
            &buyer(),
            "inspection",
            ReviewConditionRequest {
                deal_id: deal.id.clone(),
                status: ConditionStatus::ActionWithdrawnByBuyer,
                notes: None,
                cross_chain_tx_hash: None,
                cross_chain_step_number: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DealError::Conflict(_)));
}

// --------------------------------------------------------
//     Cross-chain step execution
// --------------------------------------------------------

#[tokio::test]
async fn step_execution_auto_fulfills_mapped_condition() {
    let h = harness();
    let deal = h.service.create(&buyer(), cross_chain_request()).await.unwrap();
    let tx_id = deal.cross_chain_transaction_id.clone().unwrap();

    let txn = h
        .engine
        .execute_step(&tx_id, 1, Some("0xabc123".to_string()))
        .await
        .unwrap();

    let tx = txn.cross_chain.as_ref().unwrap();
    let step1 = tx.step(1).unwrap();
    assert_eq!(step1.status, StepStatus::Completed);
    assert_eq!(step1.tx_hash.as_deref(), Some("0xabc123"));
    assert!(step1.execution_id.is_some());
    assert_eq!(tx.step(2).unwrap().status, StepStatus::InProgress);

    let condition = txn.deal.condition(COND_FUNDS_LOCKED).unwrap();
    assert_eq!(condition.status, ConditionStatus::FulfilledByBuyer);
    assert_eq!(condition.auto_fulfilled_by.as_deref(), Some(CROSS_CHAIN_SYSTEM));
    assert_eq!(condition.cross_chain_tx_hash.as_deref(), Some("0xabc123"));
    assert!(timeline_contains(
        &txn.deal,
        "auto-fulfilled by the cross-chain system"
    ));
}

#[tokio::test]
async fn monitor_done_completes_remaining_steps_and_conditions() {
    let h = harness();
    let deal = h.service.create(&buyer(), cross_chain_request()).await.unwrap();
    let tx_id = deal.cross_chain_transaction_id.clone().unwrap();

    h.engine
        .execute_step(&tx_id, 1, Some("0xabc123".to_string()))
        .await
        .unwrap();
    h.router.queue_status(BridgeStatusUpdate {
        status: BridgeTransferStatus::Done,
        substatus: Some("COMPLETED".to_string()),
        source_tx_hash: Some("0xabc123".to_string()),
        target_tx_hash: Some("0xtarget".to_string()),
    });

    let txn = h.engine.execute_step(&tx_id, 2, None).await.unwrap();
    let tx = txn.cross_chain.as_ref().unwrap();
    assert_eq!(tx.status, CrossChainTxStatus::Completed);
    assert_eq!(tx.step(2).unwrap().status, StepStatus::Completed);
    assert_eq!(tx.step(3).unwrap().status, StepStatus::Completed);
    assert_eq!(tx.step(2).unwrap().tx_hash.as_deref(), Some("0xtarget"));

    for id in [COND_BRIDGE_TRANSFER, COND_BRIDGE_SETUP, COND_NETWORK_VALIDATION] {
        let condition = txn.deal.condition(id).unwrap();
        assert_eq!(
            condition.status,
            ConditionStatus::FulfilledByBuyer,
            "condition {id} should be auto-fulfilled"
        );
    }
    assert!(timeline_contains(&txn.deal, "Cross-chain transaction completed"));
}

#[tokio::test]
async fn monitor_pending_only_records_the_status_check() {
    let h = harness();
    let deal = h.service.create(&buyer(), cross_chain_request()).await.unwrap();
    let tx_id = deal.cross_chain_transaction_id.clone().unwrap();

    h.engine
        .execute_step(&tx_id, 1, Some("0xabc123".to_string()))
        .await
        .unwrap();
    // Mock router reports Pending by default.
    let txn = h.engine.execute_step(&tx_id, 2, None).await.unwrap();
    let tx = txn.cross_chain.as_ref().unwrap();
    assert_eq!(tx.step(2).unwrap().status, StepStatus::InProgress);
    assert!(tx.last_status_check.is_some());
    let condition = txn.deal.condition(COND_BRIDGE_TRANSFER).unwrap();
    assert_eq!(condition.status, ConditionStatus::PendingBuyerAction);
}

#[tokio::test]
async fn settled_steps_are_idempotent() {
    let h = harness();
    let deal = h.service.create(&buyer(), cross_chain_request()).await.unwrap();
    let tx_id = deal.cross_chain_transaction_id.clone().unwrap();

    h.engine
        .execute_step(&tx_id, 1, Some("0xabc123".to_string()))
        .await
        .unwrap();
    let before = h.store.deal(&deal.id).await.unwrap().unwrap();

    let txn = h
        .engine
        .execute_step(&tx_id, 1, Some("0xother".to_string()))
        .await
        .unwrap();
    let tx = txn.cross_chain.as_ref().unwrap();
    assert_eq!(tx.step(1).unwrap().tx_hash.as_deref(), Some("0xabc123"));
    assert_eq!(h.router.executed().len(), 1, "bridge executed exactly once");
    let after = h.store.deal(&deal.id).await.unwrap().unwrap();
    assert_eq!(before.timeline.len(), after.timeline.len());
}

#[tokio::test]
async fn missing_transaction_and_step_are_reported() {
    let h = harness();
    assert!(matches!(
        h.engine.execute_step("missing", 1, None).await,
        Err(DealError::NotFound(_))
    ));

    let deal = h.service.create(&buyer(), cross_chain_request()).await.unwrap();
    let tx_id = deal.cross_chain_transaction_id.clone().unwrap();
    assert!(matches!(
        h.engine.execute_step(&tx_id, 9, None).await,
        Err(DealError::NotFound(_))
    ));
}

#[tokio::test]
async fn transfer_is_gated_on_user_conditions() {
    let h = harness();
    let deal = h.service.create(&buyer(), cross_chain_request()).await.unwrap();

    let err = h
        .service
        .cross_chain_transfer(
            &buyer(),
            &deal.id,
            TransferRequest {
                tx_hash: "0xlock".to_string(),
                bridge_tx_hash: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DealError::Conflict(_)));

    h.service
        .review_condition(
            &buyer(),
            "inspection",
            ReviewConditionRequest {
                deal_id: deal.id.clone(),
                status: ConditionStatus::FulfilledByBuyer,
                notes: None,
                cross_chain_tx_hash: None,
                cross_chain_step_number: None,
            },
        )
        .await
        .unwrap();

    let status = h
        .service
        .cross_chain_transfer(
            &buyer(),
            &deal.id,
            TransferRequest {
                tx_hash: "0xlock".to_string(),
                bridge_tx_hash: None,
            },
        )
        .await
        .unwrap();
    let tx = status.transaction.unwrap();
    assert_eq!(tx.step(1).unwrap().status, StepStatus::Completed);
    assert_eq!(tx.step(1).unwrap().tx_hash.as_deref(), Some("0xlock"));
}

#[tokio::test]
async fn execute_step_endpoint_requires_participant() {
    let h = harness();
    let deal = h.service.create(&buyer(), cross_chain_request()).await.unwrap();
    let err = h
        .service
        .execute_cross_chain_step(
            &outsider(),
            &deal.id,
            ExecuteStepRequest {
                step_number: 1,
                tx_hash: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DealError::Forbidden(_)));
}

// --------------------------------------------------------
//     Status sync, final approval, dispute
// --------------------------------------------------------

#[tokio::test]
async fn sync_status_walks_the_graph_and_sets_flags() {
    let h = harness();
    let deal = h.service.create(&buyer(), same_chain_request()).await.unwrap();

    let deal = h
        .service
        .sync_status(
            &seller(),
            &deal.id,
            SyncStatusRequest {
                new_smart_contract_status: DealStatus::AwaitingConditionFulfillment,
                event_message: "Deal accepted by seller".to_string(),
                final_approval_deadline_iso: None,
                dispute_resolution_deadline_iso: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(deal.status, DealStatus::AwaitingConditionFulfillment);

    let deal = h
        .service
        .sync_status(
            &buyer(),
            &deal.id,
            SyncStatusRequest {
                new_smart_contract_status: DealStatus::InEscrow,
                event_message: "Funds deposited on chain".to_string(),
                final_approval_deadline_iso: None,
                dispute_resolution_deadline_iso: None,
            },
        )
        .await
        .unwrap();
    assert!(deal.funds_deposited_by_buyer);
    assert_eq!(deal.status, DealStatus::InEscrow);
}

#[tokio::test]
async fn sync_status_same_status_is_a_noop_with_timeline_entry() {
    let h = harness();
    let deal = h.service.create(&buyer(), same_chain_request()).await.unwrap();
    let before = deal.timeline.len();

    let deal = h
        .service
        .sync_status(
            &buyer(),
            &deal.id,
            SyncStatusRequest {
                new_smart_contract_status: DealStatus::PendingSellerReview,
                event_message: "Observed unchanged state".to_string(),
                final_approval_deadline_iso: None,
                dispute_resolution_deadline_iso: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(deal.status, DealStatus::PendingSellerReview);
    assert_eq!(deal.timeline.len(), before + 1);
}

#[tokio::test]
async fn sync_status_rejects_invalid_edges_and_past_deadlines() {
    let h = harness();
    let deal = h.service.create(&buyer(), same_chain_request()).await.unwrap();

    let err = h
        .service
        .sync_status(
            &buyer(),
            &deal.id,
            SyncStatusRequest {
                new_smart_contract_status: DealStatus::Completed,
                event_message: "nope".to_string(),
                final_approval_deadline_iso: None,
                dispute_resolution_deadline_iso: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DealError::InvalidTransition(_)));

    let err = h
        .service
        .sync_status(
            &buyer(),
            &deal.id,
            SyncStatusRequest {
                new_smart_contract_status: DealStatus::AwaitingConditionFulfillment,
                event_message: "accepted".to_string(),
                final_approval_deadline_iso: Some(Utc::now() - Duration::minutes(1)),
                dispute_resolution_deadline_iso: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DealError::InvalidArgument(_)));
}

#[tokio::test]
async fn final_approval_requires_buyer_and_future_deadline() {
    let h = harness();
    let mut deal = seeded_deal(DealStatus::ReadyForFinalApproval);
    deal.is_cross_chain = false;
    h.store.create_deal(&deal).await.unwrap();

    let err = h
        .service
        .start_final_approval(
            &buyer(),
            &deal.id,
            StartFinalApprovalRequest {
                final_approval_deadline_iso: Utc::now() - Duration::minutes(1),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DealError::InvalidArgument(_)));

    let err = h
        .service
        .start_final_approval(
            &seller(),
            &deal.id,
            StartFinalApprovalRequest {
                final_approval_deadline_iso: Utc::now() + Duration::hours(24),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DealError::Forbidden(_)));

    let deal = h
        .service
        .start_final_approval(
            &buyer(),
            &deal.id,
            StartFinalApprovalRequest {
                final_approval_deadline_iso: Utc::now() + Duration::hours(24),
            },
        )
        .await
        .unwrap();
    assert_eq!(deal.status, DealStatus::InFinalApproval);
    assert!(deal.final_approval_deadline.is_some());
}

#[tokio::test]
async fn final_approval_requires_fulfilled_conditions() {
    let h = harness();
    let mut deal = seeded_deal(DealStatus::ReadyForFinalApproval);
    deal.conditions = vec![Condition::new(
        "inspection",
        ConditionKind::Inspection,
        "inspect",
    )];
    h.store.create_deal(&deal).await.unwrap();

    let err = h
        .service
        .start_final_approval(
            &buyer(),
            &deal.id,
            StartFinalApprovalRequest {
                final_approval_deadline_iso: Utc::now() + Duration::hours(24),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DealError::Conflict(_)));
    let unchanged = h.store.deal(&deal.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, DealStatus::ReadyForFinalApproval);
    assert!(unchanged.final_approval_deadline.is_none());
}

#[tokio::test]
async fn final_approval_requires_deposited_funds() {
    let h = harness();
    let mut deal = seeded_deal(DealStatus::ReadyForFinalApproval);
    deal.funds_deposited_by_buyer = false;
    h.store.create_deal(&deal).await.unwrap();

    let err = h
        .service
        .start_final_approval(
            &buyer(),
            &deal.id,
            StartFinalApprovalRequest {
                final_approval_deadline_iso: Utc::now() + Duration::hours(24),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DealError::Conflict(_)));
    let unchanged = h.store.deal(&deal.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, DealStatus::ReadyForFinalApproval);
}

#[tokio::test]
async fn only_the_buyer_raises_disputes() {
    let h = harness();
    let mut deal = seeded_deal(DealStatus::InFinalApproval);
    deal.final_approval_deadline = Some(Utc::now() + Duration::hours(1));
    h.store.create_deal(&deal).await.unwrap();

    let err = h
        .service
        .raise_dispute(
            &seller(),
            &deal.id,
            RaiseDisputeRequest {
                dispute_resolution_deadline_iso: Utc::now() + Duration::hours(24),
                condition_id: None,
            },
        )
        .await
        .unwrap_err();
    match err {
        DealError::Forbidden(msg) => {
            assert_eq!(msg, "Only the buyer can raise a dispute via this sync endpoint.")
        }
        other => panic!("expected Forbidden, got {other:?}"),
    }
    let unchanged = h.store.deal(&deal.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, DealStatus::InFinalApproval);
}

#[tokio::test]
async fn dispute_withdraws_the_named_fulfilled_condition() {
    let h = harness();
    let mut deal = seeded_deal(DealStatus::InFinalApproval);
    let mut condition = Condition::new("inspection", ConditionKind::Inspection, "inspect");
    condition.status = ConditionStatus::FulfilledByBuyer;
    deal.conditions = vec![condition];
    h.store.create_deal(&deal).await.unwrap();

    let deal = h
        .service
        .raise_dispute(
            &buyer(),
            &deal.id,
            RaiseDisputeRequest {
                dispute_resolution_deadline_iso: Utc::now() + Duration::hours(24),
                condition_id: Some("inspection".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(deal.status, DealStatus::InDispute);
    assert!(deal.dispute_resolution_deadline.is_some());
    assert_eq!(
        deal.condition("inspection").unwrap().status,
        ConditionStatus::ActionWithdrawnByBuyer
    );

    let err = h
        .service
        .raise_dispute(
            &buyer(),
            &deal.id,
            RaiseDisputeRequest {
                dispute_resolution_deadline_iso: Utc::now() + Duration::hours(24),
                condition_id: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DealError::Conflict(_)));
}

// --------------------------------------------------------
//     Scheduler
// --------------------------------------------------------

#[tokio::test]
async fn scheduler_releases_expired_final_approval() {
    let h = harness();
    let mut deal = seeded_deal(DealStatus::InFinalApproval);
    deal.final_approval_deadline = Some(Utc::now() - Duration::minutes(1));
    h.store.create_deal(&deal).await.unwrap();

    let chain = Arc::new(MockChain::ok());
    assert!(scheduler(&h, Some(chain.clone())).run_tick().await);

    assert_eq!(chain.calls(), vec![format!("release:{CONTRACT_ADDRESS}")]);
    let deal = h.store.deal(&deal.id).await.unwrap().unwrap();
    assert_eq!(deal.status, DealStatus::Completed);
    assert!(deal.funds_released_to_seller);
    assert!(timeline_contains(&deal, "Funds automatically released. Tx: 0xrelease"));
}

#[tokio::test]
async fn scheduler_parks_deal_when_chain_is_unavailable() {
    let h = harness();
    let mut deal = seeded_deal(DealStatus::InFinalApproval);
    deal.final_approval_deadline = Some(Utc::now() - Duration::minutes(1));
    h.store.create_deal(&deal).await.unwrap();

    scheduler(&h, Some(Arc::new(MockChain::unavailable())))
        .run_tick()
        .await;

    let deal = h.store.deal(&deal.id).await.unwrap().unwrap();
    assert_eq!(deal.status, DealStatus::AutoReleaseFailed);
    assert!(deal.processing_error.as_deref().unwrap().contains("rpc unreachable"));
    assert!(timeline_contains(&deal, "Automatic funds release failed"));
    assert!(!deal.funds_released_to_seller);
}

#[tokio::test]
async fn scheduler_skips_deals_without_contract() {
    let h = harness();
    let mut deal = seeded_deal(DealStatus::InFinalApproval);
    deal.smart_contract_address = None;
    deal.final_approval_deadline = Some(Utc::now() - Duration::minutes(1));
    h.store.create_deal(&deal).await.unwrap();

    let chain = Arc::new(MockChain::ok());
    scheduler(&h, Some(chain.clone())).run_tick().await;

    assert!(chain.calls().is_empty());
    let deal = h.store.deal(&deal.id).await.unwrap().unwrap();
    assert_eq!(deal.status, DealStatus::InFinalApproval);
}

#[tokio::test]
async fn scheduler_cancels_expired_disputes() {
    let h = harness();
    let mut deal = seeded_deal(DealStatus::InDispute);
    deal.dispute_resolution_deadline = Some(Utc::now() - Duration::minutes(1));
    h.store.create_deal(&deal).await.unwrap();

    let chain = Arc::new(MockChain::ok());
    scheduler(&h, Some(chain.clone())).run_tick().await;

    assert_eq!(chain.calls(), vec![format!("cancel:{CONTRACT_ADDRESS}")]);
    let deal = h.store.deal(&deal.id).await.unwrap().unwrap();
    assert_eq!(deal.status, DealStatus::Cancelled);
    assert!(timeline_contains(&deal, "automatically cancelled"));
}

#[tokio::test]
async fn scheduler_cancels_cross_chain_dispute_without_chain_call() {
    let h = harness();
    let mut deal = seeded_deal(DealStatus::InDispute);
    deal.is_cross_chain = true;
    deal.seller_network = Network::Solana;
    deal.seller_wallet = SELLER_SOLANA_WALLET.to_string();
    deal.dispute_resolution_deadline = Some(Utc::now() - Duration::minutes(1));
    h.store.create_deal(&deal).await.unwrap();

    let chain = Arc::new(MockChain::ok());
    scheduler(&h, Some(chain.clone())).run_tick().await;

    assert!(chain.calls().is_empty());
    let deal = h.store.deal(&deal.id).await.unwrap().unwrap();
    assert_eq!(deal.status, DealStatus::CrossChainCancelledAfterDisputeDeadline);
}

#[tokio::test]
async fn scheduler_releases_cross_chain_only_when_conditions_fulfilled() {
    let h = harness();

    let mut ready = seeded_deal(DealStatus::InFinalApproval);
    ready.is_cross_chain = true;
    ready.smart_contract_address = None;
    ready.final_approval_deadline = Some(Utc::now() - Duration::minutes(1));
    let mut fulfilled = Condition::new(COND_FUNDS_LOCKED, ConditionKind::CrossChain, "locked");
    fulfilled.status = ConditionStatus::FulfilledByBuyer;
    ready.conditions = vec![fulfilled];
    h.store.create_deal(&ready).await.unwrap();

    let mut blocked = seeded_deal(DealStatus::InFinalApproval);
    blocked.is_cross_chain = true;
    blocked.final_approval_deadline = Some(Utc::now() - Duration::minutes(1));
    blocked.conditions = vec![Condition::new(
        COND_FUNDS_LOCKED,
        ConditionKind::CrossChain,
        "locked",
    )];
    h.store.create_deal(&blocked).await.unwrap();

    scheduler(&h, Some(Arc::new(MockChain::ok()))).run_tick().await;

    let ready = h.store.deal(&ready.id).await.unwrap().unwrap();
    assert_eq!(ready.status, DealStatus::CrossChainFundsReleased);
    assert!(ready.funds_released_to_seller);

    let blocked = h.store.deal(&blocked.id).await.unwrap().unwrap();
    assert_eq!(blocked.status, DealStatus::InFinalApproval, "requires manual intervention");
}

#[tokio::test]
async fn scheduler_repolls_stale_transactions() {
    let h = harness();
    let deal = h.service.create(&buyer(), cross_chain_request()).await.unwrap();
    let tx_id = deal.cross_chain_transaction_id.clone().unwrap();
    h.engine
        .execute_step(&tx_id, 1, Some("0xabc123".to_string()))
        .await
        .unwrap();

    h.router.queue_status(BridgeStatusUpdate {
        status: BridgeTransferStatus::Done,
        substatus: None,
        source_tx_hash: Some("0xabc123".to_string()),
        target_tx_hash: Some("0xtarget".to_string()),
    });

    scheduler(&h, None).run_tick().await;

    let tx = h.store.transaction(&tx_id).await.unwrap().unwrap();
    assert_eq!(tx.status, CrossChainTxStatus::Completed);
}

#[tokio::test]
async fn scheduler_marks_inactive_cross_chain_deals_stuck() {
    let h = harness();
    let mut deal = seeded_deal(DealStatus::AwaitingConditionFulfillment);
    deal.is_cross_chain = true;
    deal.updated_at = Utc::now() - Duration::hours(3);

    let now = Utc::now();
    let tx = CrossChainTransaction {
        id: "tx-stuck".to_string(),
        deal_id: deal.id.clone(),
        from_address: BUYER_WALLET.to_string(),
        to_address: SELLER_SOLANA_WALLET.to_string(),
        amount: deal.amount,
        source_network: Network::Ethereum,
        target_network: Network::Solana,
        bridge_info: None,
        steps: vec![Step::new(1, StepAction::InitiateBridge, "init", None)],
        status: CrossChainTxStatus::InProgress,
        last_status_check: Some(now),
        created_at: now,
        updated_at: now,
    };
    deal.cross_chain_transaction_id = Some(tx.id.clone());
    h.store.create_deal(&deal).await.unwrap();
    h.store.create_transaction(&tx).await.unwrap();

    scheduler(&h, None).run_tick().await;

    let deal = h.store.deal(&deal.id).await.unwrap().unwrap();
    assert_eq!(deal.status, DealStatus::CrossChainStuck);
    assert!(timeline_contains(&deal, "requires manual action"));
    let tx = h.store.transaction("tx-stuck").await.unwrap().unwrap();
    assert_eq!(tx.status, CrossChainTxStatus::Stuck);
}

// --------------------------------------------------------
//     Fee estimation
// --------------------------------------------------------

#[tokio::test]
async fn fee_estimation_uses_the_planned_route() {
    let h = harness();
    let estimate = h
        .engine
        .estimate_fees(
            Network::Ethereum,
            Network::Solana,
            U256::from(1_000_000_000_000_000_000u128),
        )
        .await;
    assert!(!estimate.fallback_mode);
    assert_eq!(estimate.confidence, "high");
    assert_eq!(estimate.bridge.as_deref(), Some("wormhole"));
}

#[tokio::test]
async fn fee_estimation_degrades_when_router_unreachable() {
    let h = harness_with(MockBridgeRouter::unreachable(), None);
    let estimate = h
        .engine
        .estimate_fees(
            Network::Ethereum,
            Network::Solana,
            U256::from(1_000_000_000_000_000_000u128),
        )
        .await;
    assert!(estimate.fallback_mode);
    assert_eq!(estimate.confidence, "low");
    assert!(estimate.fee_usd >= 3.0);
}

// --------------------------------------------------------
//     Invariants across flows
// --------------------------------------------------------

#[tokio::test]
async fn timeline_only_ever_grows() {
    let h = harness();
    let deal = h.service.create(&buyer(), cross_chain_request()).await.unwrap();
    let mut seen = deal.timeline.len();
    let tx_id = deal.cross_chain_transaction_id.clone().unwrap();

    h.engine
        .execute_step(&tx_id, 1, Some("0xabc123".to_string()))
        .await
        .unwrap();
    let after_step = h.store.deal(&deal.id).await.unwrap().unwrap();
    assert!(after_step.timeline.len() >= seen);
    assert_eq!(
        after_step.timeline[..seen]
            .iter()
            .map(|e| e.event.clone())
            .collect::<Vec<_>>(),
        deal.timeline.iter().map(|e| e.event.clone()).collect::<Vec<_>>(),
        "earlier timeline is a prefix of the later one"
    );
    seen = after_step.timeline.len();

    h.service
        .sync_status(
            &buyer(),
            &deal.id,
            SyncStatusRequest {
                new_smart_contract_status: DealStatus::AwaitingConditionFulfillment,
                event_message: "Deal accepted".to_string(),
                final_approval_deadline_iso: None,
                dispute_resolution_deadline_iso: None,
            },
        )
        .await
        .unwrap();
    let after_sync = h.store.deal(&deal.id).await.unwrap().unwrap();
    assert!(after_sync.timeline.len() > seen);
}

#[tokio::test]
async fn funds_released_implies_terminal_completion() {
    let h = harness();
    let mut deal = seeded_deal(DealStatus::InFinalApproval);
    deal.final_approval_deadline = Some(Utc::now() - Duration::minutes(1));
    h.store.create_deal(&deal).await.unwrap();

    scheduler(&h, Some(Arc::new(MockChain::ok()))).run_tick().await;

    let deal = h.store.deal(&deal.id).await.unwrap().unwrap();
    assert!(deal.funds_released_to_seller);
    assert!(matches!(
        deal.status,
        DealStatus::Completed | DealStatus::CrossChainFundsReleased
    ));
}
