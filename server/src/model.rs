use alloy::primitives::U256;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DealError;
use crate::networks::Network;

/// Condition ids the system appends to every cross-chain deal. The engine
/// auto-fulfills them as bridge steps progress.
pub const COND_NETWORK_VALIDATION: &str = "cross_chain_network_validation";
pub const COND_BRIDGE_SETUP: &str = "cross_chain_bridge_setup";
pub const COND_FUNDS_LOCKED: &str = "cross_chain_funds_locked";
pub const COND_BRIDGE_TRANSFER: &str = "cross_chain_bridge_transfer";

/// Actor recorded on conditions fulfilled by the engine rather than the buyer.
pub const CROSS_CHAIN_SYSTEM: &str = "cross_chain_system";

/// Decimal amounts in requests are denominated in whole tokens; deals store
/// the smallest-unit integer.
pub const NATIVE_DECIMALS: u32 = 18;

pub mod serde_u256 {
    use alloy::primitives::U256;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<U256, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<U256>().map_err(serde::de::Error::custom)
    }
}

/// Converts a whole-token amount into smallest-unit integer form.
pub fn amount_to_base_units(amount: f64, decimals: u32) -> Result<U256, DealError> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(DealError::InvalidArgument(
            "Amount must be a positive finite number.".to_string(),
        ));
    }
    let scaled = (amount * 10f64.powi(decimals as i32)).round();
    if scaled >= u128::MAX as f64 {
        return Err(DealError::InvalidArgument(
            "Amount is too large.".to_string(),
        ));
    }
    Ok(U256::from(scaled as u128))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Party {
    #[serde(rename = "BUYER")]
    Buyer,
    #[serde(rename = "SELLER")]
    Seller,
}

impl Party {
    pub fn as_str(&self) -> &'static str {
        match self {
            Party::Buyer => "BUYER",
            Party::Seller => "SELLER",
        }
    }
}

impl TryFrom<&str> for Party {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "BUYER" => Ok(Party::Buyer),
            "SELLER" => Ok(Party::Seller),
            other => Err(anyhow::anyhow!("unknown party: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DealStatus {
    #[serde(rename = "PENDING_SELLER_REVIEW")]
    PendingSellerReview,
    #[serde(rename = "PENDING_BUYER_REVIEW")]
    PendingBuyerReview,
    #[serde(rename = "AWAITING_CONDITION_FULFILLMENT")]
    AwaitingConditionFulfillment,
    #[serde(rename = "AWAITING_DEPOSIT")]
    AwaitingDeposit,
    #[serde(rename = "IN_ESCROW")]
    InEscrow,
    #[serde(rename = "AWAITING_FULFILLMENT")]
    AwaitingFulfillment,
    #[serde(rename = "READY_FOR_FINAL_APPROVAL")]
    ReadyForFinalApproval,
    #[serde(rename = "IN_FINAL_APPROVAL")]
    InFinalApproval,
    #[serde(rename = "IN_DISPUTE")]
    InDispute,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
    #[serde(rename = "AutoReleaseFailed")]
    AutoReleaseFailed,
    #[serde(rename = "AutoCancellationFailed")]
    AutoCancellationFailed,
    #[serde(rename = "CrossChainFundsReleased")]
    CrossChainFundsReleased,
    #[serde(rename = "CrossChainCancelledAfterDisputeDeadline")]
    CrossChainCancelledAfterDisputeDeadline,
    #[serde(rename = "CrossChainStuck")]
    CrossChainStuck,
}

impl DealStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DealStatus::PendingSellerReview => "PENDING_SELLER_REVIEW",
            DealStatus::PendingBuyerReview => "PENDING_BUYER_REVIEW",
            DealStatus::AwaitingConditionFulfillment => "AWAITING_CONDITION_FULFILLMENT",
            DealStatus::AwaitingDeposit => "AWAITING_DEPOSIT",
            DealStatus::InEscrow => "IN_ESCROW",
            DealStatus::AwaitingFulfillment => "AWAITING_FULFILLMENT",
            DealStatus::ReadyForFinalApproval => "READY_FOR_FINAL_APPROVAL",
            DealStatus::InFinalApproval => "IN_FINAL_APPROVAL",
            DealStatus::InDispute => "IN_DISPUTE",
            DealStatus::Completed => "COMPLETED",
            DealStatus::Cancelled => "CANCELLED",
            DealStatus::AutoReleaseFailed => "AutoReleaseFailed",
            DealStatus::AutoCancellationFailed => "AutoCancellationFailed",
            DealStatus::CrossChainFundsReleased => "CrossChainFundsReleased",
            DealStatus::CrossChainCancelledAfterDisputeDeadline => {
                "CrossChainCancelledAfterDisputeDeadline"
            }
            DealStatus::CrossChainStuck => "CrossChainStuck",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DealStatus::Completed
                | DealStatus::Cancelled
                | DealStatus::CrossChainFundsReleased
                | DealStatus::CrossChainCancelledAfterDisputeDeadline
        )
    }

    /// The directed edges of the deal lifecycle. Anything not listed here is
    /// an invalid transition. Edges into `InFinalApproval` additionally
    /// require all conditions fulfilled and funds deposited; that business
    /// precondition lives in the deal operations, not in this graph.
    pub fn allowed_transitions(&self) -> &'static [DealStatus] {
        use DealStatus::*;
        match self {
            PendingSellerReview | PendingBuyerReview => {
                &[AwaitingConditionFulfillment, Cancelled]
            }
            AwaitingConditionFulfillment => &[
                AwaitingDeposit,
                InEscrow,
                AwaitingFulfillment,
                ReadyForFinalApproval,
                InFinalApproval,
                InDispute,
                Cancelled,
                CrossChainStuck,
            ],
            AwaitingDeposit => &[
                InEscrow,
                AwaitingFulfillment,
                ReadyForFinalApproval,
                InFinalApproval,
                InDispute,
                Cancelled,
                CrossChainStuck,
            ],
            InEscrow => &[
                AwaitingFulfillment,
                ReadyForFinalApproval,
                InFinalApproval,
                InDispute,
                Cancelled,
                CrossChainStuck,
            ],
            AwaitingFulfillment => &[
                ReadyForFinalApproval,
                InFinalApproval,
                InDispute,
                Cancelled,
                CrossChainStuck,
            ],
            ReadyForFinalApproval => &[InFinalApproval, InDispute, Cancelled, CrossChainStuck],
            InFinalApproval => &[
                Completed,
                InDispute,
                AutoReleaseFailed,
                CrossChainFundsReleased,
                CrossChainStuck,
            ],
            InDispute => &[
                Completed,
                Cancelled,
                AutoCancellationFailed,
                CrossChainCancelledAfterDisputeDeadline,
                CrossChainStuck,
            ],
            AutoReleaseFailed => &[
                Completed,
                InDispute,
                CrossChainFundsReleased,
                CrossChainStuck,
            ],
            AutoCancellationFailed => &[
                Cancelled,
                CrossChainCancelledAfterDisputeDeadline,
                CrossChainStuck,
            ],
            CrossChainStuck => &[
                Completed,
                Cancelled,
                CrossChainFundsReleased,
                CrossChainCancelledAfterDisputeDeadline,
            ],
            Completed | Cancelled | CrossChainFundsReleased
            | CrossChainCancelledAfterDisputeDeadline => &[],
        }
    }

    pub fn can_transition_to(&self, to: DealStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }
}

impl TryFrom<&str> for DealStatus {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        use DealStatus::*;
        match value {
            "PENDING_SELLER_REVIEW" => Ok(PendingSellerReview),
            "PENDING_BUYER_REVIEW" => Ok(PendingBuyerReview),
            "AWAITING_CONDITION_FULFILLMENT" => Ok(AwaitingConditionFulfillment),
            "AWAITING_DEPOSIT" => Ok(AwaitingDeposit),
            "IN_ESCROW" => Ok(InEscrow),
            "AWAITING_FULFILLMENT" => Ok(AwaitingFulfillment),
            "READY_FOR_FINAL_APPROVAL" => Ok(ReadyForFinalApproval),
            "IN_FINAL_APPROVAL" => Ok(InFinalApproval),
            "IN_DISPUTE" => Ok(InDispute),
            "COMPLETED" => Ok(Completed),
            "CANCELLED" => Ok(Cancelled),
            "AutoReleaseFailed" => Ok(AutoReleaseFailed),
            "AutoCancellationFailed" => Ok(AutoCancellationFailed),
            "CrossChainFundsReleased" => Ok(CrossChainFundsReleased),
            "CrossChainCancelledAfterDisputeDeadline" => {
                Ok(CrossChainCancelledAfterDisputeDeadline)
            }
            "CrossChainStuck" => Ok(CrossChainStuck),
            other => Err(anyhow::anyhow!("unknown deal status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConditionKind {
    Custom,
    Inspection,
    CrossChain,
    Other(String),
}

impl From<String> for ConditionKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "CUSTOM" => ConditionKind::Custom,
            "INSPECTION" => ConditionKind::Inspection,
            "CROSS_CHAIN" => ConditionKind::CrossChain,
            _ => ConditionKind::Other(value),
        }
    }
}

impl From<ConditionKind> for String {
    fn from(value: ConditionKind) -> Self {
        match value {
            ConditionKind::Custom => "CUSTOM".to_string(),
            ConditionKind::Inspection => "INSPECTION".to_string(),
            ConditionKind::CrossChain => "CROSS_CHAIN".to_string(),
            ConditionKind::Other(tag) => tag,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    #[serde(rename = "PENDING_BUYER_ACTION")]
    PendingBuyerAction,
    #[serde(rename = "FULFILLED_BY_BUYER")]
    FulfilledByBuyer,
    #[serde(rename = "ACTION_WITHDRAWN_BY_BUYER")]
    ActionWithdrawnByBuyer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    pub description: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_fulfilled_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cross_chain_tx_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Condition {
    pub fn new(id: impl Into<String>, kind: ConditionKind, description: impl Into<String>) -> Self {
        Condition {
            id: id.into(),
            kind,
            description: description.into(),
            status: ConditionStatus::PendingBuyerAction,
            notes: None,
            auto_fulfilled_by: None,
            cross_chain_tx_hash: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub event: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_triggered: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
}

impl TimelineEvent {
    pub fn by(actor_id: impl Into<String>, event: impl Into<String>) -> Self {
        TimelineEvent {
            event: event.into(),
            at: Utc::now(),
            actor_id: Some(actor_id.into()),
            system_triggered: None,
            tx_hash: None,
        }
    }

    pub fn system(event: impl Into<String>) -> Self {
        TimelineEvent {
            event: event.into(),
            at: Utc::now(),
            actor_id: None,
            system_triggered: Some(true),
            tx_hash: None,
        }
    }

    pub fn with_tx_hash(mut self, tx_hash: impl Into<String>) -> Self {
        self.tx_hash = Some(tx_hash.into());
        self
    }
}

/// One escrow agreement between a buyer and a seller, optionally backed by a
/// per-deal smart contract and a cross-chain bridge transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deal {
    pub id: String,
    pub buyer_id: String,
    pub seller_id: String,
    pub buyer_wallet: String,
    pub seller_wallet: String,
    pub initiated_by: Party,
    pub property_address: String,
    #[serde(with = "serde_u256")]
    pub amount: U256,
    pub buyer_network: Network,
    pub seller_network: Network,
    pub is_cross_chain: bool,
    pub smart_contract_address: Option<String>,
    pub status: DealStatus,
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_approval_deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispute_resolution_deadline: Option<DateTime<Utc>>,
    pub funds_deposited_by_buyer: bool,
    pub funds_released_to_seller: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cross_chain_transaction_id: Option<String>,
    pub timeline: Vec<TimelineEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deal {
    pub fn is_participant(&self, principal_id: &str) -> bool {
        self.buyer_id == principal_id || self.seller_id == principal_id
    }

    pub fn is_buyer(&self, principal_id: &str) -> bool {
        self.buyer_id == principal_id
    }

    pub fn condition(&self, condition_id: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.id == condition_id)
    }

    pub fn condition_mut(&mut self, condition_id: &str) -> Option<&mut Condition> {
        self.conditions.iter_mut().find(|c| c.id == condition_id)
    }

    pub fn all_conditions_fulfilled(&self) -> bool {
        self.conditions
            .iter()
            .all(|c| c.status == ConditionStatus::FulfilledByBuyer)
    }

    pub fn cross_chain_conditions_fulfilled(&self) -> bool {
        self.conditions
            .iter()
            .filter(|c| c.kind == ConditionKind::CrossChain)
            .all(|c| c.status == ConditionStatus::FulfilledByBuyer)
    }

    /// Moves the deal along one lifecycle edge, recording the timeline event
    /// in the same mutation. Rejects edges not in the graph.
    pub fn transition_to(
        &mut self,
        to: DealStatus,
        event: TimelineEvent,
    ) -> Result<(), DealError> {
        if !self.status.can_transition_to(to) {
            return Err(DealError::InvalidTransition(format!(
                "Cannot transition deal from {} to {}.",
                self.status.as_str(),
                to.as_str()
            )));
        }
        self.status = to;
        if to == DealStatus::Completed || to == DealStatus::CrossChainFundsReleased {
            self.funds_released_to_seller = true;
        }
        self.timeline.push(event);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    InitiateBridge,
    MonitorBridge,
    ConfirmReceipt,
    DirectTransfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step: u32,
    pub action: StepAction,
    pub status: StepStatus,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_mapping: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(
        step: u32,
        action: StepAction,
        description: impl Into<String>,
        condition_mapping: Option<&str>,
    ) -> Self {
        Step {
            step,
            action,
            status: StepStatus::Pending,
            description: description.into(),
            condition_mapping: condition_mapping.map(str::to_string),
            tx_hash: None,
            execution_id: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.status, StepStatus::Completed | StepStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossChainTxStatus {
    Prepared,
    InProgress,
    Completed,
    Failed,
    Stuck,
}

impl CrossChainTxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrossChainTxStatus::Prepared => "prepared",
            CrossChainTxStatus::InProgress => "in_progress",
            CrossChainTxStatus::Completed => "completed",
            CrossChainTxStatus::Failed => "failed",
            CrossChainTxStatus::Stuck => "stuck",
        }
    }
}

impl TryFrom<&str> for CrossChainTxStatus {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "prepared" => Ok(CrossChainTxStatus::Prepared),
            "in_progress" => Ok(CrossChainTxStatus::InProgress),
            "completed" => Ok(CrossChainTxStatus::Completed),
            "failed" => Ok(CrossChainTxStatus::Failed),
            "stuck" => Ok(CrossChainTxStatus::Stuck),
            other => Err(anyhow::anyhow!("unknown cross-chain status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeInfo {
    pub bridge: String,
    pub estimated_time_secs: u64,
    pub fee_estimate_usd: f64,
    pub raw_route: serde_json::Value,
}

/// Bridge state for one deal: the planned route broken into steps, plus the
/// rolled-up status the scheduler polls on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossChainTransaction {
    pub id: String,
    pub deal_id: String,
    pub from_address: String,
    pub to_address: String,
    #[serde(with = "serde_u256")]
    pub amount: U256,
    pub source_network: Network,
    pub target_network: Network,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge_info: Option<BridgeInfo>,
    pub steps: Vec<Step>,
    pub status: CrossChainTxStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status_check: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CrossChainTransaction {
    pub fn step(&self, step_no: u32) -> Option<&Step> {
        self.steps.iter().find(|s| s.step == step_no)
    }

    pub fn step_mut(&mut self, step_no: u32) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.step == step_no)
    }

    /// Rolls the per-step statuses up into the transaction status: completed
    /// iff every step completed, failed if any step failed, in progress
    /// otherwise.
    pub fn recompute_status(&mut self) {
        if self
            .steps
            .iter()
            .all(|s| s.status == StepStatus::Completed)
        {
            self.status = CrossChainTxStatus::Completed;
        } else if self.steps.iter().any(|s| s.status == StepStatus::Failed) {
            self.status = CrossChainTxStatus::Failed;
        } else {
            self.status = CrossChainTxStatus::InProgress;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_deal() -> Deal {
        Deal {
            id: "deal-1".to_string(),
            buyer_id: "buyer-1".to_string(),
            seller_id: "seller-1".to_string(),
            buyer_wallet: "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string(),
            seller_wallet: "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".to_string(),
            initiated_by: Party::Buyer,
            property_address: "123 Main St".to_string(),
            amount: U256::from(1_500_000_000_000_000_000u128),
            buyer_network: Network::Ethereum,
            seller_network: Network::Ethereum,
            is_cross_chain: false,
            smart_contract_address: None,
            status: DealStatus::PendingSellerReview,
            conditions: vec![Condition::new(
                "inspection",
                ConditionKind::Inspection,
                "Property inspection",
            )],
            final_approval_deadline: None,
            dispute_resolution_deadline: None,
            funds_deposited_by_buyer: false,
            funds_released_to_seller: false,
            cross_chain_transaction_id: None,
            timeline: vec![TimelineEvent::by("buyer-1", "Deal created")],
            processing_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn transition_follows_graph_edges_only() {
        let mut deal = sample_deal();
        let err = deal
            .transition_to(DealStatus::Completed, TimelineEvent::system("nope"))
            .unwrap_err();
        assert!(matches!(err, DealError::InvalidTransition(_)));
        assert_eq!(deal.status, DealStatus::PendingSellerReview);

        deal.transition_to(
            DealStatus::AwaitingConditionFulfillment,
            TimelineEvent::by("seller-1", "Deal accepted"),
        )
        .unwrap();
        assert_eq!(deal.status, DealStatus::AwaitingConditionFulfillment);
    }

    #[test]
    fn every_transition_appends_a_timeline_event() {
        let mut deal = sample_deal();
        let before = deal.timeline.len();
        deal.transition_to(
            DealStatus::AwaitingConditionFulfillment,
            TimelineEvent::by("seller-1", "Deal accepted"),
        )
        .unwrap();
        assert_eq!(deal.timeline.len(), before + 1);
        assert_eq!(deal.timeline.last().unwrap().event, "Deal accepted");
    }

    #[test]
    fn completion_sets_funds_released() {
        let mut deal = sample_deal();
        deal.status = DealStatus::InFinalApproval;
        deal.transition_to(DealStatus::Completed, TimelineEvent::system("released"))
            .unwrap();
        assert!(deal.funds_released_to_seller);
        assert!(deal.status.is_terminal());
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for status in [
            DealStatus::Completed,
            DealStatus::Cancelled,
            DealStatus::CrossChainFundsReleased,
            DealStatus::CrossChainCancelledAfterDisputeDeadline,
        ] {
            assert!(status.is_terminal());
            assert!(status.allowed_transitions().is_empty());
        }
    }

    #[test]
    fn tx_status_rolls_up_from_steps() {
        let mut tx = CrossChainTransaction {
            id: "tx-1".to_string(),
            deal_id: "deal-1".to_string(),
            from_address: "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_string(),
            to_address: "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".to_string(),
            amount: U256::from(1u64),
            source_network: Network::Ethereum,
            target_network: Network::Solana,
            bridge_info: None,
            steps: vec![
                Step::new(1, StepAction::InitiateBridge, "init", Some(COND_FUNDS_LOCKED)),
                Step::new(2, StepAction::MonitorBridge, "mon", Some(COND_BRIDGE_TRANSFER)),
            ],
            status: CrossChainTxStatus::Prepared,
            last_status_check: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        tx.step_mut(1).unwrap().status = StepStatus::Completed;
        tx.recompute_status();
        assert_eq!(tx.status, CrossChainTxStatus::InProgress);

        tx.step_mut(2).unwrap().status = StepStatus::Completed;
        tx.recompute_status();
        assert_eq!(tx.status, CrossChainTxStatus::Completed);

        tx.step_mut(2).unwrap().status = StepStatus::Failed;
        tx.recompute_status();
        assert_eq!(tx.status, CrossChainTxStatus::Failed);
    }

    #[test]
    fn amount_conversion_rejects_bad_values() {
        assert!(amount_to_base_units(0.0, NATIVE_DECIMALS).is_err());
        assert!(amount_to_base_units(-1.0, NATIVE_DECIMALS).is_err());
        assert!(amount_to_base_units(f64::NAN, NATIVE_DECIMALS).is_err());
        assert!(amount_to_base_units(f64::INFINITY, NATIVE_DECIMALS).is_err());
        assert_eq!(
            amount_to_base_units(1.5, NATIVE_DECIMALS).unwrap(),
            U256::from(1_500_000_000_000_000_000u128)
        );
    }

    #[test]
    fn deal_status_round_trips_through_str() {
        for status in [
            DealStatus::PendingSellerReview,
            DealStatus::InFinalApproval,
            DealStatus::AutoReleaseFailed,
            DealStatus::CrossChainFundsReleased,
            DealStatus::CrossChainStuck,
        ] {
            assert_eq!(DealStatus::try_from(status.as_str()).unwrap(), status);
        }
    }
}
