use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DealError;
use crate::model::{CrossChainTransaction, Deal};

pub mod memory;
pub mod pg;

pub use memory::MemoryDealStore;
pub use pg::PgDealStore;

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Page {
            limit: 50,
            offset: 0,
        }
    }
}

/// The unit of atomic mutation: one deal plus, when the deal is cross-chain
/// and linked, its bridge transaction. Everything the mutator changes is
/// committed together or not at all.
pub struct DealTxn {
    pub deal: Deal,
    pub cross_chain: Option<CrossChainTransaction>,
}

impl DealTxn {
    /// The linked cross-chain transaction, or a conflict error when the deal
    /// has none.
    pub fn cross_chain_mut(&mut self) -> Result<&mut CrossChainTransaction, DealError> {
        self.cross_chain.as_mut().ok_or_else(|| {
            DealError::Conflict("Deal has no cross-chain transaction.".to_string())
        })
    }
}

pub type DealMutation = Box<dyn FnOnce(&mut DealTxn) -> Result<(), DealError> + Send>;

/// Persistent repository for deals and cross-chain transactions. Documents
/// are keyed by opaque ids; multi-field mutations go through [`transact`] /
/// [`transact_cross_chain`], which guarantee read-your-own-writes inside the
/// mutator and serializable visibility per document across callers.
///
/// [`transact`]: DealStore::transact
/// [`transact_cross_chain`]: DealStore::transact_cross_chain
#[async_trait]
pub trait DealStore: Send + Sync {
    async fn create_deal(&self, deal: &Deal) -> Result<(), DealError>;

    async fn create_transaction(&self, tx: &CrossChainTransaction) -> Result<(), DealError>;

    async fn deal(&self, deal_id: &str) -> Result<Option<Deal>, DealError>;

    async fn transaction(&self, tx_id: &str)
        -> Result<Option<CrossChainTransaction>, DealError>;

    async fn transaction_for_deal(
        &self,
        deal_id: &str,
    ) -> Result<Option<CrossChainTransaction>, DealError>;

    /// Deals where the principal is buyer or seller, newest first.
    async fn deals_for_participant(
        &self,
        principal_id: &str,
        page: Page,
    ) -> Result<Vec<Deal>, DealError>;

    /// Loads the deal (and its linked cross-chain transaction, if any), runs
    /// the mutation, and atomically commits whatever it changed. Returns the
    /// committed state.
    async fn transact(&self, deal_id: &str, mutation: DealMutation)
        -> Result<DealTxn, DealError>;

    /// Like [`DealStore::transact`], addressed by cross-chain transaction id.
    /// Fails with `NotFound` when the transaction does not exist.
    async fn transact_cross_chain(
        &self,
        tx_id: &str,
        mutation: DealMutation,
    ) -> Result<DealTxn, DealError>;

    /// Non-cross-chain deals in final approval whose deadline has elapsed.
    async fn deals_past_final_approval(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Deal>, DealError>;

    /// Deals in dispute whose resolution deadline has elapsed.
    async fn deals_past_dispute_deadline(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Deal>, DealError>;

    /// Cross-chain deals in final approval whose deadline has elapsed.
    async fn cross_chain_deals_past_final_approval(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Deal>, DealError>;

    /// Unsettled cross-chain transactions whose last status check is missing
    /// or older than the given instant.
    async fn transactions_pending_status_check(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<CrossChainTransaction>, DealError>;

    /// Non-terminal cross-chain deals not touched since the given instant
    /// and not already marked stuck.
    async fn cross_chain_deals_stuck(
        &self,
        not_updated_since: DateTime<Utc>,
    ) -> Result<Vec<Deal>, DealError>;
}
