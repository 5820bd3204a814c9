use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::DealError;
use crate::model::{CrossChainTransaction, CrossChainTxStatus, Deal, DealStatus};
use crate::store::{DealMutation, DealStore, DealTxn, Page};

/// In-memory [`DealStore`]. A single mutex serializes mutations, which gives
/// the same per-document visibility guarantees as the Postgres store. Used
/// by tests and offline runs.
#[derive(Default)]
pub struct MemoryDealStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    deals: HashMap<String, Deal>,
    transactions: HashMap<String, CrossChainTransaction>,
}

impl MemoryDealStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DealStore for MemoryDealStore {
    async fn create_deal(&self, deal: &Deal) -> Result<(), DealError> {
        let mut inner = self.inner.lock().await;
        if inner.deals.contains_key(&deal.id) {
            return Err(DealError::Conflict(format!(
                "Deal {} already exists.",
                deal.id
            )));
        }
        inner.deals.insert(deal.id.clone(), deal.clone());
        Ok(())
    }

    async fn create_transaction(&self, tx: &CrossChainTransaction) -> Result<(), DealError> {
        let mut inner = self.inner.lock().await;
        if inner.transactions.contains_key(&tx.id) {
            return Err(DealError::Conflict(format!(
                "Cross-chain transaction {} already exists.",
                tx.id
            )));
        }
        inner.transactions.insert(tx.id.clone(), tx.clone());
        Ok(())
    }

    async fn deal(&self, deal_id: &str) -> Result<Option<Deal>, DealError> {
        Ok(self.inner.lock().await.deals.get(deal_id).cloned())
    }

    async fn transaction(
        &self,
        tx_id: &str,
    ) -> Result<Option<CrossChainTransaction>, DealError> {
        Ok(self.inner.lock().await.transactions.get(tx_id).cloned())
    }

    async fn transaction_for_deal(
        &self,
        deal_id: &str,
    ) -> Result<Option<CrossChainTransaction>, DealError> {
        Ok(self
            .inner
            .lock()
            .await
            .transactions
            .values()
            .find(|tx| tx.deal_id == deal_id)
            .cloned())
    }

    async fn deals_for_participant(
        &self,
        principal_id: &str,
        page: Page,
    ) -> Result<Vec<Deal>, DealError> {
        let inner = self.inner.lock().await;
        let mut deals: Vec<Deal> = inner
            .deals
            .values()
            .filter(|d| d.is_participant(principal_id))
            .cloned()
            .collect();
        deals.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(deals
            .into_iter()
            .skip(page.offset.max(0) as usize)
            .take(page.limit.max(0) as usize)
            .collect())
    }

    async fn transact(
        &self,
        deal_id: &str,
        mutation: DealMutation,
    ) -> Result<DealTxn, DealError> {
        let mut inner = self.inner.lock().await;
        let deal = inner
            .deals
            .get(deal_id)
            .cloned()
            .ok_or_else(|| DealError::NotFound(format!("Deal {deal_id} not found.")))?;
        let cross_chain = deal
            .cross_chain_transaction_id
            .as_ref()
            .and_then(|id| inner.transactions.get(id).cloned());

        let mut txn = DealTxn { deal, cross_chain };
        let deal_before = serde_json::to_value(&txn.deal)
            .map_err(|e| DealError::Internal(e.into()))?;
        let tx_before = serde_json::to_value(&txn.cross_chain)
            .map_err(|e| DealError::Internal(e.into()))?;

        mutation(&mut txn)?;

        let deal_after = serde_json::to_value(&txn.deal)
            .map_err(|e| DealError::Internal(e.into()))?;
        if deal_after != deal_before {
            txn.deal.updated_at = Utc::now();
            inner.deals.insert(txn.deal.id.clone(), txn.deal.clone());
        }
        if let Some(tx) = txn.cross_chain.as_mut() {
            let tx_after =
                serde_json::to_value(&*tx).map_err(|e| DealError::Internal(e.into()))?;
            if tx_after != tx_before {
                tx.updated_at = Utc::now();
                inner.transactions.insert(tx.id.clone(), tx.clone());
            }
        }
        Ok(txn)
    }

    async fn transact_cross_chain(
        &self,
        tx_id: &str,
        mutation: DealMutation,
    ) -> Result<DealTxn, DealError> {
        let deal_id = {
            let inner = self.inner.lock().await;
            inner
                .transactions
                .get(tx_id)
                .map(|tx| tx.deal_id.clone())
                .ok_or_else(|| {
                    DealError::NotFound(format!("Cross-chain transaction {tx_id} not found."))
                })?
        };
        self.transact(&deal_id, mutation).await
    }

    async fn deals_past_final_approval(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Deal>, DealError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .deals
            .values()
            .filter(|d| {
                d.status == DealStatus::InFinalApproval
                    && !d.is_cross_chain
                    && d.final_approval_deadline.is_some_and(|t| t < now)
            })
            .cloned()
            .collect())
    }

    async fn deals_past_dispute_deadline(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Deal>, DealError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .deals
            .values()
            .filter(|d| {
                d.status == DealStatus::InDispute
                    && d.dispute_resolution_deadline.is_some_and(|t| t < now)
            })
            .cloned()
            .collect())
    }

    async fn cross_chain_deals_past_final_approval(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Deal>, DealError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .deals
            .values()
            .filter(|d| {
                d.status == DealStatus::InFinalApproval
                    && d.is_cross_chain
                    && d.final_approval_deadline.is_some_and(|t| t < now)
            })
            .cloned()
            .collect())
    }

    async fn transactions_pending_status_check(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<CrossChainTransaction>, DealError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transactions
            .values()
            .filter(|tx| {
                matches!(
                    tx.status,
                    CrossChainTxStatus::Prepared | CrossChainTxStatus::InProgress
                ) && tx.last_status_check.map_or(true, |t| t < older_than)
            })
            .cloned()
            .collect())
    }

    async fn cross_chain_deals_stuck(
        &self,
        not_updated_since: DateTime<Utc>,
    ) -> Result<Vec<Deal>, DealError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .deals
            .values()
            .filter(|d| {
                d.is_cross_chain
                    && !d.status.is_terminal()
                    && d.status != DealStatus::CrossChainStuck
                    && d.updated_at < not_updated_since
            })
            .cloned()
            .collect())
    }
}
