use alloy::primitives::U256;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::error::DealError;
use crate::model::{BridgeInfo, CrossChainTransaction, CrossChainTxStatus, Deal, DealStatus, Party};
use crate::networks::Network;
use crate::store::{DealMutation, DealStore, DealTxn, Page};

const ACTIVE_CROSS_CHAIN_STATUSES: &str = "('prepared', 'in_progress')";
const INACTIVE_DEAL_STATUSES: &str =
    "('COMPLETED', 'CANCELLED', 'CrossChainFundsReleased', 'CrossChainCancelledAfterDisputeDeadline', 'CrossChainStuck')";

#[derive(Clone)]
pub struct PgDealStore {
    pool: PgPool,
}

impl PgDealStore {
    pub fn new(pool: PgPool) -> Self {
        PgDealStore { pool }
    }

    async fn fetch_deals(&self, query: &str, now: DateTime<Utc>) -> Result<Vec<Deal>, DealError> {
        let rows = sqlx::query(query)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .context("querying deals")?;
        rows.iter().map(deal_from_row).collect::<Result<_>>().map_err(DealError::from)
    }
}

#[async_trait]
impl DealStore for PgDealStore {
    async fn create_deal(&self, deal: &Deal) -> Result<(), DealError> {
        sqlx::query(
            "INSERT INTO deals
                (id, buyer_id, seller_id, buyer_wallet, seller_wallet, initiated_by,
                 property_address, amount, buyer_network, seller_network, is_cross_chain,
                 smart_contract_address, status, conditions, final_approval_deadline,
                 dispute_resolution_deadline, funds_deposited_by_buyer,
                 funds_released_to_seller, cross_chain_transaction_id, timeline,
                 processing_error, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                     $16, $17, $18, $19, $20, $21, $22, $23)",
        )
        .bind(&deal.id)
        .bind(&deal.buyer_id)
        .bind(&deal.seller_id)
        .bind(&deal.buyer_wallet)
        .bind(&deal.seller_wallet)
        .bind(deal.initiated_by.as_str())
        .bind(&deal.property_address)
        .bind(deal.amount.to_string())
        .bind(deal.buyer_network.as_str())
        .bind(deal.seller_network.as_str())
        .bind(deal.is_cross_chain)
        .bind(&deal.smart_contract_address)
        .bind(deal.status.as_str())
        .bind(serde_json::to_value(&deal.conditions).context("serializing conditions")?)
        .bind(deal.final_approval_deadline)
        .bind(deal.dispute_resolution_deadline)
        .bind(deal.funds_deposited_by_buyer)
        .bind(deal.funds_released_to_seller)
        .bind(&deal.cross_chain_transaction_id)
        .bind(serde_json::to_value(&deal.timeline).context("serializing timeline")?)
        .bind(&deal.processing_error)
        .bind(deal.created_at)
        .bind(deal.updated_at)
        .execute(&self.pool)
        .await
        .context("inserting deal")?;
        Ok(())
    }

    async fn create_transaction(&self, tx: &CrossChainTransaction) -> Result<(), DealError> {
        sqlx::query(
            "INSERT INTO cross_chain_transactions
                (id, deal_id, from_address, to_address, amount, source_network,
                 target_network, bridge_info, steps, status, last_status_check,
                 created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(&tx.id)
        .bind(&tx.deal_id)
        .bind(&tx.from_address)
        .bind(&tx.to_address)
        .bind(tx.amount.to_string())
        .bind(tx.source_network.as_str())
        .bind(tx.target_network.as_str())
        .bind(
            tx.bridge_info
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .context("serializing bridge info")?,
        )
        .bind(serde_json::to_value(&tx.steps).context("serializing steps")?)
        .bind(tx.status.as_str())
        .bind(tx.last_status_check)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .execute(&self.pool)
        .await
        .context("inserting cross-chain transaction")?;
        Ok(())
    }

    async fn deal(&self, deal_id: &str) -> Result<Option<Deal>, DealError> {
        let row = sqlx::query("SELECT * FROM deals WHERE id = $1")
            .bind(deal_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching deal")?;
        row.as_ref().map(deal_from_row).transpose().map_err(DealError::from)
    }

    async fn transaction(
        &self,
        tx_id: &str,
    ) -> Result<Option<CrossChainTransaction>, DealError> {
        let row = sqlx::query("SELECT * FROM cross_chain_transactions WHERE id = $1")
            .bind(tx_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching cross-chain transaction")?;
        row.as_ref().map(tx_from_row).transpose().map_err(DealError::from)
    }

    async fn transaction_for_deal(
        &self,
        deal_id: &str,
    ) -> Result<Option<CrossChainTransaction>, DealError> {
        let row = sqlx::query("SELECT * FROM cross_chain_transactions WHERE deal_id = $1")
            .bind(deal_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching cross-chain transaction for deal")?;
        row.as_ref().map(tx_from_row).transpose().map_err(DealError::from)
    }

    async fn deals_for_participant(
        &self,
        principal_id: &str,
        page: Page,
    ) -> Result<Vec<Deal>, DealError> {
        let rows = sqlx::query(
            "SELECT * FROM deals
             WHERE buyer_id = $1 OR seller_id = $1
             ORDER BY created_at DESC
             LIMIT $2 OFFSET $3",
        )
        .bind(principal_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await
        .context("listing deals for participant")?;
        rows.iter().map(deal_from_row).collect::<Result<_>>().map_err(DealError::from)
    }

    async fn transact(
        &self,
        deal_id: &str,
        mutation: DealMutation,
    ) -> Result<DealTxn, DealError> {
        let mut db_tx = self.pool.begin().await.context("starting transaction")?;

        let row = sqlx::query("SELECT * FROM deals WHERE id = $1 FOR UPDATE")
            .bind(deal_id)
            .fetch_optional(&mut *db_tx)
            .await
            .context("locking deal")?;
        let Some(row) = row else {
            return Err(DealError::NotFound(format!("Deal {deal_id} not found.")));
        };
        let deal = deal_from_row(&row)?;

        let cross_chain = match &deal.cross_chain_transaction_id {
            Some(tx_id) => {
                let row =
                    sqlx::query("SELECT * FROM cross_chain_transactions WHERE id = $1 FOR UPDATE")
                        .bind(tx_id)
                        .fetch_optional(&mut *db_tx)
                        .await
                        .context("locking cross-chain transaction")?;
                row.as_ref().map(tx_from_row).transpose()?
            }
            None => None,
        };

        let mut txn = DealTxn { deal, cross_chain };
        let deal_before = serde_json::to_value(&txn.deal).context("snapshotting deal")?;
        let tx_before =
            serde_json::to_value(&txn.cross_chain).context("snapshotting transaction")?;

        mutation(&mut txn)?;

        if serde_json::to_value(&txn.deal).context("serializing deal")? != deal_before {
            txn.deal.updated_at = Utc::now();
            write_deal(&mut db_tx, &txn.deal).await?;
        }
        if let Some(tx) = txn.cross_chain.as_mut() {
            if serde_json::to_value(&*tx).context("serializing transaction")? != tx_before {
                tx.updated_at = Utc::now();
                write_transaction(&mut db_tx, tx).await?;
            }
        }

        db_tx.commit().await.context("committing transaction")?;
        Ok(txn)
    }

    async fn transact_cross_chain(
        &self,
        tx_id: &str,
        mutation: DealMutation,
    ) -> Result<DealTxn, DealError> {
        // Resolve the owning deal first so locks are always taken in deal
        // then transaction order.
        let deal_id: Option<String> =
            sqlx::query_scalar("SELECT deal_id FROM cross_chain_transactions WHERE id = $1")
                .bind(tx_id)
                .fetch_optional(&self.pool)
                .await
                .context("resolving deal for cross-chain transaction")?;
        let Some(deal_id) = deal_id else {
            return Err(DealError::NotFound(format!(
                "Cross-chain transaction {tx_id} not found."
            )));
        };

        let txn = self.transact(&deal_id, mutation).await?;
        if txn.cross_chain.is_none() {
            return Err(DealError::NotFound(format!(
                "Cross-chain transaction {tx_id} not found."
            )));
        }
        Ok(txn)
    }

    async fn deals_past_final_approval(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Deal>, DealError> {
        self.fetch_deals(
            "SELECT * FROM deals
             WHERE status = 'IN_FINAL_APPROVAL'
               AND is_cross_chain = FALSE
               AND final_approval_deadline IS NOT NULL
               AND final_approval_deadline < $1
             ORDER BY final_approval_deadline ASC",
            now,
        )
        .await
    }

    async fn deals_past_dispute_deadline(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Deal>, DealError> {
        self.fetch_deals(
            "SELECT * FROM deals
             WHERE status = 'IN_DISPUTE'
               AND dispute_resolution_deadline IS NOT NULL
               AND dispute_resolution_deadline < $1
             ORDER BY dispute_resolution_deadline ASC",
            now,
        )
        .await
    }

    async fn cross_chain_deals_past_final_approval(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Deal>, DealError> {
        self.fetch_deals(
            "SELECT * FROM deals
             WHERE status = 'IN_FINAL_APPROVAL'
               AND is_cross_chain = TRUE
               AND final_approval_deadline IS NOT NULL
               AND final_approval_deadline < $1
             ORDER BY final_approval_deadline ASC",
            now,
        )
        .await
    }

    async fn transactions_pending_status_check(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<CrossChainTransaction>, DealError> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM cross_chain_transactions
             WHERE status IN {ACTIVE_CROSS_CHAIN_STATUSES}
               AND (last_status_check IS NULL OR last_status_check < $1)
             ORDER BY updated_at ASC"
        ))
        .bind(older_than)
        .fetch_all(&self.pool)
        .await
        .context("querying transactions pending status check")?;
        rows.iter().map(tx_from_row).collect::<Result<_>>().map_err(DealError::from)
    }

    async fn cross_chain_deals_stuck(
        &self,
        not_updated_since: DateTime<Utc>,
    ) -> Result<Vec<Deal>, DealError> {
        self.fetch_deals(
            &format!(
                "SELECT * FROM deals
                 WHERE is_cross_chain = TRUE
                   AND status NOT IN {INACTIVE_DEAL_STATUSES}
                   AND updated_at < $1
                 ORDER BY updated_at ASC"
            ),
            not_updated_since,
        )
        .await
    }
}

async fn write_deal(
    db_tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    deal: &Deal,
) -> Result<(), DealError> {
    sqlx::query(
        "UPDATE deals SET
            smart_contract_address = $2,
            status = $3,
            conditions = $4,
            final_approval_deadline = $5,
            dispute_resolution_deadline = $6,
            funds_deposited_by_buyer = $7,
            funds_released_to_seller = $8,
            cross_chain_transaction_id = $9,
            timeline = $10,
            processing_error = $11,
            updated_at = $12
         WHERE id = $1",
    )
    .bind(&deal.id)
    .bind(&deal.smart_contract_address)
    .bind(deal.status.as_str())
    .bind(serde_json::to_value(&deal.conditions).context("serializing conditions")?)
    .bind(deal.final_approval_deadline)
    .bind(deal.dispute_resolution_deadline)
    .bind(deal.funds_deposited_by_buyer)
    .bind(deal.funds_released_to_seller)
    .bind(&deal.cross_chain_transaction_id)
    .bind(serde_json::to_value(&deal.timeline).context("serializing timeline")?)
    .bind(&deal.processing_error)
    .bind(deal.updated_at)
    .execute(&mut **db_tx)
    .await
    .context("updating deal")?;
    Ok(())
}

async fn write_transaction(
    db_tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    tx: &CrossChainTransaction,
) -> Result<(), DealError> {
    sqlx::query(
        "UPDATE cross_chain_transactions SET
            bridge_info = $2,
            steps = $3,
            status = $4,
            last_status_check = $5,
            updated_at = $6
         WHERE id = $1",
    )
    .bind(&tx.id)
    .bind(
        tx.bridge_info
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .context("serializing bridge info")?,
    )
    .bind(serde_json::to_value(&tx.steps).context("serializing steps")?)
    .bind(tx.status.as_str())
    .bind(tx.last_status_check)
    .bind(tx.updated_at)
    .execute(&mut **db_tx)
    .await
    .context("updating cross-chain transaction")?;
    Ok(())
}

fn deal_from_row(row: &PgRow) -> Result<Deal> {
    let initiated_by: String = row.get("initiated_by");
    let status: String = row.get("status");
    let amount: String = row.get("amount");
    let buyer_network: String = row.get("buyer_network");
    let seller_network: String = row.get("seller_network");
    let conditions: serde_json::Value = row.get("conditions");
    let timeline: serde_json::Value = row.get("timeline");

    Ok(Deal {
        id: row.get("id"),
        buyer_id: row.get("buyer_id"),
        seller_id: row.get("seller_id"),
        buyer_wallet: row.get("buyer_wallet"),
        seller_wallet: row.get("seller_wallet"),
        initiated_by: Party::try_from(initiated_by.as_str())?,
        property_address: row.get("property_address"),
        amount: amount
            .parse::<U256>()
            .with_context(|| format!("stored amount is not an integer: {amount}"))?,
        buyer_network: buyer_network.parse::<Network>()?,
        seller_network: seller_network.parse::<Network>()?,
        is_cross_chain: row.get("is_cross_chain"),
        smart_contract_address: row.get("smart_contract_address"),
        status: DealStatus::try_from(status.as_str())?,
        conditions: serde_json::from_value(conditions).context("decoding conditions")?,
        final_approval_deadline: row.get("final_approval_deadline"),
        dispute_resolution_deadline: row.get("dispute_resolution_deadline"),
        funds_deposited_by_buyer: row.get("funds_deposited_by_buyer"),
        funds_released_to_seller: row.get("funds_released_to_seller"),
        cross_chain_transaction_id: row.get("cross_chain_transaction_id"),
        timeline: serde_json::from_value(timeline).context("decoding timeline")?,
        processing_error: row.get("processing_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn tx_from_row(row: &PgRow) -> Result<CrossChainTransaction> {
    let status: String = row.get("status");
    let amount: String = row.get("amount");
    let source_network: String = row.get("source_network");
    let target_network: String = row.get("target_network");
    let bridge_info: Option<serde_json::Value> = row.get("bridge_info");
    let steps: serde_json::Value = row.get("steps");

    Ok(CrossChainTransaction {
        id: row.get("id"),
        deal_id: row.get("deal_id"),
        from_address: row.get("from_address"),
        to_address: row.get("to_address"),
        amount: amount
            .parse::<U256>()
            .with_context(|| format!("stored amount is not an integer: {amount}"))?,
        source_network: source_network.parse::<Network>()?,
        target_network: target_network.parse::<Network>()?,
        bridge_info: bridge_info
            .map(serde_json::from_value::<BridgeInfo>)
            .transpose()
            .context("decoding bridge info")?,
        steps: serde_json::from_value(steps).context("decoding steps")?,
        status: CrossChainTxStatus::try_from(status.as_str())?,
        last_status_check: row.get("last_status_check"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
