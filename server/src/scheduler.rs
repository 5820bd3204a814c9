use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::chain::EscrowChain;
use crate::cross_chain::CrossChainEngine;
use crate::error::DealError;
use crate::model::{CrossChainTxStatus, Deal, DealStatus, StepAction, TimelineEvent};
use crate::store::DealStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between deadline reconciliation runs.
    pub deadline_check_interval_secs: u64,
    /// Re-poll bridge status for transactions not checked for this long.
    pub status_check_staleness_secs: u64,
    /// Mark cross-chain deals stuck after this much inactivity.
    pub stuck_threshold_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            deadline_check_interval_secs: 1800,
            status_check_staleness_secs: 3600,
            stuck_threshold_secs: 7200,
        }
    }
}

/// Process-singleton reconciliation job: releases or cancels deals whose
/// deadlines elapsed, re-polls stale bridge transfers, and parks stuck
/// cross-chain deals. One deal's failure never stops the others.
pub struct DeadlineScheduler {
    store: Arc<dyn DealStore>,
    chain: Option<Arc<dyn EscrowChain>>,
    engine: Arc<CrossChainEngine>,
    config: SchedulerConfig,
    running: AtomicBool,
}

struct TickGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl DeadlineScheduler {
    pub fn new(
        store: Arc<dyn DealStore>,
        chain: Option<Arc<dyn EscrowChain>>,
        engine: Arc<CrossChainEngine>,
        config: SchedulerConfig,
    ) -> Self {
        DeadlineScheduler {
            store,
            chain,
            engine,
            config,
            running: AtomicBool::new(false),
        }
    }

    /// Spawns the periodic loop.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                scheduler.config.deadline_check_interval_secs,
            ));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                scheduler.run_tick().await;
            }
        })
    }

    fn acquire(&self) -> Option<TickGuard<'_>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }
        Some(TickGuard {
            flag: &self.running,
        })
    }

    /// Runs one reconciliation pass. Returns false when a previous run was
    /// still executing and this one was skipped.
    pub async fn run_tick(&self) -> bool {
        let Some(_guard) = self.acquire() else {
            info!("Deadline check already running, skipping this tick");
            return false;
        };

        if let Err(err) = self.run_passes().await {
            // The guard is released on this path too.
            error!("CRITICAL: deadline check run failed: {err:#}");
        }
        true
    }

    async fn run_passes(&self) -> Result<(), DealError> {
        let now = Utc::now();

        self.release_expired_final_approvals().await?;
        self.cancel_expired_disputes().await?;
        self.release_expired_cross_chain().await?;
        self.poll_stale_transactions().await?;
        self.mark_stuck_deals().await?;

        info!(started_at = %now, "Deadline check run completed");
        Ok(())
    }

    async fn release_expired_final_approvals(&self) -> Result<(), DealError> {
        let deals = self.store.deals_past_final_approval(Utc::now()).await?;
        for deal in deals {
            let Some(contract) = deal.smart_contract_address.clone() else {
                warn!(deal_id = %deal.id, "Final approval elapsed but no contract address, skipping");
                continue;
            };
            let Some(chain) = &self.chain else {
                warn!(deal_id = %deal.id, "Final approval elapsed but chain client not configured");
                continue;
            };

            let outcome = chain.release_funds_after_approval_period(&contract).await;
            let result = match outcome {
                Ok(tx_hash) => {
                    self.store
                        .transact(
                            &deal.id,
                            Box::new(move |txn| {
                                txn.deal.transition_to(
                                    DealStatus::Completed,
                                    TimelineEvent::system(format!(
                                        "Funds automatically released. Tx: {tx_hash}"
                                    ))
                                    .with_tx_hash(tx_hash.clone()),
                                )?;
                                txn.deal.processing_error = None;
                                Ok(())
                            }),
                        )
                        .await
                }
                Err(err) => {
                    let message = err.to_string();
                    self.store
                        .transact(
                            &deal.id,
                            Box::new(move |txn| {
                                txn.deal.transition_to(
                                    DealStatus::AutoReleaseFailed,
                                    TimelineEvent::system(format!(
                                        "Automatic funds release failed: {message}"
                                    )),
                                )?;
                                txn.deal.processing_error = Some(message.clone());
                                Ok(())
                            }),
                        )
                        .await
                }
            };
            if let Err(err) = result {
                error!(deal_id = %deal.id, "Failed to record release outcome: {err}");
            }
        }
        Ok(())
    }

    async fn cancel_expired_disputes(&self) -> Result<(), DealError> {
        let deals = self.store.deals_past_dispute_deadline(Utc::now()).await?;
        for deal in deals {
            if deal.is_cross_chain {
                if let Err(err) = self.cancel_cross_chain_after_dispute(&deal).await {
                    error!(deal_id = %deal.id, "Failed to cancel cross-chain deal: {err}");
                }
                continue;
            }

            let Some(contract) = deal.smart_contract_address.clone() else {
                warn!(deal_id = %deal.id, "Dispute deadline elapsed but no contract address, skipping");
                continue;
            };
            let Some(chain) = &self.chain else {
                warn!(deal_id = %deal.id, "Dispute deadline elapsed but chain client not configured");
                continue;
            };

            let outcome = chain.cancel_escrow_and_refund_buyer(&contract).await;
            let result = match outcome {
                Ok(tx_hash) => {
                    self.store
                        .transact(
                            &deal.id,
                            Box::new(move |txn| {
                                txn.deal.transition_to(
                                    DealStatus::Cancelled,
                                    TimelineEvent::system(format!(
                                        "Escrow automatically cancelled and buyer refunded. Tx: {tx_hash}"
                                    ))
                                    .with_tx_hash(tx_hash.clone()),
                                )?;
                                txn.deal.processing_error = None;
                                Ok(())
                            }),
                        )
                        .await
                }
                Err(err) => {
                    let message = err.to_string();
                    self.store
                        .transact(
                            &deal.id,
                            Box::new(move |txn| {
                                txn.deal.transition_to(
                                    DealStatus::AutoCancellationFailed,
                                    TimelineEvent::system(format!(
                                        "Automatic cancellation failed: {message}"
                                    )),
                                )?;
                                txn.deal.processing_error = Some(message.clone());
                                Ok(())
                            }),
                        )
                        .await
                }
            };
            if let Err(err) = result {
                error!(deal_id = %deal.id, "Failed to record cancellation outcome: {err}");
            }
        }
        Ok(())
    }

    async fn cancel_cross_chain_after_dispute(&self, deal: &Deal) -> Result<(), DealError> {
        self.store
            .transact(
                &deal.id,
                Box::new(|txn| {
                    txn.deal.transition_to(
                        DealStatus::CrossChainCancelledAfterDisputeDeadline,
                        TimelineEvent::system(
                            "Dispute deadline elapsed; cross-chain deal cancelled",
                        ),
                    )?;
                    if let Some(tx) = txn.cross_chain.as_mut() {
                        if tx.status != CrossChainTxStatus::Completed {
                            tx.status = CrossChainTxStatus::Failed;
                        }
                    }
                    Ok(())
                }),
            )
            .await?;
        Ok(())
    }

    async fn release_expired_cross_chain(&self) -> Result<(), DealError> {
        let deals = self
            .store
            .cross_chain_deals_past_final_approval(Utc::now())
            .await?;
        for deal in deals {
            if !deal.cross_chain_conditions_fulfilled() {
                warn!(
                    deal_id = %deal.id,
                    "Cross-chain final approval elapsed with unfulfilled conditions, requires manual intervention"
                );
                continue;
            }

            let release_hash = match (&deal.smart_contract_address, &self.chain) {
                (Some(contract), Some(chain)) => {
                    match chain.release_funds_after_approval_period(contract).await {
                        Ok(hash) => Some(hash),
                        Err(err) => {
                            let message = err.to_string();
                            warn!(deal_id = %deal.id, "Cross-chain release failed: {message}");
                            let result = self
                                .store
                                .transact(
                                    &deal.id,
                                    Box::new(move |txn| {
                                        txn.deal.processing_error = Some(message.clone());
                                        txn.deal.timeline.push(TimelineEvent::system(format!(
                                            "Cross-chain funds release failed: {message}"
                                        )));
                                        Ok(())
                                    }),
                                )
                                .await;
                            if let Err(err) = result {
                                error!(deal_id = %deal.id, "Failed to record release failure: {err}");
                            }
                            continue;
                        }
                    }
                }
                _ => None,
            };

            let result = self
                .store
                .transact(
                    &deal.id,
                    Box::new(move |txn| {
                        let mut event = TimelineEvent::system(
                            "Cross-chain funds released after final approval period",
                        );
                        if let Some(hash) = release_hash {
                            event = event.with_tx_hash(hash);
                        }
                        txn.deal
                            .transition_to(DealStatus::CrossChainFundsReleased, event)?;
                        txn.deal.processing_error = None;
                        Ok(())
                    }),
                )
                .await;
            if let Err(err) = result {
                error!(deal_id = %deal.id, "Failed to record cross-chain release: {err}");
            }
        }
        Ok(())
    }

    async fn poll_stale_transactions(&self) -> Result<(), DealError> {
        let threshold = Utc::now()
            - chrono::Duration::seconds(self.config.status_check_staleness_secs as i64);
        let transactions = self
            .store
            .transactions_pending_status_check(threshold)
            .await?;
        for tx in transactions {
            if !tx.steps.iter().any(|s| s.execution_id.is_some()) {
                // Bridge not initiated yet, nothing to poll.
                continue;
            }
            let Some(monitor) = tx
                .steps
                .iter()
                .find(|s| s.action == StepAction::MonitorBridge && !s.is_settled())
            else {
                continue;
            };
            if let Err(err) = self.engine.execute_step(&tx.id, monitor.step, None).await {
                error!(tx_id = %tx.id, "Bridge status re-poll failed: {err}");
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn hold_guard(&self) -> impl Drop + '_ {
        self.acquire().expect("guard should be free")
    }

    async fn mark_stuck_deals(&self) -> Result<(), DealError> {
        let threshold =
            Utc::now() - chrono::Duration::seconds(self.config.stuck_threshold_secs as i64);
        let deals = self.store.cross_chain_deals_stuck(threshold).await?;
        for deal in deals {
            if !deal.status.can_transition_to(DealStatus::CrossChainStuck) {
                continue;
            }
            let result = self
                .store
                .transact(
                    &deal.id,
                    Box::new(|txn| {
                        txn.deal.transition_to(
                            DealStatus::CrossChainStuck,
                            TimelineEvent::system(
                                "Cross-chain transaction stuck, requires manual action",
                            ),
                        )?;
                        if let Some(tx) = txn.cross_chain.as_mut() {
                            tx.status = CrossChainTxStatus::Stuck;
                        }
                        Ok(())
                    }),
                )
                .await;
            match result {
                Ok(_) => warn!(deal_id = %deal.id, "Cross-chain deal marked stuck"),
                Err(err) => error!(deal_id = %deal.id, "Failed to mark deal stuck: {err}"),
            }
        }
        Ok(())
    }
}
