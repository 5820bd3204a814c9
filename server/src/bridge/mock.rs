use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::bridge::{
    direct_route, BridgeCallbacks, BridgeError, BridgeExecution, BridgeRouter,
    BridgeStatusUpdate, BridgeTransferStatus, Route, RouteQuery, RouteStep,
};

/// Scripted [`BridgeRouter`] for tests and offline runs. Planning yields the
/// configured route; `status` drains the queued updates, then repeats the
/// last one.
pub struct MockBridgeRouter {
    route: Option<Route>,
    planning_error: Option<String>,
    statuses: Mutex<VecDeque<BridgeStatusUpdate>>,
    executions: Mutex<Vec<String>>,
}

impl MockBridgeRouter {
    /// Router that plans a plausible wormhole-style route for every query.
    pub fn with_default_route() -> Self {
        MockBridgeRouter {
            route: Some(Route {
                bridge: "wormhole".to_string(),
                steps: vec![
                    RouteStep {
                        step: 1,
                        action: "lock".to_string(),
                        description: "Lock funds on the source chain".to_string(),
                    },
                    RouteStep {
                        step: 2,
                        action: "attest".to_string(),
                        description: "Guardian attestation".to_string(),
                    },
                    RouteStep {
                        step: 3,
                        action: "redeem".to_string(),
                        description: "Redeem on the target chain".to_string(),
                    },
                ],
                estimated_time_secs: 900,
                fee_usd: 6.5,
                confidence: 90.0,
                raw: serde_json::json!({ "tool": "wormhole" }),
            }),
            planning_error: None,
            statuses: Mutex::new(VecDeque::new()),
            executions: Mutex::new(Vec::new()),
        }
    }

    /// Router that finds no route for any cross-network query.
    pub fn without_route() -> Self {
        MockBridgeRouter {
            route: None,
            planning_error: None,
            statuses: Mutex::new(VecDeque::new()),
            executions: Mutex::new(Vec::new()),
        }
    }

    /// Router whose aggregator is unreachable.
    pub fn unreachable() -> Self {
        MockBridgeRouter {
            route: None,
            planning_error: Some("connection refused".to_string()),
            statuses: Mutex::new(VecDeque::new()),
            executions: Mutex::new(Vec::new()),
        }
    }

    pub fn queue_status(&self, update: BridgeStatusUpdate) {
        self.statuses.lock().unwrap().push_back(update);
    }

    pub fn executed(&self) -> Vec<String> {
        self.executions.lock().unwrap().clone()
    }
}

#[async_trait]
impl BridgeRouter for MockBridgeRouter {
    async fn plan_route(&self, query: &RouteQuery) -> Result<Option<Route>, BridgeError> {
        if let Some(reason) = &self.planning_error {
            return Err(BridgeError::Unavailable(reason.clone()));
        }
        if let Some(route) = direct_route(query) {
            return Ok(Some(route));
        }
        Ok(self.route.clone())
    }

    async fn execute(
        &self,
        route: &Route,
        callbacks: &dyn BridgeCallbacks,
    ) -> Result<BridgeExecution, BridgeError> {
        let execution_id = format!("exec-{}", Uuid::new_v4());
        self.executions.lock().unwrap().push(execution_id.clone());
        let initial_tx_hash = format!("0x{:064x}", self.executions.lock().unwrap().len());
        callbacks.on_status_update(&BridgeStatusUpdate {
            status: BridgeTransferStatus::Pending,
            substatus: Some(format!("{} execution submitted", route.bridge)),
            source_tx_hash: Some(initial_tx_hash.clone()),
            target_tx_hash: None,
        });
        Ok(BridgeExecution {
            execution_id,
            initial_tx_hash: Some(initial_tx_hash),
        })
    }

    async fn status(&self, _execution_id: &str) -> Result<BridgeStatusUpdate, BridgeError> {
        let mut statuses = self.statuses.lock().unwrap();
        if statuses.len() > 1 {
            return Ok(statuses.pop_front().expect("non-empty queue"));
        }
        if let Some(last) = statuses.front() {
            return Ok(last.clone());
        }
        Ok(BridgeStatusUpdate {
            status: BridgeTransferStatus::Pending,
            substatus: None,
            source_tx_hash: None,
            target_tx_hash: None,
        })
    }
}
