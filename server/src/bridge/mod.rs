use alloy::primitives::U256;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::DealError;
use crate::networks::Network;

pub mod http;
pub mod mock;

pub use http::AggregatorRouter;
pub use mock::MockBridgeRouter;

/// Weights of the route-ranking score.
const WEIGHT_CONFIDENCE: f64 = 0.4;
const WEIGHT_TIME: f64 = 0.3;
const WEIGHT_FEE: f64 = 0.3;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge unavailable: {0}")]
    Unavailable(String),
    #[error("bridge execution failed: {0}")]
    Execution(String),
}

impl From<BridgeError> for DealError {
    fn from(err: BridgeError) -> Self {
        DealError::BridgeUnavailable(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct RouteQuery {
    pub from_address: String,
    pub to_address: String,
    pub source_network: Network,
    pub target_network: Network,
    pub token: String,
    pub amount: U256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteStep {
    pub step: u32,
    pub action: String,
    pub description: String,
}

/// One planned way of moving value between two networks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub bridge: String,
    pub steps: Vec<RouteStep>,
    pub estimated_time_secs: u64,
    pub fee_usd: f64,
    /// Aggregator confidence, clamped to [30, 100] before scoring.
    pub confidence: f64,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct BridgeExecution {
    pub execution_id: String,
    pub initial_tx_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeTransferStatus {
    Done,
    Pending,
    Failed,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct BridgeStatusUpdate {
    pub status: BridgeTransferStatus,
    pub substatus: Option<String>,
    pub source_tx_hash: Option<String>,
    pub target_tx_hash: Option<String>,
}

/// Progress notifications surfaced while a bridge execution runs. The server
/// implementation logs updates; chain switches are advisory only and always
/// refused in a backend context.
pub trait BridgeCallbacks: Send + Sync {
    fn on_status_update(&self, update: &BridgeStatusUpdate);
    fn on_error(&self, error: &BridgeError);
    fn switch_chain(&self, _chain_id: u64) -> bool {
        false
    }
}

pub struct LoggingCallbacks {
    pub deal_id: String,
}

impl BridgeCallbacks for LoggingCallbacks {
    fn on_status_update(&self, update: &BridgeStatusUpdate) {
        info!(
            deal_id = %self.deal_id,
            status = ?update.status,
            substatus = ?update.substatus,
            "Bridge status update"
        );
    }

    fn on_error(&self, error: &BridgeError) {
        warn!(deal_id = %self.deal_id, "Bridge reported error: {error}");
    }

    fn switch_chain(&self, chain_id: u64) -> bool {
        warn!(
            deal_id = %self.deal_id,
            chain_id,
            "Bridge requested a chain switch; refused in server context"
        );
        false
    }
}

/// Route discovery, execution and status polling against whichever bridge
/// aggregator backs the deployment.
#[async_trait]
pub trait BridgeRouter: Send + Sync {
    /// Plans the best available route. `Ok(None)` means no route exists;
    /// callers surface that without aborting deal creation.
    async fn plan_route(&self, query: &RouteQuery) -> Result<Option<Route>, BridgeError>;

    async fn execute(
        &self,
        route: &Route,
        callbacks: &dyn BridgeCallbacks,
    ) -> Result<BridgeExecution, BridgeError>;

    async fn status(&self, execution_id: &str) -> Result<BridgeStatusUpdate, BridgeError>;
}

/// Ranks candidate routes with the weighted confidence/time/fee score and
/// returns the best one.
pub fn select_optimal_route(candidates: Vec<Route>) -> Option<Route> {
    candidates
        .into_iter()
        .max_by(|a, b| route_score(a).total_cmp(&route_score(b)))
}

pub fn route_score(route: &Route) -> f64 {
    let confidence = route.confidence.clamp(30.0, 100.0);
    let time_score = 100.0 / (1.0 + route.estimated_time_secs as f64 / 60.0);
    let fee_score = 100.0 / (1.0 + route.fee_usd.max(0.0));
    confidence * WEIGHT_CONFIDENCE + time_score * WEIGHT_TIME + fee_score * WEIGHT_FEE
}

/// Resolves the token a route is discovered for. Native transfers substitute
/// the network's wrapped-native address; unknown tokens are rejected.
pub fn discovery_token(network: Network, token: &str) -> Result<String, BridgeError> {
    let symbol = token.to_ascii_uppercase();
    if !network.known_tokens().contains(&symbol.as_str()) {
        return Err(BridgeError::Unavailable(format!(
            "token {token} is not supported on {network}"
        )));
    }
    if symbol == network.native_token() {
        if let Some(wrapped) = network.wrapped_native_address() {
            return Ok(wrapped.to_string());
        }
    }
    Ok(symbol)
}

/// Same-network EVM transfers need no bridge: a single direct-transfer step.
pub fn direct_route(query: &RouteQuery) -> Option<Route> {
    if query.source_network == query.target_network && query.source_network.is_evm() {
        return Some(Route {
            bridge: "direct".to_string(),
            steps: vec![RouteStep {
                step: 1,
                action: "direct_transfer".to_string(),
                description: format!("Direct transfer on {}", query.source_network),
            }],
            estimated_time_secs: 60,
            fee_usd: 0.0,
            confidence: 100.0,
            raw: serde_json::json!({ "type": "direct" }),
        });
    }
    None
}
