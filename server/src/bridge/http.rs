use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::bridge::{
    direct_route, discovery_token, select_optimal_route, BridgeCallbacks, BridgeError,
    BridgeExecution, BridgeRouter, BridgeStatusUpdate, BridgeTransferStatus, Route, RouteQuery,
    RouteStep,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bridge router backed by an HTTP route aggregator.
#[derive(Clone)]
pub struct AggregatorRouter {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct RoutesResponse {
    routes: Vec<RouteCandidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RouteCandidate {
    bridge: String,
    #[serde(default)]
    steps: Vec<CandidateStep>,
    estimated_duration_seconds: u64,
    fee_usd: f64,
    confidence: f64,
    #[serde(default)]
    raw: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CandidateStep {
    action: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteResponse {
    execution_id: String,
    #[serde(default)]
    tx_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    status: String,
    #[serde(default)]
    substatus: Option<String>,
    #[serde(default)]
    source_tx_hash: Option<String>,
    #[serde(default)]
    target_tx_hash: Option<String>,
}

impl AggregatorRouter {
    pub fn new(base_url: impl Into<String>) -> Result<Self, BridgeError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BridgeError::Unavailable(format!("building HTTP client: {e}")))?;
        Ok(AggregatorRouter {
            http,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl BridgeRouter for AggregatorRouter {
    async fn plan_route(&self, query: &RouteQuery) -> Result<Option<Route>, BridgeError> {
        if let Some(route) = direct_route(query) {
            return Ok(Some(route));
        }

        let token = discovery_token(query.source_network, &query.token)?;

        let response = self
            .http
            .get(format!("{}/routes", self.base_url))
            .query(&[
                ("fromAddress", query.from_address.as_str()),
                ("toAddress", query.to_address.as_str()),
                ("fromChain", query.source_network.as_str()),
                ("toChain", query.target_network.as_str()),
                ("token", token.as_str()),
                ("amount", &query.amount.to_string()),
            ])
            .send()
            .await
            .map_err(|e| BridgeError::Unavailable(format!("requesting routes: {e}")))?;

        if !response.status().is_success() {
            return Err(BridgeError::Unavailable(format!(
                "aggregator returned {}",
                response.status()
            )));
        }

        let routes: RoutesResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::Unavailable(format!("decoding routes: {e}")))?;

        let candidates: Vec<Route> = routes
            .routes
            .into_iter()
            .map(|c| Route {
                bridge: c.bridge,
                steps: c
                    .steps
                    .into_iter()
                    .enumerate()
                    .map(|(i, s)| RouteStep {
                        step: i as u32 + 1,
                        action: s.action,
                        description: s.description,
                    })
                    .collect(),
                estimated_time_secs: c.estimated_duration_seconds,
                fee_usd: c.fee_usd,
                confidence: c.confidence,
                raw: c.raw,
            })
            .collect();

        debug!(
            source = %query.source_network,
            target = %query.target_network,
            candidates = candidates.len(),
            "Aggregator returned route candidates"
        );

        Ok(select_optimal_route(candidates))
    }

    async fn execute(
        &self,
        route: &Route,
        callbacks: &dyn BridgeCallbacks,
    ) -> Result<BridgeExecution, BridgeError> {
        let response = self
            .http
            .post(format!("{}/execute", self.base_url))
            .json(&json!({ "bridge": route.bridge, "route": route.raw }))
            .send()
            .await
            .map_err(|e| {
                let err = BridgeError::Unavailable(format!("executing route: {e}"));
                callbacks.on_error(&err);
                err
            })?;

        if !response.status().is_success() {
            let err = BridgeError::Execution(format!(
                "aggregator rejected execution with {}",
                response.status()
            ));
            callbacks.on_error(&err);
            return Err(err);
        }

        let body: ExecuteResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::Unavailable(format!("decoding execution: {e}")))?;

        info!(
            bridge = %route.bridge,
            execution_id = %body.execution_id,
            "Bridge execution started"
        );
        callbacks.on_status_update(&BridgeStatusUpdate {
            status: BridgeTransferStatus::Pending,
            substatus: Some("execution submitted".to_string()),
            source_tx_hash: body.tx_hash.clone(),
            target_tx_hash: None,
        });

        Ok(BridgeExecution {
            execution_id: body.execution_id,
            initial_tx_hash: body.tx_hash,
        })
    }

    async fn status(&self, execution_id: &str) -> Result<BridgeStatusUpdate, BridgeError> {
        let response = self
            .http
            .get(format!("{}/status/{execution_id}", self.base_url))
            .send()
            .await
            .map_err(|e| BridgeError::Unavailable(format!("fetching bridge status: {e}")))?;

        if !response.status().is_success() {
            return Err(BridgeError::Unavailable(format!(
                "aggregator returned {}",
                response.status()
            )));
        }

        let body: StatusResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::Unavailable(format!("decoding bridge status: {e}")))?;

        let status = match body.status.as_str() {
            "DONE" => BridgeTransferStatus::Done,
            "PENDING" => BridgeTransferStatus::Pending,
            "FAILED" => BridgeTransferStatus::Failed,
            _ => BridgeTransferStatus::Unknown,
        };

        Ok(BridgeStatusUpdate {
            status,
            substatus: body.substatus,
            source_tx_hash: body.source_tx_hash,
            target_tx_hash: body.target_tx_hash,
        })
    }
}
