use std::sync::Arc;

use alloy::primitives::U256;
use axum::{
    extract::{FromRequest, Json, Path, Query, Request, State},
    http::{HeaderMap, Method, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post, put},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};

use crate::auth::{authenticate, TokenVerifier};
use crate::cross_chain::CrossChainEngine;
use crate::deal::{
    CreateDealRequest, DealService, ExecuteStepRequest, RaiseDisputeRequest,
    ReviewConditionRequest, StartFinalApprovalRequest, SyncStatusRequest, TransferRequest,
};
use crate::error::AppError;
use crate::model::{amount_to_base_units, NATIVE_DECIMALS};
use crate::networks::Network;
use crate::store::Page;

#[derive(Clone)]
pub struct RouterCtx {
    pub deal_service: Arc<DealService>,
    pub engine: Arc<CrossChainEngine>,
    pub verifier: Arc<dyn TokenVerifier>,
}

/// Builds the deal API. Every route under /api/transactions requires a
/// bearer token; /health does not.
pub fn build_router(ctx: RouterCtx) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(vec![Method::GET, Method::POST, Method::PUT, Method::PATCH])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/transactions/create", post(create_deal))
        .route("/api/transactions", get(list_deals))
        .route(
            "/api/transactions/conditions/{condition_id}/buyer-review",
            patch(review_condition),
        )
        .route(
            "/api/transactions/cross-chain/estimate-fees",
            get(estimate_fees),
        )
        .route(
            "/api/transactions/cross-chain/{deal_id}/execute-step",
            post(execute_step),
        )
        .route(
            "/api/transactions/cross-chain/{deal_id}/status",
            get(cross_chain_status),
        )
        .route(
            "/api/transactions/cross-chain/{deal_id}/transfer",
            post(cross_chain_transfer),
        )
        .route("/api/transactions/{id}", get(get_deal))
        .route("/api/transactions/{id}/sync-status", put(sync_status))
        .route(
            "/api/transactions/{id}/sc/start-final-approval",
            post(start_final_approval),
        )
        .route(
            "/api/transactions/{id}/sc/raise-dispute",
            post(raise_dispute),
        )
        .with_state(ctx)
        .layer(cors)
}

/// Like [`Json`], but malformed or unknown-field bodies are a 400 with the
/// standard error envelope rather than axum's default 422.
struct ApiJson<T>(T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(AppError(
                StatusCode::BAD_REQUEST,
                anyhow::anyhow!(rejection.body_text()),
            )),
        }
    }
}

// --------------------------------------------------------
//     Query shapes
// --------------------------------------------------------

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ListQuery {
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct EstimateFeesQuery {
    source_network: Network,
    target_network: Network,
    amount: f64,
}

// --------------------------------------------------------
//     Routes
// --------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json("OK")
}

async fn create_deal(
    State(ctx): State<RouterCtx>,
    headers: HeaderMap,
    ApiJson(request): ApiJson<CreateDealRequest>,
) -> Result<impl IntoResponse, AppError> {
    let principal = authenticate(ctx.verifier.as_ref(), &headers).await?;
    let deal = ctx.deal_service.create(&principal, request).await?;
    Ok((StatusCode::CREATED, Json(deal)))
}

async fn get_deal(
    State(ctx): State<RouterCtx>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let principal = authenticate(ctx.verifier.as_ref(), &headers).await?;
    let deal = ctx.deal_service.get(&principal, &id).await?;
    Ok(Json(deal))
}

async fn list_deals(
    State(ctx): State<RouterCtx>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, AppError> {
    let principal = authenticate(ctx.verifier.as_ref(), &headers).await?;
    let mut page = Page::default();
    if let Some(limit) = query.limit {
        if limit <= 0 {
            return Err(AppError::bad_request("limit must be positive"));
        }
        page.limit = limit;
    }
    if let Some(offset) = query.offset {
        if offset < 0 {
            return Err(AppError::bad_request("offset must not be negative"));
        }
        page.offset = offset;
    }
    let deals = ctx.deal_service.list(&principal, page).await?;
    Ok(Json(deals))
}

async fn review_condition(
    State(ctx): State<RouterCtx>,
    headers: HeaderMap,
    Path(condition_id): Path<String>,
    ApiJson(request): ApiJson<ReviewConditionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let principal = authenticate(ctx.verifier.as_ref(), &headers).await?;
    let deal = ctx
        .deal_service
        .review_condition(&principal, &condition_id, request)
        .await?;
    Ok(Json(deal))
}

async fn sync_status(
    State(ctx): State<RouterCtx>,
    headers: HeaderMap,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<SyncStatusRequest>,
) -> Result<impl IntoResponse, AppError> {
    let principal = authenticate(ctx.verifier.as_ref(), &headers).await?;
    let deal = ctx.deal_service.sync_status(&principal, &id, request).await?;
    Ok(Json(deal))
}

async fn start_final_approval(
    State(ctx): State<RouterCtx>,
    headers: HeaderMap,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<StartFinalApprovalRequest>,
) -> Result<impl IntoResponse, AppError> {
    let principal = authenticate(ctx.verifier.as_ref(), &headers).await?;
    let deal = ctx
        .deal_service
        .start_final_approval(&principal, &id, request)
        .await?;
    Ok(Json(deal))
}

async fn raise_dispute(
    State(ctx): State<RouterCtx>,
    headers: HeaderMap,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<RaiseDisputeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let principal = authenticate(ctx.verifier.as_ref(), &headers).await?;
    let deal = ctx
        .deal_service
        .raise_dispute(&principal, &id, request)
        .await?;
    Ok(Json(deal))
}

async fn execute_step(
    State(ctx): State<RouterCtx>,
    headers: HeaderMap,
    Path(deal_id): Path<String>,
    ApiJson(request): ApiJson<ExecuteStepRequest>,
) -> Result<impl IntoResponse, AppError> {
    let principal = authenticate(ctx.verifier.as_ref(), &headers).await?;
    let status = ctx
        .deal_service
        .execute_cross_chain_step(&principal, &deal_id, request)
        .await?;
    Ok(Json(status))
}

async fn cross_chain_status(
    State(ctx): State<RouterCtx>,
    headers: HeaderMap,
    Path(deal_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let principal = authenticate(ctx.verifier.as_ref(), &headers).await?;
    let status = ctx
        .deal_service
        .cross_chain_status(&principal, &deal_id)
        .await?;
    Ok(Json(status))
}

async fn cross_chain_transfer(
    State(ctx): State<RouterCtx>,
    headers: HeaderMap,
    Path(deal_id): Path<String>,
    ApiJson(request): ApiJson<TransferRequest>,
) -> Result<impl IntoResponse, AppError> {
    let principal = authenticate(ctx.verifier.as_ref(), &headers).await?;
    let status = ctx
        .deal_service
        .cross_chain_transfer(&principal, &deal_id, request)
        .await?;
    Ok(Json(status))
}

async fn estimate_fees(
    State(ctx): State<RouterCtx>,
    headers: HeaderMap,
    Query(query): Query<EstimateFeesQuery>,
) -> Result<impl IntoResponse, AppError> {
    let _principal = authenticate(ctx.verifier.as_ref(), &headers).await?;
    let amount: U256 = amount_to_base_units(query.amount, NATIVE_DECIMALS)?;
    let estimate = ctx
        .engine
        .estimate_fees(query.source_network, query.target_network, amount)
        .await;
    Ok(Json(estimate))
}
