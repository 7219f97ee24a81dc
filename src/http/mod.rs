//! HTTP façade adapter (spec §6): thin axum surface mirroring the core's
//! typed API — CRUD on models/providers/futures/strategies, reads for
//! portfolio/trades/conversations/decisions, actuation for auto-buy/
//! auto-sell. No business logic lives here; every handler is a direct
//! call into the Persistence Gateway plus, for model mutations, a
//! `WorkerSupervisor::reconcile` so enabling/disabling takes effect
//! without waiting for the next full reconcile sweep.
//!
//! Grounded on `api/routes.rs`'s axum handler shape (`State<AppState>`
//! extraction, `Query`/`Json` DTOs) and `main.rs`'s `CorsLayer` +
//! `request_logging_simple` wiring.

use crate::domain::{BatchConfig, Model, Provider, ProviderType, Strategy, StrategyType, SymbolSource};
use crate::error::CoreError;
use crate::middleware::logging::request_logging_simple;
use crate::orchestrator::WorkerSupervisor;
use crate::persistence::Db;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware::from_fn,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub supervisor: Arc<WorkerSupervisor>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_reason: Option<String>,
}

/// Wraps `CoreError` (and any internal `anyhow::Error`) into the façade's
/// `{code, message, error_reason?}` JSON body mapped to the right HTTP
/// status (spec §7 "user-visible behavior").
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self(CoreError::Internal(e.to_string()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            code: self.0.code(),
            message: self.0.to_string(),
            error_reason: None,
        };
        (status, Json(body)).into_response()
    }
}

fn not_found(what: &str, id: &str) -> ApiError {
    ApiError(CoreError::NotFound(format!("{what} {id}")))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/models", get(list_models).post(create_model))
        .route("/models/:id", get(get_model).put(update_model).delete(delete_model))
        .route("/models/:id/auto-buy/enable", post(enable_auto_buy))
        .route("/models/:id/auto-buy/disable", post(disable_auto_buy))
        .route("/models/:id/auto-sell/enable", post(enable_auto_sell))
        .route("/models/:id/auto-sell/disable", post(disable_auto_sell))
        .route("/models/:id/portfolio", get(get_portfolio))
        .route("/models/:id/trades", get(get_trades))
        .route("/models/:id/conversations", get(get_conversations))
        .route("/models/:id/decisions", get(get_decisions))
        .route("/providers", get(list_providers).post(create_provider))
        .route("/providers/:id", get(get_provider).put(update_provider).delete(delete_provider))
        .route("/futures", get(list_futures).post(create_future))
        .route("/futures/:id", axum::routing::delete(delete_future))
        .route("/strategies", get(list_strategies).post(create_strategy))
        .route(
            "/strategies/:id",
            get(get_strategy).put(update_strategy).delete(delete_strategy),
        )
        .layer(CorsLayer::permissive())
        .layer(from_fn(request_logging_simple))
        .with_state(state)
}

// ---- models ----

#[derive(Debug, Deserialize)]
pub struct ModelInput {
    pub display_name: String,
    pub provider_id: String,
    pub provider_model_name: String,
    pub initial_capital: f64,
    pub leverage: u32,
    pub max_positions: u32,
    pub api_credentials: Option<String>,
    #[serde(default)]
    pub auto_buy_enabled: bool,
    #[serde(default)]
    pub auto_sell_enabled: bool,
    pub auto_close_percent: Option<f64>,
    pub base_volume_filter: Option<f64>,
    pub symbol_source: SymbolSource,
    #[serde(default)]
    pub buy_batch: BatchConfig,
    #[serde(default)]
    pub sell_batch: BatchConfig,
}

impl ModelInput {
    fn into_model(self, id: String, created_at: chrono::DateTime<Utc>) -> Model {
        Model {
            id,
            display_name: self.display_name,
            provider_id: self.provider_id,
            provider_model_name: self.provider_model_name,
            initial_capital: self.initial_capital,
            leverage: self.leverage,
            max_positions: self.max_positions,
            api_credentials: self.api_credentials,
            auto_buy_enabled: self.auto_buy_enabled,
            auto_sell_enabled: self.auto_sell_enabled,
            auto_close_percent: self.auto_close_percent,
            base_volume_filter: self.base_volume_filter,
            symbol_source: self.symbol_source,
            buy_batch: self.buy_batch,
            sell_batch: self.sell_batch,
            created_at,
        }
    }
}

async fn list_models(State(state): State<AppState>) -> Result<Json<Vec<Model>>, ApiError> {
    Ok(Json(state.db.list_models().await?))
}

async fn get_model(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Model>, ApiError> {
    state.db.get_model(&id).await?.map(Json).ok_or_else(|| not_found("model", &id))
}

async fn create_model(State(state): State<AppState>, Json(input): Json<ModelInput>) -> Result<Json<Model>, ApiError> {
    let model = input.into_model(Uuid::new_v4().to_string(), Utc::now());
    model.validate().map_err(CoreError::ValidationFailed)?;
    state.db.upsert_model(&model).await?;
    state.supervisor.reconcile(&model).await;
    Ok(Json(model))
}

async fn update_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ModelInput>,
) -> Result<Json<Model>, ApiError> {
    let existing = state.db.get_model(&id).await?.ok_or_else(|| not_found("model", &id))?;
    let model = input.into_model(id, existing.created_at);
    model.validate().map_err(CoreError::ValidationFailed)?;
    state.db.upsert_model(&model).await?;
    state.supervisor.reconcile(&model).await;
    Ok(Json(model))
}

async fn delete_model(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    state.db.delete_model(&id).await?;
    state.supervisor.reconcile_all().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn enable_auto_buy(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    set_auto(&state, &id, Some(true), None).await
}

async fn disable_auto_buy(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    set_auto(&state, &id, Some(false), None).await
}

async fn enable_auto_sell(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    set_auto(&state, &id, None, Some(true)).await
}

async fn disable_auto_sell(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    set_auto(&state, &id, None, Some(false)).await
}

async fn set_auto(state: &AppState, id: &str, buy: Option<bool>, sell: Option<bool>) -> Result<StatusCode, ApiError> {
    state.db.set_auto_enabled(id, buy, sell).await?;
    let model = state.db.get_model(id).await?.ok_or_else(|| not_found("model", id))?;
    state.supervisor.reconcile(&model).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

const DEFAULT_READ_LIMIT: usize = 200;

async fn get_portfolio(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<crate::domain::Portfolio>>, ApiError> {
    Ok(Json(state.db.list_portfolios_for_model(&id).await?))
}

async fn get_trades(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Vec<crate::domain::Trade>>, ApiError> {
    Ok(Json(
        state.db.list_trades_for_model(&id, q.limit.unwrap_or(DEFAULT_READ_LIMIT)).await?,
    ))
}

async fn get_conversations(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Vec<crate::domain::Conversation>>, ApiError> {
    Ok(Json(
        state
            .db
            .list_conversations_for_model(&id, q.limit.unwrap_or(DEFAULT_READ_LIMIT))
            .await?,
    ))
}

async fn get_decisions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Vec<crate::domain::StrategyDecision>>, ApiError> {
    Ok(Json(
        state.db.list_decisions_for_model(&id, q.limit.unwrap_or(DEFAULT_READ_LIMIT)).await?,
    ))
}

// ---- providers ----

#[derive(Debug, Deserialize)]
pub struct ProviderInput {
    pub display_name: String,
    pub provider_type: ProviderType,
    pub base_url: String,
    pub api_key: String,
}

async fn list_providers(State(state): State<AppState>) -> Result<Json<Vec<Provider>>, ApiError> {
    Ok(Json(state.db.list_providers().await?))
}

async fn get_provider(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Provider>, ApiError> {
    state.db.get_provider(&id).await?.map(Json).ok_or_else(|| not_found("provider", &id))
}

async fn create_provider(State(state): State<AppState>, Json(input): Json<ProviderInput>) -> Result<Json<Provider>, ApiError> {
    let provider = Provider {
        id: Uuid::new_v4().to_string(),
        display_name: input.display_name,
        provider_type: input.provider_type,
        base_url: input.base_url,
        api_key: input.api_key,
    };
    state.db.upsert_provider(&provider).await?;
    Ok(Json(provider))
}

async fn update_provider(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ProviderInput>,
) -> Result<Json<Provider>, ApiError> {
    state.db.get_provider(&id).await?.ok_or_else(|| not_found("provider", &id))?;
    let provider = Provider {
        id,
        display_name: input.display_name,
        provider_type: input.provider_type,
        base_url: input.base_url,
        api_key: input.api_key,
    };
    state.db.upsert_provider(&provider).await?;
    Ok(Json(provider))
}

async fn delete_provider(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    state.db.delete_provider(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- futures ----

#[derive(Debug, Deserialize)]
pub struct FutureInput {
    pub symbol: String,
    pub display_name: String,
    #[serde(default)]
    pub sort_order: i32,
}

async fn list_futures(State(state): State<AppState>) -> Result<Json<Vec<crate::domain::Future>>, ApiError> {
    Ok(Json(state.db.list_futures().await?))
}

async fn create_future(
    State(state): State<AppState>,
    Json(input): Json<FutureInput>,
) -> Result<Json<crate::domain::Future>, ApiError> {
    let future = crate::domain::Future {
        id: Uuid::new_v4().to_string(),
        symbol: input.symbol,
        display_name: input.display_name,
        sort_order: input.sort_order,
    };
    state.db.upsert_future(&future).await?;
    Ok(Json(future))
}

async fn delete_future(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    state.db.delete_future(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- strategies ----

#[derive(Debug, Deserialize)]
pub struct StrategyInput {
    pub name: String,
    pub strategy_type: StrategyType,
    pub program_text: String,
    pub metadata: Option<String>,
}

async fn list_strategies(State(state): State<AppState>) -> Result<Json<Vec<Strategy>>, ApiError> {
    Ok(Json(state.db.list_strategies().await?))
}

async fn get_strategy(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Strategy>, ApiError> {
    state.db.get_strategy(&id).await?.map(Json).ok_or_else(|| not_found("strategy", &id))
}

async fn create_strategy(State(state): State<AppState>, Json(input): Json<StrategyInput>) -> Result<Json<Strategy>, ApiError> {
    let strategy = Strategy {
        id: Uuid::new_v4().to_string(),
        name: input.name,
        strategy_type: input.strategy_type,
        program_text: input.program_text,
        metadata: input.metadata,
    };
    state.db.upsert_strategy(&strategy).await?;
    Ok(Json(strategy))
}

async fn update_strategy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<StrategyInput>,
) -> Result<Json<Strategy>, ApiError> {
    state.db.get_strategy(&id).await?.ok_or_else(|| not_found("strategy", &id))?;
    let strategy = Strategy {
        id,
        name: input.name,
        strategy_type: input.strategy_type,
        program_text: input.program_text,
        metadata: input.metadata,
    };
    state.db.upsert_strategy(&strategy).await?;
    Ok(Json(strategy))
}

async fn delete_strategy(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    state.db.delete_strategy(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_failed_maps_to_400() {
        let err = ApiError(CoreError::ValidationFailed("bad".into()));
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn not_found_maps_to_404() {
        let err = not_found("model", "m1");
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
