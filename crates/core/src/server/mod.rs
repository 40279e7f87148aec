use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::blocks::claude::ClaudeClient;
use crate::config::AppConfig;
use crate::entitlements::EntitlementStore;
use crate::executor::{
    EntryValues, ExecutionError, FlowExecutor, FlowSession, RunFailure, RunPlan, RunState,
    UpstreamPolicy,
};
use crate::graph::FlowGraph;
use crate::registry::{build_default_registry, BlockDefinition, BlockRegistry};
use crate::runner::{BlockRunError, BlockRunner, GatedBlockRunner, LocalBlockRunner};
use crate::tokens::{
    token_product_by_price_slug, TokenLedger, TokenProduct, TOKEN_PACKS, TOKEN_SUBSCRIPTIONS,
};
use crate::webhook::{
    handle_event, verify_webhook, IdempotencyStore, WebhookError, SIGNATURE_HEADER,
};
use crate::workflows::{WorkflowPatch, WorkflowStore, WorkflowStoreError};

const PRINCIPAL_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    registry: BlockRegistry,
    runner: LocalBlockRunner,
    ledger: TokenLedger,
    entitlements: EntitlementStore,
    webhook_idempotency: IdempotencyStore,
    sessions: DashMap<String, Arc<Mutex<FlowSession>>>,
    workflows: Option<WorkflowStore>,
    config: RwLock<AppConfig>,
    config_path: PathBuf,
    data_dir: PathBuf,
}

impl AppState {
    pub fn new(
        registry: BlockRegistry,
        runner: LocalBlockRunner,
        workflows: Option<WorkflowStore>,
        config: AppConfig,
        config_path: PathBuf,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                registry,
                runner,
                ledger: TokenLedger::new(),
                entitlements: EntitlementStore::new(),
                webhook_idempotency: IdempotencyStore::new(),
                sessions: DashMap::new(),
                workflows,
                config: RwLock::new(config),
                config_path,
                data_dir,
            }),
        }
    }

    pub fn data_dir(&self) -> &std::path::Path {
        &self.inner.data_dir
    }

    fn workflow_store(&self) -> Result<&WorkflowStore, AppError> {
        self.inner
            .workflows
            .as_ref()
            .ok_or_else(|| AppError::Internal("workflow storage unavailable".to_string()))
    }

    fn session(&self, session_id: &str) -> Result<Arc<Mutex<FlowSession>>, AppError> {
        self.inner
            .sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AppError::NotFound(format!("session not found: {session_id}")))
    }

    async fn demo_mode(&self) -> bool {
        self.inner.config.read().await.billing.demo_mode
    }

    async fn upstream_policy(&self) -> UpstreamPolicy {
        if self.inner.config.read().await.execution.strict_upstream {
            UpstreamPolicy::Strict
        } else {
            UpstreamPolicy::Permissive
        }
    }
}

pub fn default_app_state() -> AppState {
    let dd = crate::config::data_dir(None);
    let cfg_path = crate::config::config_path(&dd);
    let config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    app_state_with_config(config, cfg_path, dd)
}

pub fn app_state_with_config(
    config: AppConfig,
    config_path: PathBuf,
    data_dir: PathBuf,
) -> AppState {
    let registry = build_default_registry();
    let runner = LocalBlockRunner::new(ClaudeClient::from_config(&config.ai));

    let workflows = match WorkflowStore::new(&data_dir) {
        Ok(store) => Some(store),
        Err(err) => {
            warn!(
                error = %err,
                data_dir = %data_dir.display(),
                "Failed to initialize workflow persistence; workflow routes will be unavailable"
            );
            None
        }
    };

    AppState::new(registry, runner, workflows, config, config_path, data_dir)
}

/// Demo principal: the authenticated user id carried in a header. Missing
/// or blank means the request is unauthenticated.
pub struct Principal(pub String);

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(PRINCIPAL_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| Principal(value.to_string()))
            .ok_or_else(|| AppError::Unauthorized(format!("missing {PRINCIPAL_HEADER} header")))
    }
}

// ─── Request / response shapes ───────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Deserialize)]
pub struct RunBlockRequest {
    pub block_id: String,
    #[serde(default)]
    pub inputs: HashMap<String, String>,
}

#[derive(Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
}

#[derive(Deserialize)]
pub struct GraphDocumentRequest {
    pub nodes: serde_json::Value,
    #[serde(default)]
    pub edges: serde_json::Value,
}

#[derive(Deserialize)]
pub struct RunSessionRequest {
    pub nodes: serde_json::Value,
    #[serde(default)]
    pub edges: serde_json::Value,
    #[serde(default)]
    pub entry_values: EntryValues,
}

#[derive(Serialize)]
pub struct RunSessionResponse {
    pub status: RunState,
    pub executed: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_node: Option<RunFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub outputs: serde_json::Value,
}

#[derive(Deserialize)]
pub struct CreateWorkflowRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub definition: Option<serde_json::Value>,
}

#[derive(Deserialize)]
pub struct ListWorkflowsQuery {
    pub limit: Option<u32>,
    pub cursor: Option<String>,
}

#[derive(Deserialize)]
pub struct PurchaseRequest {
    pub price_slug: String,
    #[serde(default)]
    pub success_url: Option<String>,
    #[allow(dead_code)]
    #[serde(default)]
    pub cancel_url: Option<String>,
}

#[derive(Deserialize)]
pub struct CreditRequest {
    pub amount: u32,
    #[serde(default)]
    pub reason: Option<String>,
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/config", get(get_config).put(update_config))
        .route("/api/blocks", get(list_blocks))
        .route("/api/run-block", post(run_block))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", delete(delete_session))
        .route("/api/sessions/{id}/plan", post(plan_session))
        .route("/api/sessions/{id}/run", post(run_session))
        .route(
            "/api/sessions/{id}/outputs",
            get(get_session_outputs).delete(clear_session_outputs),
        )
        .route("/api/workflows", get(list_workflows).post(create_workflow))
        .route(
            "/api/workflows/{id}",
            get(get_workflow).patch(patch_workflow).delete(delete_workflow),
        )
        .route("/api/entitlements", get(get_entitlements))
        .route("/api/tokens", get(get_tokens))
        .route("/api/tokens/products", get(get_token_products))
        .route("/api/tokens/purchase", post(purchase_tokens))
        .route("/api/tokens/credit", post(credit_tokens))
        .route("/api/checkout", post(create_checkout))
        .route("/api/webhook", post(receive_webhook))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

async fn get_config(State(state): State<AppState>) -> Json<AppConfig> {
    let config = state.inner.config.read().await.clone();
    Json(config)
}

async fn update_config(
    State(state): State<AppState>,
    Json(payload): Json<AppConfig>,
) -> Result<Json<AppConfig>, AppError> {
    payload.save_to_path(&state.inner.config_path)?;

    {
        let mut config = state.inner.config.write().await;
        *config = payload.clone();
    }

    Ok(Json(payload))
}

async fn list_blocks(State(state): State<AppState>) -> Json<Vec<BlockDefinition>> {
    Json(state.inner.registry.all().into_iter().cloned().collect())
}

// ─── Block execution ─────────────────────────────────────────────────────────

fn block_run_error_response(err: BlockRunError) -> Response {
    match err {
        BlockRunError::Locked {
            feature_slug,
            price_slug,
        } => (
            StatusCode::FORBIDDEN,
            Json(json!({
                "error": "Block locked",
                "message": "Purchase or subscribe to unlock this block",
                "price_slug": price_slug,
                "feature_slug": feature_slug,
            })),
        )
            .into_response(),
        BlockRunError::InsufficientBalance {
            token_cost,
            current_balance,
        } => (
            StatusCode::PAYMENT_REQUIRED,
            Json(json!({
                "error": format!(
                    "Insufficient tokens. Need {token_cost}, have {current_balance}."
                ),
                "token_cost": token_cost,
                "current_balance": current_balance,
                "needs_purchase": true,
            })),
        )
            .into_response(),
        BlockRunError::Execution(message) => AppError::Internal(message).into_response(),
    }
}

async fn run_block(
    State(state): State<AppState>,
    Principal(user_id): Principal,
    Json(payload): Json<RunBlockRequest>,
) -> Result<Response, AppError> {
    let block = state
        .inner
        .registry
        .get(&payload.block_id)
        .ok_or_else(|| AppError::NotFound(format!("block not found: {}", payload.block_id)))?;

    let demo_mode = state.demo_mode().await;
    let gated = GatedBlockRunner::new(
        &state.inner.runner,
        &state.inner.ledger,
        &state.inner.entitlements,
        user_id,
        demo_mode,
    );

    match gated.run_block(block, &payload.inputs).await {
        Ok(outputs) => Ok(Json(json!({"success": true, "outputs": outputs})).into_response()),
        Err(err) => Ok(block_run_error_response(err)),
    }
}

// ─── Evaluator sessions ──────────────────────────────────────────────────────

fn parse_graph_document(
    nodes: serde_json::Value,
    edges: serde_json::Value,
) -> Result<FlowGraph, AppError> {
    let edges = if edges.is_null() {
        serde_json::Value::Array(Vec::new())
    } else {
        edges
    };

    serde_json::from_value(json!({"nodes": nodes, "edges": edges}))
        .map_err(|err| AppError::BadRequest(err.to_string()))
}

fn execution_error_response(err: ExecutionError) -> AppError {
    match err {
        ExecutionError::Cycle => AppError::BadRequest("workflow has a cycle".to_string()),
        ExecutionError::UnknownBlock { .. } => AppError::BadRequest(err.to_string()),
        ExecutionError::AlreadyRunning | ExecutionError::Superseded => {
            AppError::Conflict(err.to_string())
        }
        ExecutionError::MissingEntryInput { .. } => AppError::BadRequest(err.to_string()),
    }
}

async fn create_session(State(state): State<AppState>) -> (StatusCode, Json<CreateSessionResponse>) {
    let session_id = Uuid::new_v4().to_string();
    state
        .inner
        .sessions
        .insert(session_id.clone(), Arc::new(Mutex::new(FlowSession::new())));

    info!(session_id = %session_id, "Session created");
    (
        StatusCode::CREATED,
        Json(CreateSessionResponse { session_id }),
    )
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let (_, session) = state
        .inner
        .sessions
        .remove(&id)
        .ok_or_else(|| AppError::NotFound(format!("session not found: {id}")))?;

    // Invalidate any in-flight run so late results are discarded.
    if let Ok(mut guard) = session.try_lock() {
        guard.supersede_active_run();
    }

    Ok(StatusCode::NO_CONTENT)
}

async fn plan_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<GraphDocumentRequest>,
) -> Result<Json<RunPlan>, AppError> {
    let session = state.session(&id)?;
    let graph = parse_graph_document(payload.nodes, payload.edges)?;

    let executor = FlowExecutor::new(&state.inner.registry);
    let plan = executor.plan(&graph).map_err(execution_error_response)?;

    let mut guard = session.lock().await;
    if plan.entry_inputs.is_empty() {
        guard.cancel_pending();
    } else {
        guard.mark_awaiting_input();
    }

    Ok(Json(plan))
}

async fn run_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Principal(user_id): Principal,
    Json(payload): Json<RunSessionRequest>,
) -> Result<Json<RunSessionResponse>, AppError> {
    let session = state.session(&id)?;
    let graph = parse_graph_document(payload.nodes, payload.edges)?;

    // A session supports one in-flight run; concurrent triggers bounce.
    let Ok(mut guard) = session.try_lock() else {
        return Err(AppError::Conflict(
            "a run is already in progress for this session".to_string(),
        ));
    };

    let demo_mode = state.demo_mode().await;
    let policy = state.upstream_policy().await;
    let executor = FlowExecutor::with_policy(&state.inner.registry, policy);
    let gated = GatedBlockRunner::new(
        &state.inner.runner,
        &state.inner.ledger,
        &state.inner.entitlements,
        user_id,
        demo_mode,
    );

    let report = executor
        .run(&mut guard, &graph, &gated, &payload.entry_values)
        .await
        .map_err(execution_error_response)?;

    let outputs = serde_json::to_value(guard.cache().snapshot())
        .map_err(|err| AppError::Internal(err.to_string()))?;

    Ok(Json(RunSessionResponse {
        status: report.state,
        executed: report.executed,
        error: report.failure.as_ref().map(|failure| failure.error.clone()),
        failed_node: report.failure,
        outputs,
    }))
}

async fn get_session_outputs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let session = state.session(&id)?;
    let guard = session.lock().await;

    let outputs = serde_json::to_value(guard.cache().snapshot())
        .map_err(|err| AppError::Internal(err.to_string()))?;
    Ok(Json(outputs))
}

async fn clear_session_outputs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let session = state.session(&id)?;
    let mut guard = session.lock().await;
    guard.clear_outputs();
    Ok(StatusCode::NO_CONTENT)
}

// ─── Workflow persistence ────────────────────────────────────────────────────

async fn create_workflow(
    State(state): State<AppState>,
    Principal(user_id): Principal,
    Json(payload): Json<CreateWorkflowRequest>,
) -> Result<(StatusCode, Json<crate::workflows::WorkflowRecord>), AppError> {
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("workflow name is required".to_string()));
    }

    let record = state.workflow_store()?.create(
        &user_id,
        name,
        payload.description.as_deref(),
        payload.definition,
    )?;

    info!(workflow_id = %record.id, owner_id = %user_id, "Workflow created");
    Ok((StatusCode::CREATED, Json(record)))
}

async fn list_workflows(
    State(state): State<AppState>,
    _principal: Principal,
    Query(query): Query<ListWorkflowsQuery>,
) -> Result<Json<crate::workflows::WorkflowPage>, AppError> {
    let cursor = query
        .cursor
        .as_deref()
        .map(str::trim)
        .filter(|cursor| !cursor.is_empty());
    let page = state.workflow_store()?.list(query.limit, cursor)?;
    Ok(Json(page))
}

async fn get_workflow(
    State(state): State<AppState>,
    _principal: Principal,
    Path(id): Path<String>,
) -> Result<Json<crate::workflows::WorkflowRecord>, AppError> {
    let record = state.workflow_store()?.get(&id)?;
    Ok(Json(record))
}

async fn patch_workflow(
    State(state): State<AppState>,
    Principal(user_id): Principal,
    Path(id): Path<String>,
    Json(patch): Json<WorkflowPatch>,
) -> Result<Json<crate::workflows::WorkflowRecord>, AppError> {
    let record = state.workflow_store()?.update(&user_id, &id, patch)?;
    Ok(Json(record))
}

async fn delete_workflow(
    State(state): State<AppState>,
    Principal(user_id): Principal,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.workflow_store()?.delete(&user_id, &id)?;
    info!(workflow_id = %id, owner_id = %user_id, "Workflow deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ─── Billing glue ────────────────────────────────────────────────────────────

async fn get_entitlements(
    State(state): State<AppState>,
    Principal(user_id): Principal,
) -> Json<serde_json::Value> {
    let access = state
        .inner
        .entitlements
        .snapshot_for(&user_id, &state.inner.registry);
    Json(json!({ "entitlements": access }))
}

async fn get_tokens(
    State(state): State<AppState>,
    Principal(user_id): Principal,
) -> Json<serde_json::Value> {
    let account = state.inner.ledger.account(&user_id);
    Json(json!({
        "balance": account.balance,
        "subscription": account.subscription.map(|sub| json!({
            "interval": sub.interval,
            "last_refresh": account.last_refresh,
        })),
    }))
}

async fn get_token_products() -> Json<serde_json::Value> {
    Json(json!({
        "packs": TOKEN_PACKS,
        "subscriptions": TOKEN_SUBSCRIPTIONS,
    }))
}

async fn purchase_tokens(
    State(state): State<AppState>,
    Principal(user_id): Principal,
    Json(payload): Json<PurchaseRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let product = token_product_by_price_slug(&payload.price_slug)
        .ok_or_else(|| AppError::BadRequest("invalid token product".to_string()))?;

    if !state.demo_mode().await {
        return Err(AppError::BadGateway(
            "billing provider not configured".to_string(),
        ));
    }

    let tokens = product.tokens_per_purchase();
    let new_balance = state.inner.ledger.credit(
        &user_id,
        tokens,
        &format!("demo purchase: {}", payload.price_slug),
    );
    if let TokenProduct::Subscription(sub) = &product {
        state
            .inner
            .ledger
            .set_subscription(&user_id, &format!("demo-{}", sub.id), sub.interval, 0);
    }

    Ok(Json(json!({
        "demo_mode": true,
        "tokens_added": tokens,
        "new_balance": new_balance,
    })))
}

async fn credit_tokens(
    State(state): State<AppState>,
    Principal(user_id): Principal,
    Json(payload): Json<CreditRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if payload.amount == 0 {
        return Err(AppError::BadRequest(
            "amount must be a positive number".to_string(),
        ));
    }

    let new_balance = state.inner.ledger.credit(
        &user_id,
        payload.amount,
        payload.reason.as_deref().unwrap_or("manual"),
    );
    Ok(Json(json!({ "success": true, "new_balance": new_balance })))
}

async fn create_checkout(
    State(state): State<AppState>,
    Principal(user_id): Principal,
    Json(payload): Json<PurchaseRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let price_slug = payload.price_slug.trim();
    if price_slug.is_empty() {
        return Err(AppError::BadRequest("price_slug is required".to_string()));
    }

    if !state.demo_mode().await {
        return Err(AppError::BadGateway(
            "billing provider not configured".to_string(),
        ));
    }

    // Demo mode settles immediately: credit token products, unlock blocks.
    if let Some(product) = token_product_by_price_slug(price_slug) {
        state.inner.ledger.credit(
            &user_id,
            product.tokens_per_purchase(),
            &format!("demo checkout: {price_slug}"),
        );
    } else if let Some(block) = state
        .inner
        .registry
        .all()
        .into_iter()
        .find(|block| block.price_slug == price_slug)
    {
        state.inner.entitlements.grant(&user_id, &block.feature_slug);
    } else {
        return Err(AppError::BadRequest(format!(
            "unknown price slug: {price_slug}"
        )));
    }

    Ok(Json(json!({
        "checkout_session": {
            "id": Uuid::new_v4().to_string(),
            "url": payload.success_url,
            "demo_mode": true,
        }
    })))
}

async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let secret = state.inner.config.read().await.billing.webhook_secret.clone();
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let event = verify_webhook(&body, signature, secret.as_deref()).map_err(|err| match err {
        WebhookError::MissingSecret => AppError::Internal(err.to_string()),
        other => AppError::BadRequest(other.to_string()),
    })?;

    if !state.inner.webhook_idempotency.record(&event.id) {
        info!(event_id = %event.id, "Duplicate webhook delivery acknowledged");
        return Ok(Json(json!({ "received": true, "duplicate": true })));
    }

    handle_event(
        &event,
        &state.inner.ledger,
        &state.inner.entitlements,
        &state.inner.registry,
    );

    Ok(Json(json!({ "received": true })))
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    UnprocessableEntity(String),
    BadGateway(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::UnprocessableEntity(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{err:#}"))
    }
}

impl From<WorkflowStoreError> for AppError {
    fn from(err: WorkflowStoreError) -> Self {
        match err {
            WorkflowStoreError::NotFound => AppError::NotFound("workflow not found".to_string()),
            WorkflowStoreError::Includes(kind) => AppError::UnprocessableEntity(kind.to_string()),
            WorkflowStoreError::Storage(inner) => AppError::Internal(format!("{inner:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BillingConfig;
    use crate::tokens::DEFAULT_BALANCE;
    use crate::webhook::sign_body;
    use axum::body::Body;
    use axum::http::Request;
    use tower::{Service, ServiceExt};

    const TEST_USER: &str = "demo-user-1";
    const TEST_SECRET: &str = "whsec_test";

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("{prefix}-{}-{timestamp}", std::process::id()))
    }

    fn test_state_with_config(config: AppConfig) -> AppState {
        let data_dir = unique_temp_dir("blockflow-server-test");
        let config_path = crate::config::config_path(&data_dir);
        app_state_with_config(config, config_path, data_dir)
    }

    fn test_state() -> AppState {
        let config = AppConfig {
            billing: BillingConfig {
                demo_mode: true,
                webhook_secret: Some(TEST_SECRET.to_string()),
            },
            ..AppConfig::default()
        };
        test_state_with_config(config)
    }

    fn test_router() -> Router {
        app_router(test_state())
    }

    async fn send_request(router: &mut Router, request: Request<Body>) -> Response {
        router
            .as_service()
            .ready()
            .await
            .unwrap()
            .call(request)
            .await
            .unwrap()
    }

    fn json_request(method: &str, uri: &str, body: &serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .header(PRINCIPAL_HEADER, TEST_USER)
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(PRINCIPAL_HEADER, TEST_USER)
            .body(Body::empty())
            .unwrap()
    }

    async fn response_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn constant_summarize_document() -> serde_json::Value {
        serde_json::json!({
            "nodes": [
                {"id": "const", "block_type": "constant", "label": "Constant"},
                {"id": "sum", "block_type": "summarize-text", "label": "Summarize Text"}
            ],
            "edges": [
                {"source": "const", "source_output": "value", "target": "sum", "target_input": "text"}
            ]
        })
    }

    async fn create_test_session(router: &mut Router) -> String {
        let resp = send_request(
            router,
            json_request("POST", "/api/sessions", &serde_json::json!({})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        response_json(resp).await["session_id"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let mut app = test_router();
        let resp = send_request(
            &mut app,
            Request::builder()
                .uri("/api/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(response_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_unknown_api_route_is_404() {
        let mut app = test_router();
        let resp = send_request(&mut app, get_request("/api/does-not-exist")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_config_get_and_put() {
        let state = test_state();
        let config_path = state.inner.config_path.clone();
        let mut app = app_router(state);

        let resp = send_request(&mut app, get_request("/api/config")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let config: AppConfig = serde_json::from_value(response_json(resp).await).unwrap();
        assert_eq!(config.server.port, 4000);

        let updated = AppConfig {
            server: crate::config::ServerConfig {
                port: 4321,
                host: "127.0.0.1".to_string(),
            },
            ..config
        };
        let resp = send_request(
            &mut app,
            json_request("PUT", "/api/config", &serde_json::to_value(&updated).unwrap()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = send_request(&mut app, get_request("/api/config")).await;
        let reloaded: AppConfig = serde_json::from_value(response_json(resp).await).unwrap();
        assert_eq!(reloaded.server.port, 4321);

        assert!(config_path.exists());
        let _ = std::fs::remove_file(config_path);
    }

    #[tokio::test]
    async fn test_list_blocks_returns_catalog() {
        let mut app = test_router();
        let resp = send_request(&mut app, get_request("/api/blocks")).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let blocks = response_json(resp).await;
        let blocks = blocks.as_array().unwrap();
        assert_eq!(blocks.len(), 10);
        assert!(blocks.iter().any(|b| b["id"] == "summarize-text"));
    }

    #[tokio::test]
    async fn test_run_block_requires_principal() {
        let mut app = test_router();
        let resp = send_request(
            &mut app,
            Request::builder()
                .method("POST")
                .uri("/api/run-block")
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({"block_id": "trigger", "inputs": {}}).to_string(),
                ))
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_run_block_unknown_block_is_404() {
        let mut app = test_router();
        let resp = send_request(
            &mut app,
            json_request(
                "POST",
                "/api/run-block",
                &serde_json::json!({"block_id": "merge-pdfs", "inputs": {}}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_run_block_free_utility_succeeds() {
        let mut app = test_router();
        let resp = send_request(
            &mut app,
            json_request(
                "POST",
                "/api/run-block",
                &serde_json::json!({
                    "block_id": "text-join",
                    "inputs": {"text1": "hello", "text2": "world"}
                }),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = response_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["outputs"]["combined"], "hello world");
    }

    #[tokio::test]
    async fn test_run_block_charges_tokens_in_demo_mode() {
        let state = test_state();
        let mut app = app_router(state.clone());

        let resp = send_request(
            &mut app,
            json_request(
                "POST",
                "/api/run-block",
                &serde_json::json!({"block_id": "summarize-text", "inputs": {"text": "hi"}}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.inner.ledger.balance(TEST_USER), DEFAULT_BALANCE - 1);
    }

    #[tokio::test]
    async fn test_run_block_locked_payload() {
        let config = AppConfig {
            billing: BillingConfig {
                demo_mode: false,
                webhook_secret: None,
            },
            ..AppConfig::default()
        };
        let mut app = app_router(test_state_with_config(config));

        let resp = send_request(
            &mut app,
            json_request(
                "POST",
                "/api/run-block",
                &serde_json::json!({"block_id": "summarize-text", "inputs": {"text": "hi"}}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let body = response_json(resp).await;
        assert_eq!(body["error"], "Block locked");
        assert_eq!(body["feature_slug"], "summarize_text");
        assert_eq!(body["price_slug"], "summarize_text");
    }

    #[tokio::test]
    async fn test_run_block_insufficient_balance_payload() {
        let state = test_state();
        state
            .inner
            .ledger
            .deduct(TEST_USER, DEFAULT_BALANCE)
            .expect("drain balance");
        let mut app = app_router(state);

        let resp = send_request(
            &mut app,
            json_request(
                "POST",
                "/api/run-block",
                &serde_json::json!({"block_id": "summarize-text", "inputs": {"text": "hi"}}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);

        let body = response_json(resp).await;
        assert_eq!(body["token_cost"], 1);
        assert_eq!(body["current_balance"], 0);
        assert_eq!(body["needs_purchase"], true);
    }

    #[tokio::test]
    async fn test_session_plan_and_run_flow() {
        let mut app = test_router();
        let session_id = create_test_session(&mut app).await;

        // Plan: run order plus the constant's unwired input as entry field.
        let resp = send_request(
            &mut app,
            json_request(
                "POST",
                &format!("/api/sessions/{session_id}/plan"),
                &constant_summarize_document(),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let plan = response_json(resp).await;
        assert_eq!(plan["order"], serde_json::json!(["const", "sum"]));
        assert_eq!(plan["entry_inputs"].as_array().unwrap().len(), 1);
        assert_eq!(plan["entry_inputs"][0]["label"], "Constant: Value");

        // Run with the entry value supplied.
        let mut run_body = constant_summarize_document();
        run_body["entry_values"] = serde_json::json!({"const": {"value": "hello"}});
        let resp = send_request(
            &mut app,
            json_request(
                "POST",
                &format!("/api/sessions/{session_id}/run"),
                &run_body,
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let run = response_json(resp).await;
        assert_eq!(run["status"], "completed");
        assert_eq!(run["executed"], serde_json::json!(["const", "sum"]));
        assert_eq!(run["outputs"]["const"]["value"], "hello");
        assert!(run["outputs"]["sum"]["summary"].is_string());

        // Cached outputs are readable and clearable.
        let resp = send_request(
            &mut app,
            get_request(&format!("/api/sessions/{session_id}/outputs")),
        )
        .await;
        let outputs = response_json(resp).await;
        assert_eq!(outputs["const"]["value"], "hello");

        let resp = send_request(
            &mut app,
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/sessions/{session_id}/outputs"))
                .header(PRINCIPAL_HEADER, TEST_USER)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = send_request(
            &mut app,
            get_request(&format!("/api/sessions/{session_id}/outputs")),
        )
        .await;
        assert_eq!(response_json(resp).await, serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_session_run_missing_entry_input_is_400() {
        let mut app = test_router();
        let session_id = create_test_session(&mut app).await;

        let resp = send_request(
            &mut app,
            json_request(
                "POST",
                &format!("/api/sessions/{session_id}/run"),
                &constant_summarize_document(),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = response_json(resp).await;
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("required input 'Constant: Value' is empty"));
    }

    #[tokio::test]
    async fn test_session_plan_cycle_is_400() {
        let mut app = test_router();
        let session_id = create_test_session(&mut app).await;

        let document = serde_json::json!({
            "nodes": [
                {"id": "a", "block_type": "rewrite-prompt"},
                {"id": "b", "block_type": "rewrite-prompt"}
            ],
            "edges": [
                {"source": "a", "source_output": "rewritten", "target": "b", "target_input": "text"},
                {"source": "b", "source_output": "rewritten", "target": "a", "target_input": "text"}
            ]
        });

        let resp = send_request(
            &mut app,
            json_request(
                "POST",
                &format!("/api/sessions/{session_id}/plan"),
                &document,
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response_json(resp).await["error"], "workflow has a cycle");
    }

    #[tokio::test]
    async fn test_session_run_conflicts_while_locked() {
        let state = test_state();
        let mut app = app_router(state.clone());
        let session_id = create_test_session(&mut app).await;

        let session = state.session(&session_id).expect("session exists");
        let _guard = session.try_lock().expect("lock for test");

        let resp = send_request(
            &mut app,
            json_request(
                "POST",
                &format!("/api/sessions/{session_id}/run"),
                &serde_json::json!({"nodes": [], "edges": []}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_session_empty_graph_completes_immediately() {
        let mut app = test_router();
        let session_id = create_test_session(&mut app).await;

        let resp = send_request(
            &mut app,
            json_request(
                "POST",
                &format!("/api/sessions/{session_id}/run"),
                &serde_json::json!({"nodes": [], "edges": []}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = response_json(resp).await;
        assert_eq!(body["status"], "completed");
        assert_eq!(body["executed"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_deleted_session_is_gone() {
        let mut app = test_router();
        let session_id = create_test_session(&mut app).await;

        let resp = send_request(
            &mut app,
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/sessions/{session_id}"))
                .header(PRINCIPAL_HEADER, TEST_USER)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = send_request(
            &mut app,
            get_request(&format!("/api/sessions/{session_id}/outputs")),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_workflow_crud_and_include_cycle() {
        let mut app = test_router();

        let resp = send_request(
            &mut app,
            json_request("POST", "/api/workflows", &serde_json::json!({"name": "W1"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let w1 = response_json(resp).await;
        let w1_id = w1["id"].as_str().unwrap().to_string();

        let resp = send_request(
            &mut app,
            json_request("POST", "/api/workflows", &serde_json::json!({"name": "W2"})),
        )
        .await;
        let w2 = response_json(resp).await;
        let w2_id = w2["id"].as_str().unwrap().to_string();

        // W1 includes W2.
        let resp = send_request(
            &mut app,
            json_request(
                "PATCH",
                &format!("/api/workflows/{w1_id}"),
                &serde_json::json!({"includes": [w2_id]}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        // Closing the cycle is rejected with no partial persistence.
        let resp = send_request(
            &mut app,
            json_request(
                "PATCH",
                &format!("/api/workflows/{w2_id}"),
                &serde_json::json!({"includes": [w1_id]}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(response_json(resp).await["error"]
            .as_str()
            .unwrap()
            .contains("circular"));

        let resp = send_request(&mut app, get_request(&format!("/api/workflows/{w2_id}"))).await;
        assert_eq!(
            response_json(resp).await["includes"],
            serde_json::json!([])
        );

        // Self-reference is rejected too.
        let resp = send_request(
            &mut app,
            json_request(
                "PATCH",
                &format!("/api/workflows/{w1_id}"),
                &serde_json::json!({"includes": [w1_id]}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        // Delete and confirm 404.
        let resp = send_request(
            &mut app,
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/workflows/{w1_id}"))
                .header(PRINCIPAL_HEADER, TEST_USER)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = send_request(&mut app, get_request(&format!("/api/workflows/{w1_id}"))).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_workflow_list_paginates() {
        let mut app = test_router();
        for name in ["first", "second", "third"] {
            let resp = send_request(
                &mut app,
                json_request("POST", "/api/workflows", &serde_json::json!({"name": name})),
            )
            .await;
            assert_eq!(resp.status(), StatusCode::CREATED);
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let resp = send_request(&mut app, get_request("/api/workflows?limit=2")).await;
        let page = response_json(resp).await;
        assert_eq!(page["workflows"].as_array().unwrap().len(), 2);
        assert_eq!(page["workflows"][0]["name"], "third");
        let cursor = page["next_cursor"].as_str().unwrap().to_string();

        let resp = send_request(
            &mut app,
            get_request(&format!("/api/workflows?limit=2&cursor={}", urlencode(&cursor))),
        )
        .await;
        let page = response_json(resp).await;
        assert_eq!(page["workflows"].as_array().unwrap().len(), 1);
        assert_eq!(page["workflows"][0]["name"], "first");
        assert!(page["next_cursor"].is_null());
    }

    fn urlencode(raw: &str) -> String {
        raw.replace('+', "%2B").replace(':', "%3A")
    }

    #[tokio::test]
    async fn test_checkout_unlocks_block_in_demo_mode() {
        let mut app = test_router();

        let resp = send_request(&mut app, get_request("/api/entitlements")).await;
        let before = response_json(resp).await;
        assert_eq!(before["entitlements"]["summarize_text"], false);

        let resp = send_request(
            &mut app,
            json_request(
                "POST",
                "/api/checkout",
                &serde_json::json!({
                    "price_slug": "summarize_text",
                    "success_url": "http://localhost/success",
                    "cancel_url": "http://localhost/cancel"
                }),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = response_json(resp).await;
        assert_eq!(body["checkout_session"]["demo_mode"], true);

        let resp = send_request(&mut app, get_request("/api/entitlements")).await;
        let after = response_json(resp).await;
        assert_eq!(after["entitlements"]["summarize_text"], true);
    }

    #[tokio::test]
    async fn test_token_purchase_credits_in_demo_mode() {
        let mut app = test_router();

        let resp = send_request(
            &mut app,
            json_request(
                "POST",
                "/api/tokens/purchase",
                &serde_json::json!({"price_slug": "starter_pack"}),
            ),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = response_json(resp).await;
        assert_eq!(body["tokens_added"], 100);
        assert_eq!(body["new_balance"], DEFAULT_BALANCE + 100);

        let resp = send_request(&mut app, get_request("/api/tokens")).await;
        assert_eq!(response_json(resp).await["balance"], DEFAULT_BALANCE + 100);
    }

    #[tokio::test]
    async fn test_token_products_listing() {
        let mut app = test_router();
        let resp = send_request(&mut app, get_request("/api/tokens/products")).await;
        let body = response_json(resp).await;
        assert_eq!(body["packs"].as_array().unwrap().len(), 2);
        assert_eq!(body["subscriptions"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_webhook_verifies_and_deduplicates() {
        let state = test_state();
        let mut app = app_router(state.clone());

        let body = serde_json::to_vec(&serde_json::json!({
            "id": "evt_1",
            "type": "payment.succeeded",
            "customer": {"id": "cus_1", "external_id": TEST_USER},
            "price_slug": "starter_pack",
        }))
        .unwrap();
        let signature = sign_body(&body, TEST_SECRET);

        let webhook_request = |body: Vec<u8>, signature: &str| {
            Request::builder()
                .method("POST")
                .uri("/api/webhook")
                .header("content-type", "application/json")
                .header(SIGNATURE_HEADER, signature)
                .body(Body::from(body))
                .unwrap()
        };

        let resp = send_request(&mut app, webhook_request(body.clone(), &signature)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.inner.ledger.balance(TEST_USER), DEFAULT_BALANCE + 100);

        // Redelivery acknowledges without reprocessing.
        let resp = send_request(&mut app, webhook_request(body.clone(), &signature)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(response_json(resp).await["duplicate"], true);
        assert_eq!(state.inner.ledger.balance(TEST_USER), DEFAULT_BALANCE + 100);

        // A bad signature changes nothing.
        let resp = send_request(&mut app, webhook_request(body, "sha256=deadbeef")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
