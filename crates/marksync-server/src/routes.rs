//! HTTP 路由
//!
//! 除 /health 与 /version 外全部要求 Bearer 令牌与 `x-user-id` 头；
//! /sync 额外要求 `x-device-id`，浏览器标识经 `x-browser-type` 可选携带。

use axum::extract::{Path, Query, Request, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use marksync::store::{ActivityFilter, ActivityPage, OperationStore};
use marksync::types::{BrowserType, Conflict, PendingModeration, PersistedOperation, SyncOperation};
use marksync::moderation::{ModerationDecision, ModerationSubmission};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::flow::{self, submit_operations};
use crate::state::AppState;
use crate::ws;

/// 鉴权通过后挂在请求扩展里的用户身份
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: String,
}

pub fn app_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/sync", post(sync))
        .route("/clear-operations", post(clear_operations))
        .route("/activity", get(activity))
        .route("/canonical", get(get_canonical).post(set_canonical))
        .route("/moderation/queue", post(moderation_queue))
        .route("/moderation/pending", get(moderation_pending))
        .route("/moderation/accept-all", post(moderation_accept_all))
        .route("/moderation/reject-all", post(moderation_reject_all))
        .route("/moderation/{id}/accept", post(moderation_accept))
        .route("/moderation/{id}/reject", post(moderation_reject))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/ws", get(ws::ws_upgrade))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

// ========== 鉴权 ==========

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// 校验共享令牌；未配置令牌时仅要求 `x-user-id`
pub fn check_token(expected: Option<&str>, presented: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(expected) => presented == Some(expected),
    }
}

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(request.headers());
    if !check_token(state.config.token.as_deref(), token) {
        return Err(ApiError::unauthorized("令牌缺失或不匹配"));
    }
    let user_id = request
        .headers()
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::unauthorized("缺少 x-user-id 头"))?
        .to_string();
    request.extensions_mut().insert(AuthenticatedUser { user_id });
    Ok(next.run(request).await)
}

fn device_header(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-device-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::bad_request("缺少 x-device-id 头"))
}

fn browser_header(headers: &HeaderMap) -> Result<Option<BrowserType>, ApiError> {
    match headers.get("x-browser-type").and_then(|v| v.to_str().ok()) {
        Some(raw) if !raw.is_empty() => Ok(Some(BrowserType::parse(raw)?)),
        _ => Ok(None),
    }
}

// ========== 同步 ==========

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncRequest {
    #[serde(default)]
    operations: Vec<SyncOperation>,
    #[serde(default)]
    last_sync_version: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncResponse {
    success: bool,
    operations: Vec<PersistedOperation>,
    last_sync_version: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    conflicts: Vec<Conflict>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    queued_for_moderation: Vec<PendingModeration>,
}

async fn sync(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    headers: HeaderMap,
    Json(request): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, ApiError> {
    let device_id = device_header(&headers)?;
    let browser = browser_header(&headers)?;
    let result = submit_operations(
        &state,
        &user.user_id,
        &device_id,
        browser,
        request.operations,
        request.last_sync_version,
    )
    .await?;
    Ok(Json(SyncResponse {
        success: result.outcome.accepted,
        operations: result.outcome.delta,
        last_sync_version: result.outcome.new_version,
        conflicts: result.outcome.conflicts,
        queued_for_moderation: result.queued,
    }))
}

#[derive(Debug, Serialize)]
struct ClearResponse {
    cleared: usize,
}

async fn clear_operations(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<ClearResponse>, ApiError> {
    let cleared = state.store.clear_user(&user.user_id).await?;
    tracing::info!("操作日志已清空: user_id={}, cleared={}", user.user_id, cleared);
    Ok(Json(ClearResponse { cleared }))
}

async fn activity(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(filter): Query<ActivityFilter>,
) -> Result<Json<ActivityPage>, ApiError> {
    let page = state.store.activity(&user.user_id, &filter).await?;
    Ok(Json(page))
}

// ========== 主控设备 ==========

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalBody {
    device_id: Option<String>,
}

async fn get_canonical(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<CanonicalBody>, ApiError> {
    let device_id = state.moderation.canonical_device(&user.user_id).await?;
    Ok(Json(CanonicalBody { device_id }))
}

async fn set_canonical(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(body): Json<CanonicalBody>,
) -> Result<Json<CanonicalBody>, ApiError> {
    let device_id = body
        .device_id
        .filter(|d| !d.is_empty())
        .ok_or_else(|| ApiError::bad_request("deviceId 不能为空"))?;
    state
        .moderation
        .set_canonical_device(&user.user_id, &device_id)
        .await?;
    Ok(Json(CanonicalBody {
        device_id: Some(device_id),
    }))
}

// ========== 审核 ==========

async fn moderation_queue(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    headers: HeaderMap,
    Json(submission): Json<ModerationSubmission>,
) -> Result<Json<PendingModeration>, ApiError> {
    let device_id = device_header(&headers)?;
    let entry = state
        .moderation
        .queue(&user.user_id, &device_id, submission)
        .await?;
    Ok(Json(entry))
}

async fn moderation_pending(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Json<Vec<PendingModeration>> {
    Json(state.moderation.pending(&user.user_id).await)
}

/// 裁决响应：已处理条目与后续操作的数量
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DecisionResponse {
    decided: Vec<PendingModeration>,
    follow_ups: usize,
}

async fn apply_decisions(
    state: &AppState,
    user_id: &str,
    decisions: Vec<ModerationDecision>,
) -> Result<DecisionResponse, ApiError> {
    let mut decided = Vec::with_capacity(decisions.len());
    let mut follow_ups = 0;
    let mut iter = decisions.into_iter();
    while let Some(ModerationDecision { entry, follow_up }) = iter.next() {
        if let Some(op) = follow_up {
            if let Err(e) = flow::apply_follow_up(state, user_id, op, entry.browser).await {
                // 后续操作落库失败：本条连同尚未处理的条目放回待审队列，
                // 裁决动作可整体重试
                let mut undecided = vec![entry];
                undecided.extend(iter.map(|d| d.entry));
                state.moderation.restore(user_id, undecided).await;
                return Err(e.into());
            }
            follow_ups += 1;
        }
        decided.push(entry);
    }
    Ok(DecisionResponse {
        decided,
        follow_ups,
    })
}

async fn moderation_accept(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> Result<Json<DecisionResponse>, ApiError> {
    let decision = state.moderation.accept(&user.user_id, &id).await?;
    Ok(Json(apply_decisions(&state, &user.user_id, vec![decision]).await?))
}

async fn moderation_reject(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> Result<Json<DecisionResponse>, ApiError> {
    let decision = state.moderation.reject(&user.user_id, &id).await?;
    Ok(Json(apply_decisions(&state, &user.user_id, vec![decision]).await?))
}

async fn moderation_accept_all(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<DecisionResponse>, ApiError> {
    let decisions = state.moderation.accept_all(&user.user_id).await;
    Ok(Json(apply_decisions(&state, &user.user_id, decisions).await?))
}

async fn moderation_reject_all(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<DecisionResponse>, ApiError> {
    let decisions = state.moderation.reject_all(&user.user_id).await;
    Ok(Json(apply_decisions(&state, &user.user_id, decisions).await?))
}

// ========== 健康与版本 ==========

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    online_devices: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp_millis(),
        online_devices: state.registry.online_count(),
    })
}

#[derive(Debug, Serialize)]
struct VersionResponse {
    version: String,
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: marksync::version::version_string(),
    })
}
