use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::Json,
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::debug;

use crate::access::CallContext;
use crate::custody::VerifyRequest;
use crate::error::{CustodyError, CustodyResult};
use crate::evidence::{BulkSubmissionResult, Category, EvidenceRecord, NewEvidence, Status};
use crate::export::ExportPackage;
use crate::ledger::LedgerProof;
use crate::notes::{LegalComment, NewLegalComment, NewVerificationNote, VerificationNote};
use crate::notification::{Notification, NotificationList};
use crate::query::{Cursor, EvidenceHistory, Page, PageRequest};
use crate::reputation::Reputation;
use crate::service::CustodyService;

// ==========================================
// 1. 应用状态 (Shared State)
// ==========================================
// 服务内部自带按证据 ID 的锁，这里不再需要外层 Mutex。
pub struct AppState {
    pub service: Arc<CustodyService>,
}

type ApiError = (StatusCode, String);

// ==========================================
// 2. 调用方身份 (Bearer Token)
// ==========================================

/// 从 `Authorization: Bearer <token>` 取出凭证；缺失时为匿名上下文，由授权层拒绝
pub struct Caller(pub CallContext);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ctx = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| CallContext::with_credential(token.trim()))
            .unwrap_or_else(CallContext::anonymous);
        Ok(Caller(ctx))
    }
}

// ==========================================
// 3. 数据传输对象 (DTOs)
// ==========================================

#[derive(Deserialize)]
pub struct BulkRequest {
    pub bulk_submission_id: String,
    pub items: Vec<NewEvidence>,
}

#[derive(Deserialize)]
pub struct AnchorRequest {
    pub tx_ref: String,
}

#[derive(Deserialize)]
pub struct ReviewRequest {
    /// false = 开始审查，true = 完成审查
    pub complete: bool,
}

#[derive(Deserialize)]
pub struct DateRangeParams {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub page_size: Option<u32>,
    pub cursor: Option<String>,
}

#[derive(Deserialize)]
pub struct CountParams {
    pub status: Option<Status>,
    pub category: Option<Category>,
}

#[derive(Serialize, Deserialize)]
pub struct CountResponse {
    pub count: u64,
}

#[derive(Serialize, Deserialize)]
pub struct LedgerRootResponse {
    pub root: Option<String>,
}

// ==========================================
// 4. API 路由构建
// ==========================================
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        // 提交方
        .route("/evidence", post(submit_evidence).get(list_all))
        .route("/bulk-submissions", post(submit_bulk))
        .route("/bulk-submissions/{bulk_id}", get(list_by_bulk_group))
        .route("/evidence/{id}/anchor", put(update_anchor))
        .route("/inbox/{fingerprint}", get(list_notifications))
        .route("/notifications/{id}/read", post(mark_notification_read))
        .route("/reputation/{fingerprint}", get(get_reputation))
        // 验证方
        .route("/evidence/{id}/verify", post(verify_integrity))
        .route("/evidence/{id}/notes", post(add_note).get(get_notes))
        // 法务方
        .route("/evidence/{id}/review", post(review_evidence))
        .route("/evidence/{id}/comments", post(add_comment).get(get_comments))
        .route("/evidence/{id}/export", post(export_evidence))
        .route("/query/date-range", get(query_by_date_range))
        // 任意组织
        .route("/evidence/{id}", get(get_evidence))
        .route("/evidence/{id}/history", get(get_history))
        .route("/query/status/{status}", get(list_by_status))
        .route("/query/category/{category}", get(list_by_category))
        .route("/query/count", get(count))
        .route("/ledger/root", get(ledger_root))
        .route("/ledger/proof/{pos}", get(ledger_proof))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()) // ⚠️ 开发模式：允许所有跨域
        .with_state(state)
}

fn reject(err: CustodyError) -> ApiError {
    let status = match &err {
        CustodyError::AccessDenied { .. } => StatusCode::FORBIDDEN,
        CustodyError::Identity(_) => StatusCode::UNAUTHORIZED,
        CustodyError::NotFound { .. } => StatusCode::NOT_FOUND,
        CustodyError::AlreadyExists { .. } | CustodyError::InvalidState { .. } => StatusCode::CONFLICT,
        CustodyError::Validation(_) => StatusCode::BAD_REQUEST,
        CustodyError::Store(_) | CustodyError::Codec(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

/// sled 读写是同步的，统一移到阻塞线程池执行
async fn blocking<T, F>(state: &AppState, op: F) -> Result<Json<T>, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&CustodyService) -> CustodyResult<T> + Send + 'static,
{
    let service = state.service.clone();
    tokio::task::spawn_blocking(move || op(&service))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Task join error: {}", e)))?
        .map(Json)
        .map_err(reject)
}

fn page_request(page_size: Option<u32>, cursor: Option<String>) -> PageRequest {
    PageRequest {
        page_size,
        cursor: cursor.map(Cursor::new),
    }
}

// ==========================================
// 5. 处理函数 (Handlers)
// ==========================================

async fn submit_evidence(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Json(req): Json<NewEvidence>,
) -> Result<(StatusCode, Json<EvidenceRecord>), ApiError> {
    debug!(evidence_id = %req.evidence_id, "📥 收到提交请求");
    let record = blocking(&state, move |svc| svc.submit_evidence(&ctx, req)).await?;
    Ok((StatusCode::CREATED, record))
}

async fn submit_bulk(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Json(req): Json<BulkRequest>,
) -> Result<(StatusCode, Json<BulkSubmissionResult>), ApiError> {
    debug!(bulk_submission_id = %req.bulk_submission_id, items = req.items.len(), "📥 收到批量提交请求");
    let result = blocking(&state, move |svc| {
        svc.submit_bulk(&ctx, &req.bulk_submission_id, req.items)
    })
    .await?;
    Ok((StatusCode::CREATED, result))
}

async fn update_anchor(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
    Json(req): Json<AnchorRequest>,
) -> Result<Json<EvidenceRecord>, ApiError> {
    blocking(&state, move |svc| svc.update_anchor(&ctx, &id, &req.tx_ref)).await
}

async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(fingerprint): Path<String>,
) -> Result<Json<NotificationList>, ApiError> {
    blocking(&state, move |svc| svc.list_notifications(&ctx, &fingerprint)).await
}

async fn mark_notification_read(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> Result<Json<Notification>, ApiError> {
    blocking(&state, move |svc| svc.mark_notification_read(&ctx, &id)).await
}

async fn get_reputation(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(fingerprint): Path<String>,
) -> Result<Json<Reputation>, ApiError> {
    blocking(&state, move |svc| svc.get_reputation(&ctx, &fingerprint)).await
}

async fn verify_integrity(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<EvidenceRecord>, ApiError> {
    debug!(evidence_id = %id, passed = req.passed, "🔍 收到验证请求");
    blocking(&state, move |svc| svc.verify_integrity(&ctx, &id, &req)).await
}

async fn add_note(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
    Json(req): Json<NewVerificationNote>,
) -> Result<(StatusCode, Json<VerificationNote>), ApiError> {
    let note = blocking(&state, move |svc| svc.add_verification_note(&ctx, &id, req)).await?;
    Ok((StatusCode::CREATED, note))
}

async fn get_notes(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> Result<Json<Vec<VerificationNote>>, ApiError> {
    blocking(&state, move |svc| svc.get_verification_notes(&ctx, &id)).await
}

async fn review_evidence(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
    Json(req): Json<ReviewRequest>,
) -> Result<Json<EvidenceRecord>, ApiError> {
    blocking(&state, move |svc| svc.review_evidence(&ctx, &id, req.complete)).await
}

async fn add_comment(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
    Json(req): Json<NewLegalComment>,
) -> Result<(StatusCode, Json<LegalComment>), ApiError> {
    let comment = blocking(&state, move |svc| svc.add_legal_comment(&ctx, &id, req)).await?;
    Ok((StatusCode::CREATED, comment))
}

async fn get_comments(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> Result<Json<Vec<LegalComment>>, ApiError> {
    blocking(&state, move |svc| svc.get_legal_comments(&ctx, &id)).await
}

async fn export_evidence(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> Result<Json<ExportPackage>, ApiError> {
    debug!(evidence_id = %id, "📦 收到导出请求");
    blocking(&state, move |svc| svc.export_evidence(&ctx, &id)).await
}

async fn query_by_date_range(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Query(params): Query<DateRangeParams>,
) -> Result<Json<Page<EvidenceRecord>>, ApiError> {
    let page = page_request(params.page_size, params.cursor);
    blocking(&state, move |svc| {
        svc.query_by_date_range(&ctx, params.from, params.to, &page)
    })
    .await
}

async fn get_evidence(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> Result<Json<EvidenceRecord>, ApiError> {
    blocking(&state, move |svc| svc.get_evidence(&ctx, &id)).await
}

async fn list_all(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Query(page): Query<PageRequest>,
) -> Result<Json<Page<EvidenceRecord>>, ApiError> {
    blocking(&state, move |svc| svc.list_all(&ctx, &page)).await
}

async fn list_by_status(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(status): Path<String>,
    Query(page): Query<PageRequest>,
) -> Result<Json<Page<EvidenceRecord>>, ApiError> {
    let status: Status = status.parse().map_err(reject)?;
    blocking(&state, move |svc| svc.list_by_status(&ctx, status, &page)).await
}

async fn list_by_category(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(category): Path<String>,
    Query(page): Query<PageRequest>,
) -> Result<Json<Page<EvidenceRecord>>, ApiError> {
    let category: Category = category.parse().map_err(reject)?;
    blocking(&state, move |svc| svc.list_by_category(&ctx, category, &page)).await
}

async fn list_by_bulk_group(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(bulk_id): Path<String>,
    Query(page): Query<PageRequest>,
) -> Result<Json<Page<EvidenceRecord>>, ApiError> {
    blocking(&state, move |svc| svc.list_by_bulk_group(&ctx, &bulk_id, &page)).await
}

async fn count(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Query(params): Query<CountParams>,
) -> Result<Json<CountResponse>, ApiError> {
    blocking(&state, move |svc| {
        svc.count(&ctx, params.status, params.category)
            .map(|count| CountResponse { count })
    })
    .await
}

async fn get_history(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> Result<Json<EvidenceHistory>, ApiError> {
    blocking(&state, move |svc| svc.get_history(&ctx, &id)).await
}

async fn ledger_root(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
) -> Result<Json<LedgerRootResponse>, ApiError> {
    blocking(&state, move |svc| {
        svc.ledger_root(&ctx).map(|root| LedgerRootResponse { root })
    })
    .await
}

/// 接口：获取账本包含性证明
async fn ledger_proof(
    State(state): State<Arc<AppState>>,
    Caller(ctx): Caller,
    Path(pos): Path<u64>,
) -> Result<Json<LedgerProof>, ApiError> {
    debug!(pos, "🔍 收到审计请求");
    blocking(&state, move |svc| svc.ledger_proof(&ctx, pos)).await
}
