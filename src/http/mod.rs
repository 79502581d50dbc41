//! REST API for the dashboard: pipeline triggers, record browsing,
//! settings, categories, and scheduler control.
//!
//! Failures are JSON `{ "error": … }` bodies with a matching status code.
//! Reprocess validation maps to 404 (unknown record), 409 (not an error
//! row), and 410 (message no longer on the server). Connection probes
//! always answer 200 and carry their verdict in `{ ok, message }`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, NaiveTime, Utc};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::analysis::Analyzer;
use crate::error::{DatabaseError, PipelineError, SchedulerError};
use crate::mailbox::Pop3Mailbox;
use crate::notion::NotionClient;
use crate::pipeline::Pipeline;
use crate::scheduler::Scheduler;
use crate::settings::{
    AiSettings, NotionSettings, Pop3Settings, SchedulerSettings, SettingsStore,
};
use crate::store::{
    CategoryStore, CategoryUpdate, NewCategory, RecordFilters, RecordStatus, RecordStore,
};

/// Rows returned by the recent-activity endpoint.
const RECENT_LIMIT: u32 = 10;

/// Application state shared across handlers.
///
/// The pipeline and scheduler are behind `Arc` because the scheduler holds
/// its own pipeline handle; the stores are cheap clones over one database.
/// The concrete mailbox, analyzer, and Notion client are kept alongside
/// the trait-object pipeline so the probe endpoints can reach
/// `test_connection`.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub scheduler: Arc<Scheduler>,
    pub records: RecordStore,
    pub categories: CategoryStore,
    pub settings: SettingsStore,
    pub mailbox: Arc<Pop3Mailbox>,
    pub analyzer: Analyzer,
    pub notion: NotionClient,
}

/// Build the API router. `frontend_origin` is the dashboard origin allowed
/// through CORS.
pub fn api_routes(state: AppState, frontend_origin: &str) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/api/pipeline/trigger", post(trigger_pipeline))
        .route("/api/pipeline/trigger/today", post(trigger_today))
        .route("/api/records", get(list_records))
        .route("/api/records/{id}/reprocess", post(reprocess_record))
        .route("/api/dashboard/stats", get(dashboard_stats))
        .route("/api/dashboard/recent", get(dashboard_recent))
        .route("/api/settings", get(get_settings))
        .route("/api/settings/{section}", put(update_settings))
        .route("/api/settings/test/pop3", post(test_pop3))
        .route("/api/settings/test/ai", post(test_ai))
        .route("/api/settings/test/notion", post(test_notion))
        .route(
            "/api/categories",
            get(list_categories).post(create_category),
        )
        .route(
            "/api/categories/{id}",
            put(update_category).delete(delete_category),
        )
        .route("/api/scheduler", get(scheduler_status))
        .route("/api/scheduler/start", post(start_scheduler))
        .route("/api/scheduler/stop", post(stop_scheduler))
        .with_state(state);

    match cors_layer(frontend_origin) {
        Some(cors) => router.layer(cors),
        None => router,
    }
}

/// CORS for the dashboard origin. Credentials are allowed, so the origin
/// must be exact rather than a wildcard.
fn cors_layer(origin: &str) -> Option<CorsLayer> {
    match origin.parse::<HeaderValue>() {
        Ok(origin) => Some(
            CorsLayer::new()
                .allow_origin(origin)
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
                .allow_headers([header::CONTENT_TYPE])
                .allow_credentials(true),
        ),
        Err(_) => {
            warn!(origin, "Invalid frontend origin, CORS disabled");
            None
        }
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "mailclerk"
    }))
}

// ── Pipeline ────────────────────────────────────────────────────────────

/// POST /api/pipeline/trigger
///
/// Run the classification pass over all unseen mail.
async fn trigger_pipeline(State(state): State<AppState>) -> impl IntoResponse {
    match state.pipeline.process_all().await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => pipeline_error(e),
    }
}

/// POST /api/pipeline/trigger/today
///
/// Run the digest pass over everything dated since UTC midnight.
async fn trigger_today(State(state): State<AppState>) -> impl IntoResponse {
    let since = Utc::now().date_naive().and_time(NaiveTime::MIN).and_utc();
    match state.pipeline.process_since(since).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => pipeline_error(e),
    }
}

/// POST /api/records/{id}/reprocess
///
/// Re-fetch, re-classify, and re-deliver a failed record, rewriting its
/// row in place.
async fn reprocess_record(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.pipeline.reprocess(id).await {
        Ok(outcome) => {
            let message = if outcome.is_requirement {
                format!("Email reprocessed and filed to Notion: {}", outcome.title)
            } else {
                format!("Not a requirement (category: {})", outcome.category)
            };
            Json(serde_json::json!({
                "message": message,
                "page_url": outcome.page_url,
            }))
            .into_response()
        }
        Err(e) => pipeline_error(e),
    }
}

// ── Records ─────────────────────────────────────────────────────────────

/// Raw query parameters for the records listing; everything arrives as a
/// string and is validated into [`RecordFilters`].
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RecordsQuery {
    status: Option<String>,
    category: Option<String>,
    date_from: Option<String>,
    date_to: Option<String>,
    page: Option<String>,
    limit: Option<String>,
}

fn parse_filters(query: RecordsQuery) -> Result<RecordFilters, String> {
    let mut filters = RecordFilters::default();

    if let Some(raw) = query.status {
        filters.status = Some(
            RecordStatus::from_str(&raw).ok_or_else(|| format!("Invalid status filter: {raw}"))?,
        );
    }
    filters.category = query.category;
    if let Some(raw) = query.date_from {
        filters.date_from = Some(parse_date(&raw, "date_from")?);
    }
    if let Some(raw) = query.date_to {
        filters.date_to = Some(parse_date(&raw, "date_to")?);
    }
    if let Some(raw) = query.page {
        filters.page = parse_number(&raw, "page")?;
    }
    if let Some(raw) = query.limit {
        filters.limit = parse_number(&raw, "limit")?;
    }
    Ok(filters)
}

fn parse_date(raw: &str, field: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| format!("Invalid {field}: expected an RFC 3339 timestamp"))
}

fn parse_number(raw: &str, field: &str) -> Result<u32, String> {
    raw.parse()
        .map_err(|_| format!("Invalid {field}: expected a positive integer"))
}

/// GET /api/records
///
/// Paged listing with optional status, category, and date filters.
async fn list_records(
    State(state): State<AppState>,
    Query(query): Query<RecordsQuery>,
) -> impl IntoResponse {
    let filters = match parse_filters(query) {
        Ok(filters) => filters,
        Err(message) => return bad_request(&message),
    };
    match state.records.find_all(&filters).await {
        Ok(page) => Json(page).into_response(),
        Err(e) => db_error(e),
    }
}

// ── Dashboard ───────────────────────────────────────────────────────────

async fn dashboard_stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.records.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => db_error(e),
    }
}

async fn dashboard_recent(State(state): State<AppState>) -> impl IntoResponse {
    match state.records.recent(RECENT_LIMIT).await {
        Ok(records) => Json(records).into_response(),
        Err(e) => db_error(e),
    }
}

// ── Settings ────────────────────────────────────────────────────────────

/// GET /api/settings
///
/// All sections with secrets masked.
async fn get_settings(State(state): State<AppState>) -> impl IntoResponse {
    match read_masked_settings(&state.settings).await {
        Ok(body) => Json(body).into_response(),
        Err(e) => db_error(e),
    }
}

async fn read_masked_settings(
    settings: &SettingsStore,
) -> Result<serde_json::Value, DatabaseError> {
    let pop3 = settings.pop3().await?.masked();
    let ai = settings.ai().await?.masked();
    let notion = settings.notion().await?.masked();
    let scheduler = settings.scheduler().await?;
    Ok(serde_json::json!({
        "pop3": pop3,
        "ai": ai,
        "notion": notion,
        "scheduler": scheduler,
    }))
}

/// PUT /api/settings/{section}
///
/// Replace one section. A sensitive field carrying the mask placeholder
/// keeps its stored value. Updating the scheduler section also applies
/// the change to the live ticker.
async fn update_settings(
    State(state): State<AppState>,
    Path(section): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    match section.as_str() {
        "pop3" => update_pop3(&state, body).await,
        "ai" => update_ai(&state, body).await,
        "notion" => update_notion(&state, body).await,
        "scheduler" => update_scheduler(&state, body).await,
        other => bad_request(&format!("Unknown settings section: {other}")),
    }
}

async fn update_pop3(state: &AppState, body: serde_json::Value) -> Response {
    let mut incoming: Pop3Settings = match serde_json::from_value(body) {
        Ok(value) => value,
        Err(e) => return bad_request(&format!("Invalid pop3 settings: {e}")),
    };
    let stored = match state.settings.pop3().await {
        Ok(value) => value,
        Err(e) => return db_error(e),
    };
    incoming.restore_masked(&stored);
    if let Err(e) = state.settings.set_pop3(&incoming).await {
        return db_error(e);
    }
    Json(incoming.masked()).into_response()
}

async fn update_ai(state: &AppState, body: serde_json::Value) -> Response {
    let mut incoming: AiSettings = match serde_json::from_value(body) {
        Ok(value) => value,
        Err(e) => return bad_request(&format!("Invalid ai settings: {e}")),
    };
    let stored = match state.settings.ai().await {
        Ok(value) => value,
        Err(e) => return db_error(e),
    };
    incoming.restore_masked(&stored);
    if let Err(e) = state.settings.set_ai(&incoming).await {
        return db_error(e);
    }
    Json(incoming.masked()).into_response()
}

async fn update_notion(state: &AppState, body: serde_json::Value) -> Response {
    let mut incoming: NotionSettings = match serde_json::from_value(body) {
        Ok(value) => value,
        Err(e) => return bad_request(&format!("Invalid notion settings: {e}")),
    };
    let stored = match state.settings.notion().await {
        Ok(value) => value,
        Err(e) => return db_error(e),
    };
    incoming.restore_masked(&stored);
    if let Err(e) = state.settings.set_notion(&incoming).await {
        return db_error(e);
    }
    Json(incoming.masked()).into_response()
}

async fn update_scheduler(state: &AppState, body: serde_json::Value) -> Response {
    let incoming: SchedulerSettings = match serde_json::from_value(body) {
        Ok(value) => value,
        Err(e) => return bad_request(&format!("Invalid scheduler settings: {e}")),
    };
    if incoming.interval_minutes == 0 {
        return bad_request("interval_minutes must be at least 1");
    }
    if let Err(e) = state.settings.set_scheduler(&incoming).await {
        return db_error(e);
    }

    if incoming.enabled {
        if let Err(e) = state.scheduler.start(incoming.interval_minutes).await {
            return scheduler_error(e);
        }
    } else {
        state.scheduler.stop().await;
    }
    Json(incoming).into_response()
}

// ── Connection probes ───────────────────────────────────────────────────

async fn test_pop3(State(state): State<AppState>) -> impl IntoResponse {
    probe_response(state.mailbox.test_connection().await)
}

async fn test_ai(State(state): State<AppState>) -> impl IntoResponse {
    probe_response(state.analyzer.test_connection().await)
}

async fn test_notion(State(state): State<AppState>) -> impl IntoResponse {
    probe_response(state.notion.test_connection().await)
}

/// Probes always answer 200; the body carries the verdict.
fn probe_response<E: std::fmt::Display>(result: Result<String, E>) -> Response {
    let body = match result {
        Ok(message) => serde_json::json!({ "ok": true, "message": message }),
        Err(e) => serde_json::json!({ "ok": false, "message": e.to_string() }),
    };
    Json(body).into_response()
}

// ── Categories ──────────────────────────────────────────────────────────

async fn list_categories(State(state): State<AppState>) -> impl IntoResponse {
    match state.categories.list().await {
        Ok(categories) => Json(categories).into_response(),
        Err(e) => db_error(e),
    }
}

async fn create_category(
    State(state): State<AppState>,
    Json(input): Json<NewCategory>,
) -> impl IntoResponse {
    if input.name.trim().is_empty() {
        return bad_request("Category name is required");
    }
    match state.categories.create(input).await {
        Ok(category) => (StatusCode::CREATED, Json(category)).into_response(),
        Err(e) => db_error(e),
    }
}

async fn update_category(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(update): Json<CategoryUpdate>,
) -> impl IntoResponse {
    if let Some(name) = &update.name
        && name.trim().is_empty()
    {
        return bad_request("Category name cannot be empty");
    }
    match state.categories.update(id, update).await {
        Ok(category) => Json(category).into_response(),
        Err(e) => category_error(e),
    }
}

async fn delete_category(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.categories.delete(id).await {
        Ok(true) => Json(serde_json::json!({ "message": "Category deleted" })).into_response(),
        Ok(false) => json_error(StatusCode::NOT_FOUND, "Category not found"),
        Err(e) => db_error(e),
    }
}

// ── Scheduler ───────────────────────────────────────────────────────────

async fn scheduler_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.scheduler.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => scheduler_error(e),
    }
}

/// POST /api/scheduler/start
///
/// Start the ticker at the stored interval and persist `enabled`. The
/// interval itself is changed through the settings endpoint.
async fn start_scheduler(State(state): State<AppState>) -> impl IntoResponse {
    let stored = match state.settings.scheduler().await {
        Ok(value) => value,
        Err(e) => return db_error(e),
    };
    if let Err(e) = state.scheduler.start(stored.interval_minutes).await {
        return scheduler_error(e);
    }

    let updated = SchedulerSettings {
        enabled: true,
        ..stored
    };
    if let Err(e) = state.settings.set_scheduler(&updated).await {
        return db_error(e);
    }
    info!(
        interval_minutes = updated.interval_minutes,
        "Scheduler started via API"
    );
    scheduler_status_body(&state).await
}

/// POST /api/scheduler/stop
///
/// Stop the ticker and persist `enabled: false`; the stored interval is
/// kept for the next start.
async fn stop_scheduler(State(state): State<AppState>) -> impl IntoResponse {
    state.scheduler.stop().await;

    let stored = match state.settings.scheduler().await {
        Ok(value) => value,
        Err(e) => return db_error(e),
    };
    let updated = SchedulerSettings {
        enabled: false,
        ..stored
    };
    if let Err(e) = state.settings.set_scheduler(&updated).await {
        return db_error(e);
    }
    info!("Scheduler stopped via API");
    scheduler_status_body(&state).await
}

async fn scheduler_status_body(state: &AppState) -> Response {
    match state.scheduler.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => scheduler_error(e),
    }
}

// ── Error mapping ───────────────────────────────────────────────────────

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn bad_request(message: &str) -> Response {
    json_error(StatusCode::BAD_REQUEST, message)
}

fn db_error(e: DatabaseError) -> Response {
    error!(error = %e, "Storage request failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
}

/// Reprocess validation failures carry specific status codes; anything
/// else from the pipeline is a 500.
fn pipeline_error(e: PipelineError) -> Response {
    let status = match &e {
        PipelineError::RecordNotFound { .. } => StatusCode::NOT_FOUND,
        PipelineError::NotRetryable { .. } => StatusCode::CONFLICT,
        PipelineError::MessageGone { .. } => StatusCode::GONE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %e, "Pipeline request failed");
    }
    json_error(status, &e.to_string())
}

fn scheduler_error(e: SchedulerError) -> Response {
    match &e {
        SchedulerError::InvalidInterval { .. } => bad_request(&e.to_string()),
        SchedulerError::Database(_) => {
            error!(error = %e, "Scheduler request failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

/// A missing category is the caller's problem, not the store's.
fn category_error(e: DatabaseError) -> Response {
    match e {
        DatabaseError::NotFound { .. } => json_error(StatusCode::NOT_FOUND, "Category not found"),
        other => db_error(other),
    }
}
