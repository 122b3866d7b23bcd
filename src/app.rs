use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{async_trait, extract::FromRequestParts, Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::chat::{self, ChatRequest};
use crate::compare;
use crate::config::Config;
use crate::delegate::AnalysisDelegate;
use crate::error::AppError;
use crate::mailer::Mailer;
use crate::pipeline::{self, Pipeline};
use crate::scheduler::{self, HttpSheetSource, Scheduler};
use crate::store::{ProcessingStatus, ScheduleFrequency, Store};
use crate::summary::Summarizer;

const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub pipeline: Arc<Pipeline>,
    pub scheduler: Arc<Scheduler>,
    pub http: reqwest::Client,
}

/// Caller identity, taken from the `x-owner-id` header the auth proxy in
/// front of this service sets. A missing or blank header is a 401.
pub struct OwnerId(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for OwnerId {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-owner-id")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| OwnerId(value.to_string()))
            .ok_or_else(|| AppError::Unauthorized("Missing x-owner-id header".to_string()))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/reports", post(upload_report).get(list_reports))
        .route("/api/reports/:id", get(get_report).delete(delete_report))
        .route("/api/reports/:id/compare/:other_id", get(compare_reports))
        .route("/api/connections", post(create_connection).get(list_connections))
        .route("/api/connections/:id", axum::routing::delete(delete_connection))
        .route("/api/connections/:id/run", post(run_connection))
        .route("/api/connections/:id/toggle", post(toggle_connection))
        .route("/api/sweep", post(run_sweep))
        .route("/api/chat", post(chat_relay))
        .route("/storage/signed/:token", get(serve_signed_blob))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Wire everything together and serve until shutdown.
pub async fn run(config: Config) -> Result<(), AppError> {
    let config = Arc::new(config);
    let store = Arc::new(Store::open(&config.data_dir)?);
    let summarizer = Summarizer::new(&config);
    let delegate = AnalysisDelegate::from_config(&config);
    let (pipeline, jobs) = Pipeline::new(store.clone(), summarizer, delegate, config.clone());
    pipeline::spawn_worker(pipeline.clone(), jobs);

    let mailer = Mailer::from_config(&config);
    let scheduler = Scheduler::new(
        store.clone(),
        Arc::new(HttpSheetSource::new()),
        pipeline.clone(),
        mailer,
    );
    scheduler::spawn_sweeper(scheduler.clone(), config.sweep_interval_secs);

    let state = AppState {
        config: config.clone(),
        store,
        pipeline,
        scheduler,
        http: reqwest::Client::new(),
    };

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    log::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Accept a spreadsheet upload and return the new report id immediately;
/// processing continues in the background.
async fn upload_report(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut file: Option<(String, String, Vec<u8>)> = None;
    let mut filename_override: Option<String> = None;
    let mut question: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let filename = field.file_name().unwrap_or("upload.csv").to_string();
                let content_type = field.content_type().unwrap_or("").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("failed to read upload: {e}")))?;
                file = Some((filename, content_type, bytes.to_vec()));
            }
            Some("filename") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("failed to read filename: {e}")))?;
                let text = text.trim().to_string();
                if !text.is_empty() {
                    filename_override = Some(text);
                }
            }
            Some("question") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("failed to read question: {e}")))?;
                let text = text.trim().to_string();
                if !text.is_empty() {
                    question = Some(text);
                }
            }
            _ => {}
        }
    }

    let (filename, content_type, bytes) =
        file.ok_or_else(|| AppError::BadRequest("Missing file field".to_string()))?;
    let filename = filename_override.unwrap_or(filename);
    let report_id = state
        .pipeline
        .submit_upload(&owner, &filename, &content_type, bytes, question)
        .await?;

    Ok((StatusCode::CREATED, Json(json!({ "reportId": report_id }))).into_response())
}

async fn list_reports(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
) -> impl IntoResponse {
    Json(state.store.list_reports(&owner))
}

async fn get_report(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let report = state
        .store
        .get_report(&owner, id)
        .ok_or_else(|| AppError::NotFound("Report not found or access denied".to_string()))?;
    Ok(Json(report).into_response())
}

async fn delete_report(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    state.store.delete_report(&owner, id)?;
    Ok(Json(json!({ "success": true })).into_response())
}

async fn compare_reports(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path((id, other_id)): Path<(Uuid, Uuid)>,
) -> Result<Response, AppError> {
    let a = state
        .store
        .get_report(&owner, id)
        .ok_or_else(|| AppError::NotFound("Report not found or access denied".to_string()))?;
    let b = state
        .store
        .get_report(&owner, other_id)
        .ok_or_else(|| AppError::NotFound("Report not found or access denied".to_string()))?;

    if a.processing_status != ProcessingStatus::Completed
        || b.processing_status != ProcessingStatus::Completed
    {
        return Err(AppError::BadRequest(
            "Both reports must be completed before comparison".to_string(),
        ));
    }

    Ok(Json(compare::compare(&a, &b)).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateConnection {
    sheet_url: String,
    sheet_name: String,
    schedule_frequency: ScheduleFrequency,
    #[serde(default)]
    notify_email: Option<String>,
}

async fn create_connection(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Json(body): Json<CreateConnection>,
) -> Result<Response, AppError> {
    let connection = state.scheduler.connect(
        &owner,
        &body.sheet_url,
        &body.sheet_name,
        body.schedule_frequency,
        body.notify_email,
    )?;
    Ok((StatusCode::CREATED, Json(connection)).into_response())
}

async fn list_connections(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
) -> impl IntoResponse {
    Json(state.store.list_connections(&owner))
}

async fn delete_connection(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    state.store.delete_connection(&owner, id)?;
    Ok(Json(json!({ "success": true })).into_response())
}

/// Manual run: always generates a report, even when the sheet is unchanged.
async fn run_connection(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    state
        .store
        .get_connection(&owner, id)
        .ok_or_else(|| AppError::NotFound("Connection not found".to_string()))?;
    let outcome = state.scheduler.run_connection(id, true).await?;
    Ok(Json(outcome).into_response())
}

#[derive(Debug, Deserialize)]
struct ToggleConnection {
    is_active: bool,
}

async fn toggle_connection(
    State(state): State<AppState>,
    OwnerId(owner): OwnerId,
    Path(id): Path<Uuid>,
    Json(body): Json<ToggleConnection>,
) -> Result<Response, AppError> {
    let is_active = state
        .store
        .set_connection_active(&owner, id, body.is_active)
        .ok_or_else(|| AppError::NotFound("Connection not found".to_string()))?;
    Ok(Json(json!({ "id": id, "is_active": is_active })).into_response())
}

/// Cron-style entry point; the periodic sweeper calls the same logic.
async fn run_sweep(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.sweep().await)
}

async fn chat_relay(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, AppError> {
    chat::relay(&state.http, &state.config, request).await
}

/// Serve a blob behind a short-lived signed token. No owner header here;
/// the token itself is the capability.
async fn serve_signed_blob(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response, AppError> {
    let (blob_path, bytes) = state
        .store
        .resolve_signed_token(&token)
        .ok_or_else(|| AppError::NotFound("Link expired or not found".to_string()))?;

    let content_type = match blob_path.rsplit('.').next().unwrap_or("") {
        "csv" => "text/csv",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    };

    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tempfile::tempdir;
    use tower::util::ServiceExt;

    fn test_state(dir: &std::path::Path) -> AppState {
        let config = Arc::new(Config::for_tests(dir.to_path_buf()));
        let store = Arc::new(Store::open(dir).unwrap());
        let summarizer = Summarizer::new(&config);
        let (pipeline, _jobs) = Pipeline::new(store.clone(), summarizer, None, config.clone());
        let scheduler = Scheduler::new(
            store.clone(),
            Arc::new(HttpSheetSource::new()),
            pipeline.clone(),
            None,
        );
        AppState {
            config,
            store,
            pipeline,
            scheduler,
            http: reqwest::Client::new(),
        }
    }

    #[tokio::test]
    async fn health_needs_no_auth() {
        let dir = tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn report_routes_reject_missing_owner_header() {
        let dir = tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let response = app
            .oneshot(Request::get("/api/reports").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload["error"], "unauthorized");
    }

    #[tokio::test]
    async fn listing_reports_starts_empty() {
        let dir = tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let response = app
            .oneshot(
                Request::get("/api/reports")
                    .header("x-owner-id", "u1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload, serde_json::json!([]));
    }

    #[tokio::test]
    async fn unknown_report_is_a_404() {
        let dir = tempdir().unwrap();
        let app = router(test_state(dir.path()));
        let response = app
            .oneshot(
                Request::get(format!("/api/reports/{}", Uuid::new_v4()))
                    .header("x-owner-id", "u1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn comparing_incomplete_reports_is_a_400() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());

        let a = crate::store::Report::new("u1", "A", "a.csv", "u1/a.csv", None);
        let b = crate::store::Report::new("u1", "B", "b.csv", "u1/b.csv", None);
        let (a_id, b_id) = (a.id, b.id);
        state.store.insert_report(a);
        state.store.insert_report(b);
        state.store.complete_report(a_id, 1, 1, None, Vec::new(), Vec::new());

        let app = router(state);
        let response = app
            .oneshot(
                Request::get(format!("/api/reports/{a_id}/compare/{b_id}"))
                    .header("x-owner-id", "u1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn signed_blob_route_serves_csv_with_content_type() {
        let dir = tempdir().unwrap();
        let state = test_state(dir.path());
        state.store.put_blob("u1/data.csv", b"a,b\n1,2\n").unwrap();
        let token = state
            .store
            .mint_signed_token("u1/data.csv", chrono::Duration::seconds(60));

        let app = router(state);
        let response = app
            .oneshot(
                Request::get(format!("/storage/signed/{token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/csv"
        );
    }
}
