use crate::attachments::{AttachmentStore, URL_PREFIX};
use crate::config::ApiConfig;
use crate::credentials::{CredentialService, StaffIdentity};
use crate::error::{AuthError, ServiceError, ServiceResult};
use crate::form::FormPayload;
use crate::record_store::RecordStore;
use crate::reports::{PublicReportView, ReportService, StaffReportView};
use anyhow::{Context, Result};
use axum::{
    async_trait,
    body::Bytes,
    extract::{
        rejection::BytesRejection, DefaultBodyLimit, FromRef, FromRequestParts, Path, State,
    },
    http::{header, request::Parts, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub reports: Arc<ReportService>,
    pub credentials: Arc<CredentialService>,
    pub store: Arc<dyn RecordStore>,
    pub attachments: Arc<AttachmentStore>,
}

/// Login request body
#[derive(Debug, Default, Deserialize)]
pub struct LoginRequest {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Login response
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
}

/// Response to report mutations
#[derive(Debug, Serialize)]
pub struct MutationResponse {
    pub id: i64,
    pub message: &'static str,
}

/// Staff member authenticated through the `Authorization: Bearer` header
#[derive(Debug, Clone)]
pub struct StaffSession(pub StaffIdentity);

#[async_trait]
impl<S> FromRequestParts<S> for StaffSession
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(AuthError::MissingToken)?;

        let state = AppState::from_ref(state);
        let staff = state.credentials.authenticate(token.trim()).await?;
        Ok(StaffSession(staff))
    }
}

/// Numeric `:problem_id` path segment
#[derive(Debug, Clone, Copy)]
pub struct ProblemId(pub i64);

#[async_trait]
impl<S> FromRequestParts<S> for ProblemId
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(id) = Path::<i64>::from_request_parts(parts, state)
            .await
            .map_err(|e| ServiceError::Validation(e.body_text()))?;
        Ok(ProblemId(id))
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let uploads = ServeDir::new(state.attachments.directory());

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/problems", get(list_problems).post(create_problem))
        .route("/api/admin/login", post(admin_login))
        .route(
            "/api/admin/problems",
            get(admin_list_problems).post(admin_create_problem),
        )
        .route(
            "/api/admin/problems/:problem_id",
            put(admin_update_problem).delete(admin_delete_problem),
        )
        .nest_service(URL_PREFIX, uploads)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "report-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// GET /api/problems
async fn list_problems(
    State(state): State<AppState>,
) -> ServiceResult<Json<Vec<PublicReportView>>> {
    Ok(Json(state.reports.list_public().await?))
}

/// POST /api/problems
async fn create_problem(
    State(state): State<AppState>,
    payload: FormPayload,
) -> ServiceResult<impl IntoResponse> {
    let fields = payload.public_fields();
    let id = state.reports.submit_public(fields, payload.image).await?;

    Ok((
        StatusCode::CREATED,
        Json(MutationResponse {
            id,
            message: "created",
        }),
    ))
}

/// POST /api/admin/login
async fn admin_login(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> ServiceResult<Json<LoginResponse>> {
    let body = body.map_err(|e| ServiceError::Validation(e.body_text()))?;
    // A body that is not JSON is treated like an empty one
    let request: LoginRequest = serde_json::from_slice(&body).unwrap_or_default();
    let token = state
        .credentials
        .verify_login(
            request.username.as_deref().unwrap_or_default(),
            request.password.as_deref().unwrap_or_default(),
        )
        .await?;

    Ok(Json(LoginResponse { token }))
}

/// POST /api/admin/problems
async fn admin_create_problem(
    State(state): State<AppState>,
    StaffSession(staff): StaffSession,
    payload: FormPayload,
) -> ServiceResult<impl IntoResponse> {
    let fields = payload.staff_fields();
    let id = state
        .reports
        .submit_as_staff(fields, payload.image, &staff)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(MutationResponse {
            id,
            message: "created by admin",
        }),
    ))
}

/// GET /api/admin/problems
async fn admin_list_problems(
    State(state): State<AppState>,
    StaffSession(staff): StaffSession,
) -> ServiceResult<Json<Vec<StaffReportView>>> {
    Ok(Json(state.reports.list_for_staff(&staff).await?))
}

/// PUT /api/admin/problems/:problem_id
async fn admin_update_problem(
    State(state): State<AppState>,
    StaffSession(staff): StaffSession,
    ProblemId(problem_id): ProblemId,
    payload: FormPayload,
) -> ServiceResult<Json<MutationResponse>> {
    let patch = payload.patch()?;
    let updated = state
        .reports
        .update(problem_id, patch, payload.image, &staff)
        .await?;

    Ok(Json(MutationResponse {
        id: updated.id,
        message: "updated",
    }))
}

/// DELETE /api/admin/problems/:problem_id
async fn admin_delete_problem(
    State(state): State<AppState>,
    StaffSession(staff): StaffSession,
    ProblemId(problem_id): ProblemId,
) -> ServiceResult<Json<MutationResponse>> {
    state.reports.delete(problem_id, &staff).await?;

    Ok(Json(MutationResponse {
        id: problem_id,
        message: "deleted",
    }))
}

/// Start the report API server, serving until `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting report API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
