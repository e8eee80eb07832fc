//! REST API over the attestation quorum
//!
//! The caller's identity arrives in the `x-geniesafe-user` header; the
//! authentication layer in front of this service is responsible for it.

use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use geniesafe_common::{
    AttestorId, Beneficiary, GenieError, QuorumError, SealedSecret, StoreError, SubjectId,
    UserId, UserProfile, VERSION,
};
use geniesafe_quorum::{AttestationQuorum, CompletionDispatcher, QuorumService, RecordStore};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Deserialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, warn};
use uuid::Uuid;

/// Header carrying the authenticated user id
pub const CALLER_HEADER: &str = "x-geniesafe-user";

// ============ STATE ============

#[derive(Clone)]
pub struct AppState {
    engine: Arc<AttestationQuorum>,
    dispatcher: Arc<CompletionDispatcher>,
    registry: Registry,
}

impl AppState {
    pub fn new(service: &QuorumService, registry: Registry) -> Self {
        Self {
            engine: service.engine(),
            dispatcher: service.dispatcher(),
            registry,
        }
    }

    fn store(&self) -> &Arc<dyn RecordStore> {
        self.engine.store()
    }
}

// ============ ERRORS ============

/// Error rendered as `{"error": "..."}` with a matching status code
#[derive(Debug)]
pub enum ApiError {
    Genie(GenieError),
    MissingCaller,
    NotFound(String),
}

impl From<GenieError> for ApiError {
    fn from(err: GenieError) -> Self {
        ApiError::Genie(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Genie(err.into())
    }
}

fn status_of(err: &GenieError) -> StatusCode {
    if err.is_not_found() {
        return StatusCode::NOT_FOUND;
    }
    match err {
        GenieError::Quorum(q) => match q {
            QuorumError::InvalidState { .. } | QuorumError::Conflict { .. } => {
                StatusCode::CONFLICT
            }
            QuorumError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            QuorumError::Forbidden(_) | QuorumError::InvalidLink => StatusCode::FORBIDDEN,
            QuorumError::EmptyPanel(_) => StatusCode::UNPROCESSABLE_ENTITY,
            QuorumError::SubjectNotFound(_) | QuorumError::AttestorNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
        },
        GenieError::Panel(_) | GenieError::Allocation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        GenieError::Store(StoreError::Duplicate(_)) => StatusCode::CONFLICT,
        GenieError::Store(StoreError::VersionConflict { .. }) => StatusCode::CONFLICT,
        GenieError::Serialization(_) | GenieError::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Genie(err) => {
                let status = status_of(&err);
                if status.is_server_error() {
                    error!(error = %err, "Request failed");
                }
                (status, err.to_string())
            }
            ApiError::MissingCaller => (
                StatusCode::UNAUTHORIZED,
                format!("Missing or invalid {} header", CALLER_HEADER),
            ),
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, what),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============ CALLER ============

/// Authenticated user making the request
#[derive(Debug, Clone, Copy)]
pub struct Caller(pub UserId);

#[async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(CALLER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .map(Caller)
            .ok_or(ApiError::MissingCaller)
    }
}

// ============ REQUEST TYPES ============

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    /// Must match the caller when present
    pub id: Option<UserId>,
    pub email: String,
    pub display_name: String,
    pub wallet_address: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateWillRequest {
    pub beneficiaries: Vec<Beneficiary>,
    pub validators: Vec<UserId>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSafeguardRequest {
    /// Client-sealed secret, hex encoded
    pub secret_hex: String,
    pub verifiers: Vec<UserId>,
}

#[derive(Debug, Deserialize)]
pub struct AddAttestorRequest {
    pub user_id: UserId,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmQuery {
    pub token: String,
}

// ============ HANDLERS ============

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn version() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "geniesafe-server",
        "version": VERSION,
        "description": "Will validation and safeguard verification",
    }))
}

async fn metrics(State(state): State<AppState>) -> Response {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&state.registry.gather(), &mut buffer) {
        warn!(error = %e, "Metrics encoding failed");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buffer,
    )
        .into_response()
}

/// Register or update the caller's own profile
async fn create_user(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(req): Json<CreateUserRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.id.is_some_and(|id| id != caller) {
        warn!(caller = %caller, "Profile write for another user refused");
        return Err(GenieError::from(QuorumError::Unauthorized { user_id: caller }).into());
    }
    let profile = UserProfile {
        id: caller,
        email: req.email,
        display_name: req.display_name,
        wallet_address: req.wallet_address,
    };
    state.store().upsert_user(profile.clone()).await?;
    Ok((StatusCode::CREATED, Json(profile)))
}

async fn create_will(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(req): Json<CreateWillRequest>,
) -> ApiResult<impl IntoResponse> {
    let record = state
        .engine
        .create_will(caller, req.beneficiaries, &req.validators)
        .await?;
    let view = state.engine.view(record.id).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn create_safeguard(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(req): Json<CreateSafeguardRequest>,
) -> ApiResult<impl IntoResponse> {
    let secret = SealedSecret::from_hex(req.secret_hex.trim()).map_err(GenieError::from)?;
    let record = state
        .engine
        .create_safeguard(caller, secret, &req.verifiers)
        .await?;
    let view = state.engine.view(record.id).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn get_subject(
    State(state): State<AppState>,
    Path(id): Path<SubjectId>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.view(id).await?))
}

async fn get_dispatch(
    State(state): State<AppState>,
    Path(id): Path<SubjectId>,
) -> ApiResult<impl IntoResponse> {
    state
        .dispatcher
        .last_report(id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No dispatch recorded for subject {}", id)))
}

async fn activate(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<SubjectId>,
) -> ApiResult<impl IntoResponse> {
    state.engine.activate(id, caller).await?;
    Ok(Json(state.engine.view(id).await?))
}

async fn decline(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<SubjectId>,
) -> ApiResult<impl IntoResponse> {
    state.engine.decline(id, caller).await?;
    Ok(Json(state.engine.view(id).await?))
}

async fn cancel(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<SubjectId>,
) -> ApiResult<impl IntoResponse> {
    state.engine.cancel_activation(id, caller).await?;
    Ok(Json(state.engine.view(id).await?))
}

async fn execute(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<SubjectId>,
) -> ApiResult<impl IntoResponse> {
    state.engine.execute_will(id, caller).await?;
    Ok((StatusCode::ACCEPTED, Json(state.engine.view(id).await?)))
}

async fn release(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<SubjectId>,
) -> ApiResult<impl IntoResponse> {
    let secret = state.engine.release_secret(id, caller).await?;
    Ok(Json(serde_json::json!({
        "subject_id": id,
        "secret_hex": secret.to_hex(),
        "fingerprint": secret.fingerprint(),
    })))
}

async fn add_attestor(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<SubjectId>,
    Json(req): Json<AddAttestorRequest>,
) -> ApiResult<impl IntoResponse> {
    state.engine.add_attestor(id, caller, req.user_id).await?;
    Ok((StatusCode::CREATED, Json(state.engine.view(id).await?)))
}

async fn remove_attestor(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((id, attestor_id)): Path<(SubjectId, AttestorId)>,
) -> ApiResult<impl IntoResponse> {
    state.engine.remove_attestor(id, caller, attestor_id).await?;
    Ok(Json(state.engine.view(id).await?))
}

async fn confirm(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path((id, attestor_id)): Path<(SubjectId, AttestorId)>,
    Query(query): Query<ConfirmQuery>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state
        .engine
        .confirm_link(id, attestor_id, caller, &query.token)
        .await?;
    Ok(Json(serde_json::json!({
        "result": outcome,
        "message": outcome.to_string(),
    })))
}

// ============ ROUTER ============

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            header::HeaderName::from_static(CALLER_HEADER),
        ]);

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/api/v1/version", get(version))
        .route("/api/v1/users", post(create_user))
        .route("/api/v1/wills", post(create_will))
        .route("/api/v1/safeguards", post(create_safeguard))
        .route("/api/v1/subjects/:id", get(get_subject))
        .route("/api/v1/subjects/:id/dispatch", get(get_dispatch))
        .route("/api/v1/subjects/:id/activate", post(activate))
        .route("/api/v1/subjects/:id/decline", post(decline))
        .route("/api/v1/subjects/:id/cancel", post(cancel))
        .route("/api/v1/subjects/:id/execute", post(execute))
        .route("/api/v1/subjects/:id/release", post(release))
        .route("/api/v1/subjects/:id/attestors", post(add_attestor))
        .route(
            "/api/v1/subjects/:id/attestors/:attestor_id",
            delete(remove_attestor),
        )
        .route(
            "/api/v1/subjects/:id/attestors/:attestor_id/confirm",
            post(confirm),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
