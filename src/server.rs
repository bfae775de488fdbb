//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `POST`   | `/auth/callback` | Create the caller's user record if missing |
//! | `GET`    | `/documents` | The caller's documents |
//! | `POST`   | `/documents` | Register an uploaded file and start ingestion |
//! | `GET`    | `/documents/by-key/{key}` | Look up a document by storage key |
//! | `DELETE` | `/documents/{id}` | Delete a document and its index |
//! | `GET`    | `/documents/{id}/status` | Ingestion status |
//! | `POST`   | `/documents/{id}/reingest` | Retry a failed ingestion |
//! | `GET`    | `/documents/{id}/messages` | Paginated history (`limit`, `cursor`) |
//! | `POST`   | `/message` | Ask a question; the reply streams as `text/plain` |
//!
//! The caller is identified by the `x-user-id` header; issuing that identity
//! is the job of whatever sits in front of this server.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "document 42 not found" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `not_found` (404),
//! `not_ready` (409), `internal` (500).

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use pagewise_core::error::AccessError;
use pagewise_core::models::{Document, PageRequest, User};
use pagewise_core::store::{RecordStore, VectorIndex};

use crate::api::{
    CreateDocumentRequest, ErrorBody, ErrorDetail, MessagesResponse, SendMessageRequest,
    StatusResponse, EMAIL_HEADER, USER_HEADER,
};
use crate::config::Config;
use crate::db;
use crate::embedding::create_provider;
use crate::extract::PageParser;
use crate::ingest::IngestionPipeline;
use crate::reply::ReplyService;
use crate::responder::{create_responder, AnswerService};
use crate::sqlite_store::SqliteStore;
use crate::status;
use crate::storage::create_store;

/// Shared services behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub records: Arc<dyn RecordStore>,
    pub index: Arc<dyn VectorIndex>,
    pub pipeline: Arc<IngestionPipeline>,
    pub replies: Arc<ReplyService>,
}

impl AppState {
    /// Wire the SQLite store and the configured collaborators.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        let store = Arc::new(SqliteStore::new(pool));
        let embedder = create_provider(&config.embedding)?;
        let storage = create_store(&config.storage)?;
        let responder = create_responder(&config.responder)?;

        let pipeline = IngestionPipeline::new(
            store.clone(),
            store.clone(),
            storage,
            Arc::new(PageParser),
            embedder.clone(),
        )
        .with_batch_size(config.embedding.batch_size);

        let answers = AnswerService::new(
            store.clone(),
            store.clone(),
            embedder,
            responder,
            config.retrieval.clone(),
        );

        Ok(Self {
            records: store.clone(),
            index: store.clone(),
            pipeline: Arc::new(pipeline),
            replies: Arc::new(ReplyService::new(store, Arc::new(answers))),
        })
    }
}

/// Build the router with CORS open to all origins.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/auth/callback", post(handle_auth_callback))
        .route("/documents", get(handle_list_documents).post(handle_create_document))
        .route("/documents/by-key/{key}", get(handle_find_by_key))
        .route("/documents/{id}", axum::routing::delete(handle_delete_document))
        .route("/documents/{id}/status", get(handle_status))
        .route("/documents/{id}/reingest", post(handle_reingest))
        .route("/documents/{id}/messages", get(handle_list_messages))
        .route("/message", post(handle_message))
        .layer(cors)
        .with_state(state)
}

/// Starts the server on `[server].bind` and runs until the process exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = AppState::from_config(config).await?;
    let bind_addr = config.server.bind.clone();

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!(%bind_addr, "server listening");
    println!("Pagewise listening on http://{}", bind_addr);

    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ============ Error response ============

/// Converts into the JSON error contract.
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<AccessError> for AppError {
    fn from(err: AccessError) -> Self {
        let (status, code) = match &err {
            AccessError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            AccessError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AccessError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AccessError::NotReady(_) => (StatusCode::CONFLICT, "not_ready"),
        };
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(access) = err.downcast_ref::<AccessError>() {
            return access.clone().into();
        }
        error!(error = %format!("{:#}", err), "request failed");
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: err.to_string(),
        }
    }
}

type ApiResult<T> = Result<T, AppError>;

// ============ Caller identity ============

/// The `x-user-id` of the caller; 401 when absent.
pub struct Caller(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        header_value(&parts.headers, USER_HEADER)
            .map(|id| Caller(id.to_string()))
            .ok_or_else(|| AccessError::Unauthorized.into())
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /auth/callback ============

async fn handle_auth_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<User>> {
    let user = status::ensure_user(
        state.records.as_ref(),
        header_value(&headers, USER_HEADER),
        header_value(&headers, EMAIL_HEADER),
    )
    .await?;
    Ok(Json(user))
}

// ============ Documents ============

async fn handle_list_documents(
    State(state): State<AppState>,
    Caller(user_id): Caller,
) -> ApiResult<Json<Vec<Document>>> {
    Ok(Json(state.records.list_documents(&user_id).await?))
}

async fn handle_create_document(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Json(req): Json<CreateDocumentRequest>,
) -> ApiResult<(StatusCode, Json<Document>)> {
    if req.key.trim().is_empty() {
        return Err(AccessError::InvalidRequest("key must not be empty".into()).into());
    }
    let doc = state
        .pipeline
        .create_document(&user_id, &req.key, &req.name, &req.url)
        .await?;
    Ok((StatusCode::CREATED, Json(doc)))
}

async fn handle_find_by_key(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(key): Path<String>,
) -> ApiResult<Json<Document>> {
    Ok(Json(
        status::find_by_key(state.records.as_ref(), &key, &user_id).await?,
    ))
}

async fn handle_delete_document(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<Document>> {
    let doc =
        status::delete_document(state.records.as_ref(), state.index.as_ref(), &id, &user_id)
            .await?;
    Ok(Json(doc))
}

async fn handle_status(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    let status = status::get_status(state.records.as_ref(), &id, &user_id).await?;
    Ok(Json(StatusResponse { status }))
}

async fn handle_reingest(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Document>)> {
    let doc = state.pipeline.reingest(&id, &user_id).await?;
    Ok((StatusCode::ACCEPTED, Json(doc)))
}

// ============ Messages ============

#[derive(Deserialize)]
struct MessagesQuery {
    limit: Option<usize>,
    cursor: Option<String>,
}

async fn handle_list_messages(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Json<MessagesResponse>> {
    let page = PageRequest::new(query.limit, query.cursor)?;
    let doc = status::require_owned(state.records.as_ref(), &id, &user_id).await?;
    let messages = state.records.list_messages(&doc.id, &user_id, &page).await?;
    Ok(Json(MessagesResponse::from(&messages)))
}

async fn handle_message(
    State(state): State<AppState>,
    Caller(user_id): Caller,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<Response> {
    let body = state
        .replies
        .start(&req.document_id, &user_id, &req.text)
        .await?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(body),
    )
        .into_response())
}
