use crate::aggregator::EngagementAggregator;
use crate::config::ApiConfig;
use crate::engagement::CommentEntry;
use crate::error::StorageError;
use crate::storage::{content_type_for, Attributes, Storage};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pixora_pipeline::{
    EngagementEvent, EngagementKind, EngagementStats, EventProducer, LifecycleEvent,
    PipelineEvent, PublishError,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Page size for the event listing when the caller gives none
const DEFAULT_EVENT_PAGE: usize = 100;
const MAX_EVENT_PAGE: usize = 1000;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Publishes every write intent; writes never touch storage directly
    pub producer: Arc<EventProducer>,
    /// Read side for image bytes and metadata
    pub storage: Storage,
    /// Read side for stats, comments and the event listing
    pub aggregator: Arc<EngagementAggregator>,
}

/// Returned for every accepted intent
#[derive(Debug, Serialize, Deserialize)]
pub struct AcceptedResponse {
    /// Id of the published event
    pub event_id: Uuid,
    /// Category and kind, e.g. `lifecycle.upload`
    pub message_type: String,
}

/// Body of the like, dislike, view and comment routes
#[derive(Debug, Deserialize)]
pub struct EngagementRequest {
    pub user_id: String,
    /// Required on the comment route, rejected elsewhere
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventListQuery {
    pub limit: Option<usize>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Machine-readable code such as `NOT_FOUND` or `PUBLISH_ERROR`
    pub code: String,
}

pub enum ApiError {
    BadRequest(String),
    Publish(PublishError),
    Storage(StorageError),
}

impl From<PublishError> for ApiError {
    fn from(e: PublishError) -> Self {
        ApiError::Publish(e)
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        ApiError::Storage(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", message),
            ApiError::Publish(e) => {
                error!(error = %e, "Failed to publish event");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "PUBLISH_ERROR",
                    "Event pipeline unavailable".to_string(),
                )
            }
            ApiError::Storage(StorageError::NotFound(id)) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", format!("{id} not found"))
            }
            ApiError::Storage(e @ StorageError::Timeout { .. }) => {
                error!(error = %e, "Storage read timed out");
                (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", e.to_string())
            }
            ApiError::Storage(e) => {
                error!(error = %e, "Storage read failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "STORAGE_ERROR",
                    "Failed to read storage".to_string(),
                )
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: message,
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Create the API router. `body_limit` caps image uploads and updates.
pub fn create_router(state: AppState, config: &ApiConfig, body_limit: usize) -> Router {
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

    Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/v1/images/:id",
            get(get_image).put(upload_image).post(update_image).delete(delete_image),
        )
        .route(
            "/api/v1/images/:id/metadata",
            get(get_metadata).put(merge_metadata).delete(purge_metadata),
        )
        .route("/api/v1/images/:id/stats", get(get_stats))
        .route("/api/v1/images/:id/stats/refresh", post(refresh_stats))
        .route("/api/v1/images/:id/comments", get(get_comments))
        .route("/api/v1/events", get(list_events))
        .route("/api/v1/images/:id/like", post(like))
        .route("/api/v1/images/:id/dislike", post(dislike))
        .route("/api/v1/images/:id/view", post(view))
        .route("/api/v1/images/:id/comment", post(comment))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "pixora-storage"
    }))
}

/// Publish and answer 202; the request never waits for the consumer
async fn publish(state: &AppState, event: PipelineEvent) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    state.producer.publish(&event).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            event_id: event.id(),
            message_type: event.message_type(),
        }),
    ))
}

#[instrument(skip(state, body), fields(size_bytes = body.len()))]
async fn upload_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("image body is empty".to_string()));
    }
    publish(&state, LifecycleEvent::upload(id, body.to_vec()).into()).await
}

#[instrument(skip(state, body), fields(size_bytes = body.len()))]
async fn update_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    if body.is_empty() {
        return Err(ApiError::BadRequest("image body is empty".to_string()));
    }
    publish(&state, LifecycleEvent::update(id, body.to_vec()).into()).await
}

#[instrument(skip(state))]
async fn delete_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    publish(&state, LifecycleEvent::delete(id).into()).await
}

#[instrument(skip(state, attributes))]
async fn merge_metadata(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(attributes): Json<Attributes>,
) -> ApiResult<impl IntoResponse> {
    publish(&state, LifecycleEvent::metadata_update(id, attributes).into()).await
}

#[instrument(skip(state))]
async fn purge_metadata(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    publish(&state, LifecycleEvent::purge_metadata(id).into()).await
}

/// Snapshot the current counts and publish them for the consumer to write
#[instrument(skip(state))]
async fn refresh_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let stats = state.aggregator.get_stats(&id).await?;
    publish(&state, LifecycleEvent::stats_refresh(id, stats).into()).await
}

async fn engage(
    state: AppState,
    kind: EngagementKind,
    target_id: String,
    request: EngagementRequest,
) -> ApiResult<(StatusCode, Json<AcceptedResponse>)> {
    if request.user_id.trim().is_empty() {
        return Err(ApiError::BadRequest("user_id is required".to_string()));
    }

    let event = match (kind, request.comment) {
        (EngagementKind::Comment, Some(text)) if !text.trim().is_empty() => {
            EngagementEvent::comment(request.user_id, target_id, text)
        }
        (EngagementKind::Comment, _) => {
            return Err(ApiError::BadRequest("comment text is required".to_string()))
        }
        (_, Some(_)) => {
            return Err(ApiError::BadRequest(format!("{kind} events carry no comment")))
        }
        (kind, None) => EngagementEvent::new(kind, request.user_id, target_id),
    };

    publish(&state, event.into()).await
}

async fn like(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<EngagementRequest>,
) -> ApiResult<impl IntoResponse> {
    engage(state, EngagementKind::Like, id, request).await
}

async fn dislike(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<EngagementRequest>,
) -> ApiResult<impl IntoResponse> {
    engage(state, EngagementKind::Dislike, id, request).await
}

async fn view(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<EngagementRequest>,
) -> ApiResult<impl IntoResponse> {
    engage(state, EngagementKind::View, id, request).await
}

async fn comment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<EngagementRequest>,
) -> ApiResult<impl IntoResponse> {
    engage(state, EngagementKind::Comment, id, request).await
}

async fn get_image(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    let data = state.storage.blobs.get(&id).await?;
    Ok(([(header::CONTENT_TYPE, content_type_for(&id))], data).into_response())
}

async fn get_metadata(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Attributes>> {
    Ok(Json(state.storage.metadata.get_attributes(&id).await?))
}

async fn get_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<EngagementStats>> {
    Ok(Json(state.aggregator.get_stats(&id).await?))
}

async fn get_comments(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<CommentEntry>>> {
    Ok(Json(state.aggregator.get_comments(&id).await?))
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventListQuery>,
) -> ApiResult<Json<Vec<EngagementEvent>>> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_PAGE).clamp(1, MAX_EVENT_PAGE);
    Ok(Json(state.aggregator.list_events(limit).await?))
}

/// Serve the API until `shutdown` resolves
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    body_limit: usize,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config, body_limit);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, body_limit, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
