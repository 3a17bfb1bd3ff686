use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use server_api::{append_item, get_collection, list_collections, remove_item, set_positions, ApiContext};
use shared::{
    domain::{CollectionId, CollectionSummary, ItemId, OrderedCollection, OrderedItem},
    error::{ApiError, ErrorCode},
    protocol::{AppendItemRequest, ListCollectionsQuery, PositionBatch, PositionsUpdated, ServerEvent},
};
use storage::Storage;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;

use app_state::AppState;
use config::{load_settings, prepare_database_url};

type HttpError = (StatusCode, Json<ApiError>);

#[derive(Debug, Deserialize)]
struct WsQuery {
    collection_id: Option<i64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = AppState::new(ApiContext { storage }, settings.event_buffer);
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/collections", get(http_list_collections))
        .route("/collections/items", post(http_append_item))
        .route("/collections/:collection_id", get(http_get_collection))
        .route(
            "/collections/:collection_id/items/:item_id",
            delete(http_remove_item),
        )
        .route(
            "/collections/:collection_id/positions",
            put(http_set_positions),
        )
        .route("/ws", get(ws_handler))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn http_error(err: ApiError) -> HttpError {
    let status = status_for(err.code);
    if status.is_server_error() {
        error!(message = %err.message, "request failed");
    }
    (status, Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.api.storage.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(error) => {
            warn!(%error, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable")
        }
    }
}

async fn http_list_collections(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListCollectionsQuery>,
) -> Result<Json<Vec<CollectionSummary>>, HttpError> {
    let collections = list_collections(&state.api, q.kind, q.parent_ref.as_deref())
        .await
        .map_err(http_error)?;
    Ok(Json(collections))
}

async fn http_get_collection(
    State(state): State<Arc<AppState>>,
    Path(collection_id): Path<i64>,
) -> Result<Json<OrderedCollection>, HttpError> {
    let collection = get_collection(&state.api, CollectionId(collection_id))
        .await
        .map_err(http_error)?;
    Ok(Json(collection))
}

async fn http_append_item(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AppendItemRequest>,
) -> Result<Json<OrderedItem>, HttpError> {
    let (item, event) = append_item(&state.api, &req).await.map_err(http_error)?;
    state.publish(event);
    Ok(Json(item))
}

async fn http_remove_item(
    State(state): State<Arc<AppState>>,
    Path((collection_id, item_id)): Path<(i64, i64)>,
) -> Result<StatusCode, HttpError> {
    let event = remove_item(&state.api, CollectionId(collection_id), ItemId(item_id))
        .await
        .map_err(http_error)?;
    state.publish(event);
    Ok(StatusCode::NO_CONTENT)
}

async fn http_set_positions(
    State(state): State<Arc<AppState>>,
    Path(collection_id): Path<i64>,
    Json(batch): Json<PositionBatch>,
) -> Result<Json<PositionsUpdated>, HttpError> {
    let (updated, event) = set_positions(&state.api, CollectionId(collection_id), &batch)
        .await
        .map_err(http_error)?;
    state.publish(event);
    Ok(Json(updated))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket, q.collection_id.map(CollectionId)))
}

async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    only: Option<CollectionId>,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};
    use tokio::sync::broadcast::error::RecvError;

    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.events.subscribe();

    let send_task = tokio::spawn(async move {
        loop {
            let event = match events_rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "websocket subscriber lagged behind event stream");
                    lagged_event(skipped)
                }
                Err(RecvError::Closed) => break,
            };
            if let (Some(wanted), Some(actual)) = (only, event.collection_id()) {
                if wanted != actual {
                    continue;
                }
            }
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

/// Sent in place of events a slow subscriber missed.
fn lagged_event(skipped: u64) -> ServerEvent {
    ServerEvent::Error(ApiError::new(
        ErrorCode::Internal,
        format!("missed {skipped} collection events; reload to resync"),
    ))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
