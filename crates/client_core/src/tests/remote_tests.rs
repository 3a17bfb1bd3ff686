use std::time::Duration;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use shared::{
    domain::CollectionKind,
    error::ErrorCode,
    protocol::{OriginTag, PositionUpdate},
};
use storage::MemoryPositionStore;
use tokio::net::TcpListener;

use super::*;
use crate::error::ReorderError;

#[derive(Clone)]
struct MockState {
    store: Arc<MemoryPositionStore>,
    announce: Option<ServerEvent>,
}

type MockError = (StatusCode, Json<ApiError>);

fn mock_error(err: StoreError) -> MockError {
    let (status, code) = match err {
        StoreError::CollectionNotFound(_) => (StatusCode::NOT_FOUND, ErrorCode::NotFound),
        StoreError::StaleRevision { .. } => (StatusCode::CONFLICT, ErrorCode::Conflict),
        StoreError::UnknownItem { .. } | StoreError::Rejected { .. } => {
            (StatusCode::BAD_REQUEST, ErrorCode::Validation)
        }
        StoreError::Backend(_) => (StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::Internal),
    };
    (status, Json(ApiError::new(code, err.to_string())))
}

async fn mock_get(
    State(state): State<MockState>,
    Path(collection_id): Path<i64>,
) -> Result<Json<OrderedCollection>, MockError> {
    state
        .store
        .load_collection(CollectionId(collection_id))
        .await
        .map(Json)
        .map_err(mock_error)
}

async fn mock_put(
    State(state): State<MockState>,
    Path(collection_id): Path<i64>,
    Json(batch): Json<PositionBatch>,
) -> Result<Json<PositionsUpdated>, MockError> {
    let collection_id = CollectionId(collection_id);
    let revision = state
        .store
        .set_positions(collection_id, &batch)
        .await
        .map_err(mock_error)?;
    Ok(Json(PositionsUpdated {
        collection_id,
        revision,
    }))
}

async fn mock_ws(ws: WebSocketUpgrade, State(state): State<MockState>) -> impl IntoResponse {
    ws.on_upgrade(move |mut socket| async move {
        if let Some(event) = state.announce {
            let text = serde_json::to_string(&event).expect("encode");
            let _ = socket
                .send(axum::extract::ws::Message::Text(text))
                .await;
        }
        while let Some(Ok(_)) = socket.recv().await {}
    })
}

async fn spawn_collections_server(state: MockState) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = Router::new()
        .route("/collections/:collection_id", get(mock_get))
        .route("/collections/:collection_id/positions", put(mock_put))
        .route("/ws", get(mock_ws))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}"))
}

async fn seeded_server(
    labels: &[&str],
    announce: Option<ServerEvent>,
) -> (String, Arc<MemoryPositionStore>, OrderedCollection) {
    let store = Arc::new(MemoryPositionStore::new());
    let collection = store
        .seed(
            CollectionScope::new(CollectionKind::OrganizationTemplates, "org-1"),
            labels,
        )
        .await;
    let url = spawn_collections_server(MockState {
        store: store.clone(),
        announce,
    })
    .await
    .expect("server");
    (url, store, collection)
}

#[test]
fn rejects_non_http_server_urls() {
    assert!(HttpPositionStore::new("ftp://example.com").is_err());
    let store = HttpPositionStore::new(" http://localhost:8443/ ").expect("store");
    assert_eq!(store.server_url(), "http://localhost:8443");
}

#[test]
fn event_url_switches_scheme_and_scopes_to_collection() {
    let url = events_url("https://crm.example.com", Some(CollectionId(7))).expect("url");
    assert_eq!(url.as_str(), "wss://crm.example.com/ws?collection_id=7");
    let url = events_url("http://127.0.0.1:8443/", None).expect("url");
    assert_eq!(url.as_str(), "ws://127.0.0.1:8443/ws");
}

#[tokio::test]
async fn loads_and_writes_positions_over_http() {
    let (url, backing, collection) = seeded_server(&["A", "B"], None).await;
    let store = HttpPositionStore::new(&url).expect("store");
    let ids = collection.item_ids();

    let loaded = store
        .load_collection(collection.collection_id)
        .await
        .expect("load");
    assert_eq!(loaded, collection);

    let revision = store
        .set_positions(
            collection.collection_id,
            &PositionBatch {
                expected_revision: collection.revision,
                updates: vec![
                    PositionUpdate {
                        item_id: ids[1],
                        position: 0,
                    },
                    PositionUpdate {
                        item_id: ids[0],
                        position: 1,
                    },
                ],
                origin: None,
            },
        )
        .await
        .expect("write");
    assert_eq!(revision, collection.revision + 1);
    assert_eq!(backing.write_count(), 1);
}

#[tokio::test]
async fn missing_collection_maps_to_not_found() {
    let (url, _backing, _collection) = seeded_server(&["A"], None).await;
    let store = HttpPositionStore::new(&url).expect("store");
    let err = store
        .load_collection(CollectionId(4040))
        .await
        .expect_err("missing");
    assert!(matches!(err, StoreError::CollectionNotFound(CollectionId(4040))));
}

#[tokio::test]
async fn conflict_reports_the_winning_revision() {
    let (url, backing, collection) = seeded_server(&["A", "B"], None).await;
    let winning = backing
        .bump_revision(collection.collection_id)
        .await
        .expect("bump");
    let store = HttpPositionStore::new(&url).expect("store");

    let err = store
        .set_positions(
            collection.collection_id,
            &PositionBatch {
                expected_revision: collection.revision,
                updates: vec![PositionUpdate {
                    item_id: collection.item_ids()[0],
                    position: 3,
                }],
                origin: None,
            },
        )
        .await
        .expect_err("stale");
    assert!(matches!(
        err,
        StoreError::StaleRevision { expected, actual, .. }
            if expected == collection.revision && actual == winning
    ));
}

#[tokio::test]
async fn foreign_reorder_on_event_stream_suggests_reload() {
    let store = Arc::new(MemoryPositionStore::new());
    let collection = store
        .seed(
            CollectionScope::new(CollectionKind::TemplateBlocks, "template-3"),
            &["A", "B"],
        )
        .await;
    let url = spawn_collections_server(MockState {
        store: store.clone(),
        announce: Some(ServerEvent::CollectionReordered {
            collection_id: collection.collection_id,
            revision: collection.revision + 1,
            origin: Some(OriginTag::generate()),
        }),
    })
    .await
    .expect("server");

    let http = Arc::new(HttpPositionStore::new(&url).expect("store"));
    let adapter = OptimisticOrderAdapter::new(http);
    adapter
        .load(collection.collection_id)
        .await
        .expect("load");
    let mut events = adapter.subscribe();

    let _watcher = spawn_event_watcher(adapter.clone(), &url, Some(collection.collection_id))
        .await
        .expect("watcher");

    let suggested = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(ClientEvent::ReloadSuggested { revision, .. }) => break revision,
                Ok(_) => continue,
                Err(err) => panic!("event stream closed: {err}"),
            }
        }
    })
    .await
    .expect("reload suggestion");
    assert_eq!(suggested, collection.revision + 1);
}

#[tokio::test]
async fn rejected_batch_is_a_validation_failure() {
    let (url, backing, collection) = seeded_server(&["A", "B"], None).await;
    let store = HttpPositionStore::new(&url).expect("store");

    let err = store
        .set_positions(
            collection.collection_id,
            &PositionBatch {
                expected_revision: collection.revision,
                updates: vec![PositionUpdate {
                    item_id: ItemId(9999),
                    position: 0,
                }],
                origin: None,
            },
        )
        .await
        .expect_err("unknown item");
    assert!(matches!(
        &err,
        StoreError::Rejected { collection_id, message }
            if *collection_id == collection.collection_id && message.contains("9999")
    ));
    assert_eq!(
        ReorderError::from_store(err).category(),
        crate::ErrorCategory::Validation
    );
    let stored = backing
        .load_collection(collection.collection_id)
        .await
        .expect("reload");
    assert_eq!(stored.revision, collection.revision);
}

#[tokio::test]
async fn conflict_stays_stale_when_revision_cannot_be_read_back() {
    async fn always_conflict() -> MockError {
        (
            StatusCode::CONFLICT,
            Json(ApiError::new(ErrorCode::Conflict, "stale")),
        )
    }
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new().route("/collections/:collection_id/positions", put(always_conflict));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    let store = HttpPositionStore::new(&format!("http://{addr}")).expect("store");

    let err = store
        .set_positions(
            CollectionId(5),
            &PositionBatch {
                expected_revision: 3,
                updates: vec![PositionUpdate {
                    item_id: ItemId(1),
                    position: 0,
                }],
                origin: None,
            },
        )
        .await
        .expect_err("stale");
    assert!(matches!(
        err,
        StoreError::StaleRevision { expected: 3, actual, .. } if actual > 3
    ));
    assert!(matches!(
        ReorderError::from_store(err),
        ReorderError::StaleOrderConflict { .. }
    ));
}

#[tokio::test]
async fn error_event_is_forwarded_to_subscribers() {
    let adapter = OptimisticOrderAdapter::new(Arc::new(MemoryPositionStore::new()));
    let mut events = adapter.subscribe();

    forward_event(
        &adapter,
        ServerEvent::Error(ApiError::new(ErrorCode::Internal, "missed 3 collection events")),
    )
    .await;

    match events.try_recv().expect("event") {
        ClientEvent::Error(message) => assert!(message.contains("missed 3")),
        other => panic!("unexpected event: {other:?}"),
    }
}
