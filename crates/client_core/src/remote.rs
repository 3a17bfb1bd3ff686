use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use shared::{
    domain::{CollectionId, CollectionKind, CollectionScope, CollectionSummary, ItemId, OrderedCollection, OrderedItem},
    error::ApiError,
    protocol::{AppendItemRequest, ListCollectionsQuery, PositionBatch, PositionsUpdated, ServerEvent},
};
use storage::{PositionStore, StoreError};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{optimistic::OptimisticOrderAdapter, ClientEvent};

/// [`PositionStore`] backed by the collections HTTP API.
#[derive(Clone)]
pub struct HttpPositionStore {
    http: Client,
    server_url: String,
}

impl HttpPositionStore {
    pub fn new(server_url: &str) -> Result<Self> {
        let server_url = server_url.trim().trim_end_matches('/').to_string();
        if !(server_url.starts_with("http://") || server_url.starts_with("https://")) {
            return Err(anyhow!("server_url must start with http:// or https://"));
        }
        Ok(Self {
            http: Client::new(),
            server_url,
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn list_collections(
        &self,
        kind: Option<CollectionKind>,
        parent_ref: Option<&str>,
    ) -> Result<Vec<CollectionSummary>> {
        let query = ListCollectionsQuery {
            kind,
            parent_ref: parent_ref.map(str::to_string),
        };
        let response = self
            .http
            .get(format!("{}/collections", self.server_url))
            .query(&query)
            .send()
            .await
            .context("failed to list collections")?;
        Ok(expect_success(response).await?.json().await?)
    }

    pub async fn find_collection(&self, scope: &CollectionScope) -> Result<Option<CollectionSummary>> {
        let mut found = self
            .list_collections(Some(scope.kind), Some(&scope.parent_ref))
            .await?;
        Ok(found.pop())
    }

    pub async fn append_item(&self, scope: &CollectionScope, label: &str) -> Result<OrderedItem> {
        let response = self
            .http
            .post(format!("{}/collections/items", self.server_url))
            .json(&AppendItemRequest {
                scope: scope.clone(),
                label: label.to_string(),
            })
            .send()
            .await
            .context("failed to append item")?;
        Ok(expect_success(response).await?.json().await?)
    }

    pub async fn remove_item(&self, collection_id: CollectionId, item_id: ItemId) -> Result<()> {
        let response = self
            .http
            .delete(format!(
                "{}/collections/{}/items/{}",
                self.server_url, collection_id.0, item_id.0
            ))
            .send()
            .await
            .context("failed to remove item")?;
        expect_success(response).await?;
        Ok(())
    }

    async fn fetch_collection(&self, collection_id: CollectionId) -> Result<Response, StoreError> {
        self.http
            .get(format!("{}/collections/{}", self.server_url, collection_id.0))
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.into()))
    }
}

#[async_trait]
impl PositionStore for HttpPositionStore {
    async fn load_collection(
        &self,
        collection_id: CollectionId,
    ) -> Result<OrderedCollection, StoreError> {
        let response = self.fetch_collection(collection_id).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::CollectionNotFound(collection_id));
        }
        let response = expect_success(response).await?;
        response
            .json::<OrderedCollection>()
            .await
            .map_err(|e| StoreError::Backend(e.into()))
    }

    async fn set_positions(
        &self,
        collection_id: CollectionId,
        batch: &PositionBatch,
    ) -> Result<i64, StoreError> {
        let response = self
            .http
            .put(format!(
                "{}/collections/{}/positions",
                self.server_url, collection_id.0
            ))
            .json(batch)
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

        match response.status() {
            StatusCode::CONFLICT => {
                // the conflict body only carries a message; read the revision that won
                let actual = match self.load_collection(collection_id).await {
                    Ok(current) => current.revision,
                    Err(err) => {
                        warn!(%collection_id, error = %err, "could not read revision after conflict");
                        batch.expected_revision + 1
                    }
                };
                Err(StoreError::StaleRevision {
                    collection_id,
                    expected: batch.expected_revision,
                    actual,
                })
            }
            StatusCode::NOT_FOUND => Err(StoreError::CollectionNotFound(collection_id)),
            StatusCode::BAD_REQUEST => Err(StoreError::Rejected {
                collection_id,
                message: error_message(response).await,
            }),
            _ => {
                let updated: PositionsUpdated = expect_success(response)
                    .await?
                    .json()
                    .await
                    .map_err(|e| StoreError::Backend(e.into()))?;
                Ok(updated.revision)
            }
        }
    }
}

/// Turns a non-2xx response into an error carrying the server's message.
async fn expect_success(response: Response) -> Result<Response, anyhow::Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = error_message(response).await;
    Err(anyhow!("server returned {status}: {message}"))
}

async fn error_message(response: Response) -> String {
    let status = response.status();
    match response.json::<ApiError>().await {
        Ok(api_error) => api_error.message,
        Err(_) => status.to_string(),
    }
}

pub(crate) fn events_url(server_url: &str, collection_id: Option<CollectionId>) -> Result<Url> {
    let ws_base = if let Some(rest) = server_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(anyhow!("server_url must start with http:// or https://"));
    };
    let mut url = Url::parse(&format!("{}/ws", ws_base.trim_end_matches('/')))
        .with_context(|| format!("invalid server url: {server_url}"))?;
    if let Some(collection_id) = collection_id {
        url.query_pairs_mut()
            .append_pair("collection_id", &collection_id.0.to_string());
    }
    Ok(url)
}

/// Connects to the server's event stream and forwards collection changes to
/// `adapter`. The returned task ends when the stream closes.
pub async fn spawn_event_watcher(
    adapter: Arc<OptimisticOrderAdapter>,
    server_url: &str,
    collection_id: Option<CollectionId>,
) -> Result<JoinHandle<()>> {
    let ws_url = events_url(server_url, collection_id)?;
    let (ws_stream, _) = connect_async(ws_url.as_str())
        .await
        .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
    info!(%ws_url, "listening for collection changes");
    let (_, mut ws_reader) = ws_stream.split();

    Ok(tokio::spawn(async move {
        while let Some(msg) = ws_reader.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => forward_event(&adapter, event).await,
                    Err(err) => warn!(error = %err, "ignoring malformed server event"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    error!(error = %err, "event stream failed");
                    adapter.publish(ClientEvent::Error(format!("event stream failed: {err}")));
                    break;
                }
            }
        }
        debug!("event stream closed");
    }))
}

async fn forward_event(adapter: &OptimisticOrderAdapter, event: ServerEvent) {
    match event {
        ServerEvent::CollectionReordered {
            collection_id,
            revision,
            origin,
        } => {
            adapter
                .observe_remote_change(collection_id, revision, origin.as_ref())
                .await;
        }
        ServerEvent::ItemAppended {
            collection_id,
            revision,
            ..
        }
        | ServerEvent::ItemRemoved {
            collection_id,
            revision,
            ..
        } => {
            adapter
                .observe_remote_change(collection_id, revision, None)
                .await;
        }
        ServerEvent::Error(api_error) => {
            adapter.publish(ClientEvent::Error(api_error.message));
        }
    }
}

#[cfg(test)]
#[path = "tests/remote_tests.rs"]
mod tests;
