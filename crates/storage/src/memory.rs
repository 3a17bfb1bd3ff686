use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{sort_for_display, CollectionId, CollectionScope, ItemId, OrderedCollection, OrderedItem},
    protocol::PositionBatch,
};
use tokio::sync::Mutex;

use crate::{PositionStore, StoreError};

/// In-process [`PositionStore`] with the same revision and batch semantics as
/// the SQLite storage. Writes can be switched to fail for rollback paths.
#[derive(Default)]
pub struct MemoryPositionStore {
    collections: Mutex<HashMap<CollectionId, OrderedCollection>>,
    next_id: AtomicUsize,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a collection holding `labels` at positions `0..n`.
    pub async fn seed(&self, scope: CollectionScope, labels: &[&str]) -> OrderedCollection {
        let collection_id = CollectionId(self.allocate_id());
        let created_at = Utc::now();
        let items = labels
            .iter()
            .enumerate()
            .map(|(index, label)| OrderedItem {
                item_id: ItemId(self.allocate_id()),
                collection_id,
                label: (*label).to_string(),
                position: index as i64,
                created_at,
            })
            .collect();
        let collection = OrderedCollection {
            collection_id,
            scope,
            revision: 1,
            items,
        };
        self.collections
            .lock()
            .await
            .insert(collection_id, collection.clone());
        collection
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of position batches that reached the store, failed ones included.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Moves the stored revision forward as if another session wrote to it.
    pub async fn bump_revision(&self, collection_id: CollectionId) -> Option<i64> {
        let mut guard = self.collections.lock().await;
        let collection = guard.get_mut(&collection_id)?;
        collection.revision += 1;
        Some(collection.revision)
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) as i64 + 1
    }
}

#[async_trait]
impl PositionStore for MemoryPositionStore {
    async fn load_collection(
        &self,
        collection_id: CollectionId,
    ) -> Result<OrderedCollection, StoreError> {
        let guard = self.collections.lock().await;
        let mut collection = guard
            .get(&collection_id)
            .cloned()
            .ok_or(StoreError::CollectionNotFound(collection_id))?;
        sort_for_display(&mut collection.items);
        Ok(collection)
    }

    async fn set_positions(
        &self,
        collection_id: CollectionId,
        batch: &PositionBatch,
    ) -> Result<i64, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(anyhow!(
                "simulated write failure for collection {collection_id}"
            )));
        }

        let mut guard = self.collections.lock().await;
        let collection = guard
            .get_mut(&collection_id)
            .ok_or(StoreError::CollectionNotFound(collection_id))?;
        if collection.revision != batch.expected_revision {
            return Err(StoreError::StaleRevision {
                collection_id,
                expected: batch.expected_revision,
                actual: collection.revision,
            });
        }
        if batch.updates.is_empty() {
            return Ok(collection.revision);
        }

        if let Some(missing) = batch
            .updates
            .iter()
            .find(|u| !collection.items.iter().any(|i| i.item_id == u.item_id))
        {
            return Err(StoreError::UnknownItem {
                collection_id,
                item_id: missing.item_id,
            });
        }
        for update in &batch.updates {
            if let Some(item) = collection
                .items
                .iter_mut()
                .find(|i| i.item_id == update.item_id)
            {
                item.position = update.position;
            }
        }
        collection.revision += 1;
        Ok(collection.revision)
    }
}
