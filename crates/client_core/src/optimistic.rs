//! Optimistic reordering with per-collection serialized persistence.
//!
//! Every collection has one in-memory order that renderers read through the
//! adapter. A reorder replaces that order immediately, then waits for its turn
//! in the collection's persist queue before writing to the store. Turns are
//! handed out in the same order the optimistic updates were applied.
//!
//! A failed write restores the order that was on screen before that reorder
//! and starts a new epoch. Reorders applied in the old epoch were built on top
//! of the rolled back order, so they are dropped without touching the store.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    pin::Pin,
    sync::Arc,
    task::Poll,
};

use shared::{
    domain::{CollectionId, ItemId, OrderedCollection},
    protocol::{OriginTag, PositionBatch, PositionUpdate},
};
use storage::{PositionStore, StoreError};
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::{
    error::{ReorderError, ReorderFailure},
    notice::Notice,
    ClientEvent,
};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReorderOutcome {
    Applied { order: Vec<ItemId>, revision: i64 },
    Unchanged,
}

pub type ReorderResult = Result<ReorderOutcome, ReorderFailure>;

struct CollectionState {
    order: Vec<ItemId>,
    confirmed: HashMap<ItemId, i64>,
    revision: i64,
    epoch: u64,
    gate: Arc<Mutex<()>>,
}

impl CollectionState {
    fn from_loaded(collection: &OrderedCollection) -> Self {
        Self {
            order: collection.item_ids(),
            confirmed: confirmed_positions(collection),
            revision: collection.revision,
            epoch: 0,
            gate: Arc::new(Mutex::new(())),
        }
    }
}

type GateTurn = Pin<Box<dyn Future<Output = OwnedMutexGuard<()>> + Send>>;

pub struct OptimisticOrderAdapter {
    store: Arc<dyn PositionStore>,
    origin: OriginTag,
    collections: Mutex<HashMap<CollectionId, CollectionState>>,
    events: broadcast::Sender<ClientEvent>,
}

impl OptimisticOrderAdapter {
    pub fn new(store: Arc<dyn PositionStore>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            store,
            origin: OriginTag::generate(),
            collections: Mutex::new(HashMap::new()),
            events,
        })
    }

    /// Tag attached to this adapter's writes.
    pub fn origin(&self) -> &OriginTag {
        &self.origin
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn order(&self, collection_id: CollectionId) -> Option<Vec<ItemId>> {
        let guard = self.collections.lock().await;
        guard.get(&collection_id).map(|state| state.order.clone())
    }

    pub async fn revision(&self, collection_id: CollectionId) -> Option<i64> {
        let guard = self.collections.lock().await;
        guard.get(&collection_id).map(|state| state.revision)
    }

    /// Reads a collection from the store and makes it the displayed order.
    /// Already loaded collections go through [`Self::reload`].
    pub async fn load(&self, collection_id: CollectionId) -> Result<OrderedCollection, ReorderError> {
        if self.collections.lock().await.contains_key(&collection_id) {
            return self.reload(collection_id).await;
        }

        let collection = self
            .store
            .load_collection(collection_id)
            .await
            .map_err(ReorderError::from_store)?;
        let order = {
            let mut guard = self.collections.lock().await;
            let state = guard
                .entry(collection_id)
                .or_insert_with(|| CollectionState::from_loaded(&collection));
            state.order.clone()
        };
        info!(%collection_id, items = order.len(), revision = collection.revision, "collection loaded");
        self.publish(ClientEvent::OrderChanged {
            collection_id,
            order,
        });
        Ok(collection)
    }

    /// Replaces the displayed order with the store's, after any queued writes.
    /// Reorders applied before the reload finishes are dropped.
    pub async fn reload(&self, collection_id: CollectionId) -> Result<OrderedCollection, ReorderError> {
        let queued = {
            let guard = self.collections.lock().await;
            let state = guard
                .get(&collection_id)
                .ok_or(ReorderError::NotLoaded(collection_id))?;
            join_gate_queue(state.gate.clone()).await
        };
        let _turn = match queued {
            Ok(turn) => turn,
            Err(waiting) => waiting.await,
        };

        let collection = self
            .store
            .load_collection(collection_id)
            .await
            .map_err(ReorderError::from_store)?;

        let order = {
            let mut guard = self.collections.lock().await;
            let state = guard
                .get_mut(&collection_id)
                .ok_or(ReorderError::NotLoaded(collection_id))?;
            state.order = collection.item_ids();
            state.confirmed = confirmed_positions(&collection);
            state.revision = collection.revision;
            state.epoch += 1;
            state.order.clone()
        };
        info!(%collection_id, revision = collection.revision, "collection reloaded");
        self.publish(ClientEvent::OrderChanged {
            collection_id,
            order,
        });
        Ok(collection)
    }

    /// Shows `new_order` immediately, then persists it.
    ///
    /// On failure the order shown before this call is restored and returned in
    /// the failure. Nothing is retried.
    pub async fn apply_and_persist(
        &self,
        collection_id: CollectionId,
        new_order: Vec<ItemId>,
    ) -> ReorderResult {
        let (snapshot, epoch, queued) = {
            let mut guard = self.collections.lock().await;
            let Some(state) = guard.get_mut(&collection_id) else {
                return Err(ReorderFailure {
                    reason: ReorderError::NotLoaded(collection_id),
                    previous_order: Vec::new(),
                });
            };
            if new_order == state.order {
                return Ok(ReorderOutcome::Unchanged);
            }
            if !is_rearrangement(&state.order, &new_order) {
                warn!(%collection_id, "rejected order that does not match the loaded items");
                return Err(ReorderFailure {
                    reason: ReorderError::InvalidOrder,
                    previous_order: state.order.clone(),
                });
            }

            let snapshot = std::mem::replace(&mut state.order, new_order.clone());
            self.publish(ClientEvent::OrderChanged {
                collection_id,
                order: new_order.clone(),
            });
            let queued = join_gate_queue(state.gate.clone()).await;
            (snapshot, state.epoch, queued)
        };

        let _turn = match queued {
            Ok(turn) => turn,
            Err(waiting) => waiting.await,
        };

        let batch = {
            let guard = self.collections.lock().await;
            let Some(state) = guard.get(&collection_id) else {
                return Err(ReorderFailure {
                    reason: ReorderError::NotLoaded(collection_id),
                    previous_order: snapshot,
                });
            };
            if state.epoch != epoch {
                debug!(%collection_id, "reorder dropped after rollback");
                return Err(ReorderFailure {
                    reason: ReorderError::Superseded,
                    previous_order: state.order.clone(),
                });
            }
            PositionBatch {
                expected_revision: state.revision,
                updates: changed_positions(&new_order, &state.confirmed),
                origin: Some(self.origin.clone()),
            }
        };

        if batch.updates.is_empty() {
            let revision = self.revision(collection_id).await.unwrap_or_default();
            return Ok(ReorderOutcome::Applied {
                order: new_order,
                revision,
            });
        }

        match self.store.set_positions(collection_id, &batch).await {
            Ok(revision) => {
                {
                    let mut guard = self.collections.lock().await;
                    if let Some(state) = guard.get_mut(&collection_id) {
                        for update in &batch.updates {
                            state.confirmed.insert(update.item_id, update.position);
                        }
                        state.revision = revision;
                    }
                }
                info!(
                    %collection_id,
                    revision,
                    updates = batch.updates.len(),
                    "order persisted"
                );
                self.publish(ClientEvent::Notice(Notice::success("order updated")));
                Ok(ReorderOutcome::Applied {
                    order: new_order,
                    revision,
                })
            }
            Err(err) => Err(self.roll_back(collection_id, snapshot, err).await),
        }
    }

    /// Reacts to a change announced by the server. Returns whether a reload
    /// was suggested.
    pub async fn observe_remote_change(
        &self,
        collection_id: CollectionId,
        revision: i64,
        origin: Option<&OriginTag>,
    ) -> bool {
        if origin == Some(&self.origin) {
            return false;
        }
        let known = {
            let guard = self.collections.lock().await;
            match guard.get(&collection_id) {
                Some(state) => state.revision,
                None => return false,
            }
        };
        if revision <= known {
            return false;
        }
        debug!(%collection_id, revision, known, "collection changed elsewhere");
        self.publish(ClientEvent::ReloadSuggested {
            collection_id,
            revision,
        });
        true
    }

    async fn roll_back(
        &self,
        collection_id: CollectionId,
        snapshot: Vec<ItemId>,
        err: StoreError,
    ) -> ReorderFailure {
        {
            let mut guard = self.collections.lock().await;
            if let Some(state) = guard.get_mut(&collection_id) {
                state.order = snapshot.clone();
                state.epoch += 1;
            }
        }
        warn!(%collection_id, error = %err, "reorder failed; restored previous order");

        let reason = ReorderError::from_store(err);
        self.publish(ClientEvent::OrderChanged {
            collection_id,
            order: snapshot.clone(),
        });
        self.publish(ClientEvent::Notice(Notice::error("could not update order")));
        if let ReorderError::StaleOrderConflict { actual, .. } = &reason {
            self.publish(ClientEvent::ReloadSuggested {
                collection_id,
                revision: *actual,
            });
        }
        ReorderFailure {
            reason,
            previous_order: snapshot,
        }
    }

    pub(crate) fn publish(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

/// Polls the gate once so the caller's place in its FIFO queue is fixed
/// while the state lock is still held.
async fn join_gate_queue(gate: Arc<Mutex<()>>) -> Result<OwnedMutexGuard<()>, GateTurn> {
    let mut turn: GateTurn = Box::pin(gate.lock_owned());
    match futures::poll!(turn.as_mut()) {
        Poll::Ready(guard) => Ok(guard),
        Poll::Pending => Err(turn),
    }
}

fn confirmed_positions(collection: &OrderedCollection) -> HashMap<ItemId, i64> {
    collection
        .items
        .iter()
        .map(|item| (item.item_id, item.position))
        .collect()
}

/// One update per item whose stored position differs from its index.
fn changed_positions(order: &[ItemId], confirmed: &HashMap<ItemId, i64>) -> Vec<PositionUpdate> {
    order
        .iter()
        .enumerate()
        .filter_map(|(index, item_id)| {
            let position = index as i64;
            (confirmed.get(item_id) != Some(&position)).then_some(PositionUpdate {
                item_id: *item_id,
                position,
            })
        })
        .collect()
}

fn is_rearrangement(current: &[ItemId], candidate: &[ItemId]) -> bool {
    if current.len() != candidate.len() {
        return false;
    }
    let expected: HashSet<ItemId> = current.iter().copied().collect();
    let mut seen = HashSet::with_capacity(candidate.len());
    candidate
        .iter()
        .all(|item| expected.contains(item) && seen.insert(*item))
}

#[cfg(test)]
#[path = "tests/optimistic_tests.rs"]
mod tests;
