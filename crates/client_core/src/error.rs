use shared::domain::{CollectionId, ItemId};
use storage::StoreError;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transport,
    Conflict,
    Validation,
    Unknown,
}

#[derive(Debug, Error)]
pub enum ReorderError {
    #[error("could not update order: {0}")]
    PersistenceFailure(#[source] StoreError),
    #[error("collection {collection_id} was changed in another session (expected revision {expected}, found {actual})")]
    StaleOrderConflict {
        collection_id: CollectionId,
        expected: i64,
        actual: i64,
    },
    #[error("an earlier reorder of this collection failed and was rolled back")]
    Superseded,
    #[error("new order is not a rearrangement of the current items")]
    InvalidOrder,
    #[error("collection {0} is not loaded")]
    NotLoaded(CollectionId),
}

impl ReorderError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ReorderError::PersistenceFailure(StoreError::Backend(_)) => ErrorCategory::Transport,
            ReorderError::PersistenceFailure(
                StoreError::UnknownItem { .. } | StoreError::Rejected { .. },
            ) => ErrorCategory::Validation,
            ReorderError::PersistenceFailure(_) => ErrorCategory::Unknown,
            ReorderError::StaleOrderConflict { .. } | ReorderError::Superseded => {
                ErrorCategory::Conflict
            }
            ReorderError::InvalidOrder | ReorderError::NotLoaded(_) => ErrorCategory::Validation,
        }
    }

    pub(crate) fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::StaleRevision {
                collection_id,
                expected,
                actual,
            } => ReorderError::StaleOrderConflict {
                collection_id,
                expected,
                actual,
            },
            other => ReorderError::PersistenceFailure(other),
        }
    }
}

/// A reorder that did not stick. `previous_order` is what the collection
/// shows after the failure.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct ReorderFailure {
    #[source]
    pub reason: ReorderError,
    pub previous_order: Vec<ItemId>,
}
