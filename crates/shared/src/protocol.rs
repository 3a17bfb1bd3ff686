use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    domain::{CollectionId, CollectionKind, CollectionScope, ItemId},
    error::ApiError,
};

/// Identifies the session that issued a write so it can ignore the echo of
/// its own change on the event stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OriginTag(pub String);

impl OriginTag {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub item_id: ItemId,
    pub position: i64,
}

/// One reorder worth of position writes, applied all-or-nothing.
///
/// `expected_revision` is the collection revision the writer last observed;
/// a store rejects the batch when the collection moved on since then.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionBatch {
    pub expected_revision: i64,
    pub updates: Vec<PositionUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<OriginTag>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionsUpdated {
    pub collection_id: CollectionId,
    pub revision: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendItemRequest {
    pub scope: CollectionScope,
    pub label: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListCollectionsQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<CollectionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    CollectionReordered {
        collection_id: CollectionId,
        revision: i64,
        #[serde(default)]
        origin: Option<OriginTag>,
    },
    ItemAppended {
        collection_id: CollectionId,
        item_id: ItemId,
        revision: i64,
    },
    ItemRemoved {
        collection_id: CollectionId,
        item_id: ItemId,
        revision: i64,
    },
    Error(ApiError),
}

impl ServerEvent {
    pub fn collection_id(&self) -> Option<CollectionId> {
        match self {
            ServerEvent::CollectionReordered { collection_id, .. }
            | ServerEvent::ItemAppended { collection_id, .. }
            | ServerEvent::ItemRemoved { collection_id, .. } => Some(*collection_id),
            ServerEvent::Error(_) => None,
        }
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
