use std::collections::HashSet;

use shared::{
    domain::{CollectionId, CollectionKind, CollectionSummary, ItemId, OrderedCollection, OrderedItem},
    error::{ApiError, ErrorCode},
    protocol::{AppendItemRequest, PositionBatch, PositionsUpdated, ServerEvent},
};
use storage::{Storage, StoreError};
use tracing::info;

const MAX_LABEL_CHARS: usize = 200;
const MAX_PARENT_REF_CHARS: usize = 128;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

pub async fn list_collections(
    ctx: &ApiContext,
    kind: Option<CollectionKind>,
    parent_ref: Option<&str>,
) -> Result<Vec<CollectionSummary>, ApiError> {
    ctx.storage
        .list_collections(kind, parent_ref)
        .await
        .map_err(internal)
}

pub async fn get_collection(
    ctx: &ApiContext,
    collection_id: CollectionId,
) -> Result<OrderedCollection, ApiError> {
    ctx.storage
        .load_collection(collection_id)
        .await
        .map_err(store_error)
}

/// Appends an item at the tail of its scope. Returns the stored item together
/// with the event to fan out.
pub async fn append_item(
    ctx: &ApiContext,
    request: &AppendItemRequest,
) -> Result<(OrderedItem, ServerEvent), ApiError> {
    let label = request.label.trim();
    if label.is_empty() {
        return Err(ApiError::new(ErrorCode::Validation, "label must not be empty"));
    }
    if label.chars().count() > MAX_LABEL_CHARS {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!("label exceeds {MAX_LABEL_CHARS} characters"),
        ));
    }
    let parent_ref = request.scope.parent_ref.trim();
    if parent_ref.is_empty() || parent_ref.chars().count() > MAX_PARENT_REF_CHARS {
        return Err(ApiError::new(ErrorCode::Validation, "invalid parent_ref"));
    }

    let mut scope = request.scope.clone();
    scope.parent_ref = parent_ref.to_string();
    let appended = ctx
        .storage
        .append_item(&scope, label)
        .await
        .map_err(internal)?;
    info!(
        collection_id = %appended.item.collection_id,
        item_id = %appended.item.item_id,
        position = appended.item.position,
        "item appended"
    );

    let event = ServerEvent::ItemAppended {
        collection_id: appended.item.collection_id,
        item_id: appended.item.item_id,
        revision: appended.revision,
    };
    Ok((appended.item, event))
}

pub async fn remove_item(
    ctx: &ApiContext,
    collection_id: CollectionId,
    item_id: ItemId,
) -> Result<ServerEvent, ApiError> {
    let revision = ctx
        .storage
        .remove_item(collection_id, item_id)
        .await
        .map_err(store_error)?;
    info!(%collection_id, %item_id, revision, "item removed");
    Ok(ServerEvent::ItemRemoved {
        collection_id,
        item_id,
        revision,
    })
}

/// Applies a position batch. A batch may only name each item once and may not
/// hand the same position to two items.
pub async fn set_positions(
    ctx: &ApiContext,
    collection_id: CollectionId,
    batch: &PositionBatch,
) -> Result<(PositionsUpdated, ServerEvent), ApiError> {
    validate_batch(batch)?;

    let revision = ctx
        .storage
        .set_positions(collection_id, batch)
        .await
        .map_err(store_error)?;
    info!(
        %collection_id,
        revision,
        updates = batch.updates.len(),
        "positions updated"
    );

    Ok((
        PositionsUpdated {
            collection_id,
            revision,
        },
        ServerEvent::CollectionReordered {
            collection_id,
            revision,
            origin: batch.origin.clone(),
        },
    ))
}

fn validate_batch(batch: &PositionBatch) -> Result<(), ApiError> {
    let mut items = HashSet::with_capacity(batch.updates.len());
    let mut positions = HashSet::with_capacity(batch.updates.len());
    for update in &batch.updates {
        if !items.insert(update.item_id) {
            return Err(ApiError::new(
                ErrorCode::Validation,
                format!("item {} appears twice in batch", update.item_id),
            ));
        }
        if !positions.insert(update.position) {
            return Err(ApiError::new(
                ErrorCode::Validation,
                format!("position {} assigned twice in batch", update.position),
            ));
        }
    }
    Ok(())
}

fn store_error(err: StoreError) -> ApiError {
    match err {
        StoreError::CollectionNotFound(_) => ApiError::new(ErrorCode::NotFound, err.to_string()),
        StoreError::UnknownItem { .. } | StoreError::Rejected { .. } => {
            ApiError::new(ErrorCode::Validation, err.to_string())
        }
        StoreError::StaleRevision { .. } => ApiError::new(ErrorCode::Conflict, err.to_string()),
        StoreError::Backend(inner) => internal(inner),
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{
        domain::CollectionScope,
        protocol::{OriginTag, PositionUpdate},
    };

    async fn setup(labels: &[&str]) -> (ApiContext, CollectionId, Vec<ItemId>) {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let ctx = ApiContext { storage };
        let mut ids = Vec::new();
        let mut collection_id = CollectionId(0);
        for label in labels {
            let (item, _) = append_item(
                &ctx,
                &AppendItemRequest {
                    scope: CollectionScope::new(CollectionKind::TemplateBlocks, "tpl-1"),
                    label: (*label).to_string(),
                },
            )
            .await
            .expect("append");
            collection_id = item.collection_id;
            ids.push(item.item_id);
        }
        (ctx, collection_id, ids)
    }

    #[tokio::test]
    async fn blank_label_is_rejected() {
        let (ctx, _, _) = setup(&[]).await;
        let err = append_item(
            &ctx,
            &AppendItemRequest {
                scope: CollectionScope::new(CollectionKind::TemplateBlocks, "tpl-1"),
                label: "   ".into(),
            },
        )
        .await
        .expect_err("should fail");
        assert_eq!(err.code, ErrorCode::Validation);
    }

    #[tokio::test]
    async fn append_event_carries_new_revision() {
        let (ctx, collection_id, _) = setup(&["A"]).await;
        let (item, event) = append_item(
            &ctx,
            &AppendItemRequest {
                scope: CollectionScope::new(CollectionKind::TemplateBlocks, "tpl-1"),
                label: "B".into(),
            },
        )
        .await
        .expect("append");
        assert_eq!(item.position, 1);
        assert!(matches!(
            event,
            ServerEvent::ItemAppended { collection_id: c, revision: 2, .. } if c == collection_id
        ));
    }

    #[tokio::test]
    async fn stale_batch_maps_to_conflict() {
        let (ctx, collection_id, ids) = setup(&["A", "B"]).await;
        let err = set_positions(
            &ctx,
            collection_id,
            &PositionBatch {
                expected_revision: 0,
                updates: vec![PositionUpdate {
                    item_id: ids[0],
                    position: 1,
                }],
                origin: None,
            },
        )
        .await
        .expect_err("stale");
        assert_eq!(err.code, ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn duplicate_positions_in_batch_are_rejected() {
        let (ctx, collection_id, ids) = setup(&["A", "B"]).await;
        let err = set_positions(
            &ctx,
            collection_id,
            &PositionBatch {
                expected_revision: 2,
                updates: vec![
                    PositionUpdate {
                        item_id: ids[0],
                        position: 1,
                    },
                    PositionUpdate {
                        item_id: ids[1],
                        position: 1,
                    },
                ],
                origin: None,
            },
        )
        .await
        .expect_err("duplicate");
        assert_eq!(err.code, ErrorCode::Validation);
    }

    #[tokio::test]
    async fn reorder_event_echoes_origin() {
        let (ctx, collection_id, ids) = setup(&["A", "B"]).await;
        let origin = OriginTag::generate();
        let (updated, event) = set_positions(
            &ctx,
            collection_id,
            &PositionBatch {
                expected_revision: 2,
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
                origin: Some(origin.clone()),
            },
        )
        .await
        .expect("reorder");
        assert_eq!(updated.revision, 3);
        assert!(matches!(
            event,
            ServerEvent::CollectionReordered { origin: Some(o), .. } if o == origin
        ));

        let collection = get_collection(&ctx, collection_id).await.expect("load");
        assert_eq!(collection.item_ids(), vec![ids[1], ids[0]]);
    }

    #[tokio::test]
    async fn missing_collection_maps_to_not_found() {
        let (ctx, _, _) = setup(&[]).await;
        let err = get_collection(&ctx, CollectionId(404))
            .await
            .expect_err("missing");
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn removing_foreign_item_is_a_validation_error() {
        let (ctx, collection_id, _) = setup(&["A"]).await;
        let err = remove_item(&ctx, collection_id, ItemId(999))
            .await
            .expect_err("unknown");
        assert_eq!(err.code, ErrorCode::Validation);
    }
}
