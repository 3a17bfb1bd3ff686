use std::sync::Arc;

use client_core::{OptimisticOrderAdapter, ReorderController, ReorderOutcome};
use shared::domain::{CollectionId, CollectionKind, CollectionScope, ItemId, OrderedCollection};
use storage::Storage;

/// Deterministic step source so failures replay.
struct Lcg(u64);

impl Lcg {
    fn below(&mut self, bound: usize) -> usize {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.0 >> 33) as usize) % bound
    }
}

async fn seeded_storage(
    dir: &tempfile::TempDir,
    labels: &[&str],
) -> (Arc<Storage>, CollectionId, Vec<ItemId>) {
    let path = dir.path().join("drag.db");
    let url = format!("sqlite://{}", path.to_string_lossy().replace('\\', "/"));
    let storage = Arc::new(Storage::new(&url).await.expect("db"));
    let scope = CollectionScope::new(CollectionKind::TemplateBlocks, "template-9");

    let mut ids = Vec::new();
    for label in labels {
        ids.push(
            storage
                .append_item(&scope, label)
                .await
                .expect("append")
                .item
                .item_id,
        );
    }
    let collection_id = storage
        .find_collection(&scope)
        .await
        .expect("find")
        .expect("collection exists");
    (storage, collection_id, ids)
}

fn assert_strictly_increasing(stored: &OrderedCollection) {
    let positions: Vec<i64> = stored.items.iter().map(|item| item.position).collect();
    assert!(
        positions.windows(2).all(|pair| pair[0] < pair[1]),
        "positions not strictly increasing: {positions:?}"
    );
}

#[tokio::test]
async fn drop_sequence_over_a_gapped_collection_reads_back_as_displayed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (storage, collection_id, ids) =
        seeded_storage(&dir, &["A", "B", "C", "D", "E", "F"]).await;

    storage
        .remove_item(collection_id, ids[2])
        .await
        .expect("remove C");
    let gapped = storage.load_collection(collection_id).await.expect("load");
    let positions: Vec<i64> = gapped.items.iter().map(|item| item.position).collect();
    assert_eq!(positions, vec![0, 1, 3, 4, 5]);

    let adapter = OptimisticOrderAdapter::new(storage.clone());
    adapter.load(collection_id).await.expect("adapter load");
    let mut controller = ReorderController::new();
    let mut steps = Lcg(0x5eed);
    let mut persisted = 0;

    for step in 0..60 {
        let shown = adapter.order(collection_id).await.expect("loaded");
        let item = shown[steps.below(shown.len())];
        let target = steps.below(shown.len());

        controller.begin_drag(item, &shown).expect("begin drag");
        controller.hover_slot(target);
        if let Some(next) = controller.drop(target, &shown).expect("drop") {
            let outcome = adapter
                .apply_and_persist(collection_id, next.clone())
                .await
                .expect("persist");
            assert!(matches!(
                outcome,
                ReorderOutcome::Applied { ref order, .. } if *order == next
            ));
            persisted += 1;
        }
        assert!(controller.dragging().is_none());

        let displayed = adapter.order(collection_id).await.expect("loaded");
        let stored = storage
            .load_collection(collection_id)
            .await
            .expect("read back");
        assert_eq!(stored.item_ids(), displayed, "step {step}");
        assert_strictly_increasing(&stored);
        assert_eq!(adapter.revision(collection_id).await, Some(stored.revision));
    }
    assert!(persisted > 0);
}
