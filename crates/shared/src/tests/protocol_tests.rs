use super::*;

#[test]
fn server_events_use_tagged_snake_case_shape() {
    let event = ServerEvent::CollectionReordered {
        collection_id: CollectionId(7),
        revision: 3,
        origin: Some(OriginTag("session-a".into())),
    };
    let value = serde_json::to_value(&event).expect("json");
    assert_eq!(value["type"], "collection_reordered");
    assert_eq!(value["payload"]["collection_id"], 7);
    assert_eq!(value["payload"]["origin"], "session-a");
}

#[test]
fn reorder_event_without_origin_still_parses() {
    let raw = r#"{"type":"collection_reordered","payload":{"collection_id":1,"revision":2}}"#;
    let event: ServerEvent = serde_json::from_str(raw).expect("parse");
    let ServerEvent::CollectionReordered { origin, .. } = event else {
        panic!("expected reorder event");
    };
    assert!(origin.is_none());
}

#[test]
fn position_batch_omits_missing_origin() {
    let batch = PositionBatch {
        expected_revision: 4,
        updates: vec![PositionUpdate {
            item_id: ItemId(9),
            position: 0,
        }],
        origin: None,
    };
    let value = serde_json::to_value(&batch).expect("json");
    assert!(value.get("origin").is_none());
    assert_eq!(value["updates"][0]["item_id"], 9);
}

#[test]
fn collection_kind_accepts_short_aliases() {
    assert_eq!(
        CollectionKind::parse("Blocks"),
        Some(CollectionKind::TemplateBlocks)
    );
    assert_eq!(
        CollectionKind::parse("organization_templates"),
        Some(CollectionKind::OrganizationTemplates)
    );
    assert_eq!(CollectionKind::parse("orders"), None);
}

#[test]
fn generated_origin_tags_are_unique() {
    assert_ne!(OriginTag::generate(), OriginTag::generate());
}

#[test]
fn error_event_carries_code_and_message() {
    let event = ServerEvent::Error(ApiError::new(
        crate::error::ErrorCode::Internal,
        "missed 4 events",
    ));
    let value = serde_json::to_value(&event).expect("json");
    assert_eq!(value["type"], "error");
    assert_eq!(value["payload"]["code"], "internal");
    assert_eq!(value["payload"]["message"], "missed 4 events");
    assert_eq!(event.collection_id(), None);
}
