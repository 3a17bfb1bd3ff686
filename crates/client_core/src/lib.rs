use shared::domain::{CollectionId, ItemId};

pub mod error;
pub mod notice;
pub mod optimistic;
pub mod remote;
pub mod reorder;

pub use error::{ErrorCategory, ReorderError, ReorderFailure};
pub use notice::{Notice, NoticeBoard, NoticeId, NoticeLevel};
pub use optimistic::{OptimisticOrderAdapter, ReorderOutcome, ReorderResult};
pub use remote::{spawn_event_watcher, HttpPositionStore};
pub use reorder::{move_item, DragAction, DragError, DragOutcome, ReorderController};

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The displayed order of a collection changed, optimistically or by
    /// rollback or reload.
    OrderChanged {
        collection_id: CollectionId,
        order: Vec<ItemId>,
    },
    Notice(Notice),
    /// Another session moved the collection to `revision`.
    ReloadSuggested {
        collection_id: CollectionId,
        revision: i64,
    },
    Error(String),
}
