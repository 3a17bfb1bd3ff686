//! Drag-and-drop state machine for one ordered list.
//!
//! The controller never owns the list. Every operation that needs the order
//! takes the latest in-memory order from the caller, so a drop always works
//! against what is on screen even if an earlier reorder is still persisting.

use shared::domain::ItemId;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DragAction {
    BeginDrag(ItemId),
    Hover(usize),
    Drop(usize),
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DragOutcome {
    Started { source_index: usize },
    Highlight { changed: bool },
    Reordered(Vec<ItemId>),
    Unchanged,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DragError {
    #[error("item {0} is already being dragged")]
    AlreadyDragging(ItemId),
    #[error("item {0} is not in the list")]
    UnknownItem(ItemId),
    #[error("no drag in progress")]
    NotDragging,
    #[error("drop target {index} is outside a list of {len} items")]
    InvalidDropTarget { index: usize, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DragState {
    item: ItemId,
    source_index: usize,
    highlight: Option<usize>,
}

#[derive(Debug, Default)]
pub struct ReorderController {
    drag: Option<DragState>,
}

impl ReorderController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dragging(&self) -> Option<ItemId> {
        self.drag.map(|d| d.item)
    }

    pub fn highlighted_slot(&self) -> Option<usize> {
        self.drag.and_then(|d| d.highlight)
    }

    /// Single entry point for UI input. `current_order` is only read by
    /// `BeginDrag` and `Drop`.
    pub fn apply(
        &mut self,
        action: DragAction,
        current_order: &[ItemId],
    ) -> Result<DragOutcome, DragError> {
        match action {
            DragAction::BeginDrag(item) => {
                let source_index = self.begin_drag(item, current_order)?;
                Ok(DragOutcome::Started { source_index })
            }
            DragAction::Hover(index) => Ok(DragOutcome::Highlight {
                changed: self.hover_slot(index),
            }),
            DragAction::Drop(index) => Ok(match self.drop(index, current_order)? {
                Some(order) => DragOutcome::Reordered(order),
                None => DragOutcome::Unchanged,
            }),
            DragAction::Cancel => {
                self.cancel_drag();
                Ok(DragOutcome::Cancelled)
            }
        }
    }

    pub fn begin_drag(&mut self, item: ItemId, current_order: &[ItemId]) -> Result<usize, DragError> {
        if let Some(active) = self.drag {
            return Err(DragError::AlreadyDragging(active.item));
        }
        let source_index = index_of(current_order, item).ok_or(DragError::UnknownItem(item))?;
        self.drag = Some(DragState {
            item,
            source_index,
            highlight: None,
        });
        debug!(%item, source_index, "drag started");
        Ok(source_index)
    }

    /// Moves the drop highlight. Returns whether anything changed.
    pub fn hover_slot(&mut self, index: usize) -> bool {
        match self.drag.as_mut() {
            Some(state) if state.highlight != Some(index) => {
                state.highlight = Some(index);
                true
            }
            _ => false,
        }
    }

    /// Finishes the drag. The dragged item is located in `current_order`
    /// rather than where it was picked up, then reinserted at `index` of the
    /// remaining sequence.
    ///
    /// `Ok(None)` means the drop landed on the item's own slot. Drag state is
    /// cleared whatever the result.
    pub fn drop(
        &mut self,
        index: usize,
        current_order: &[ItemId],
    ) -> Result<Option<Vec<ItemId>>, DragError> {
        let state = self.drag.take().ok_or(DragError::NotDragging)?;
        let source = index_of(current_order, state.item).ok_or(DragError::UnknownItem(state.item))?;
        if index >= current_order.len() {
            return Err(DragError::InvalidDropTarget {
                index,
                len: current_order.len(),
            });
        }
        if index == source {
            debug!(item = %state.item, index, "drop on own slot ignored");
            return Ok(None);
        }
        if source != state.source_index {
            debug!(
                item = %state.item,
                picked_up = state.source_index,
                now = source,
                "list changed during drag"
            );
        }
        Ok(Some(move_item(current_order, source, index)))
    }

    pub fn cancel_drag(&mut self) {
        if let Some(state) = self.drag.take() {
            debug!(item = %state.item, "drag cancelled");
        }
    }
}

/// Removes the item at `from` and reinserts it at `to` of the remaining
/// sequence. Both indices must be in bounds.
pub fn move_item(order: &[ItemId], from: usize, to: usize) -> Vec<ItemId> {
    let mut next = order.to_vec();
    let item = next.remove(from);
    next.insert(to, item);
    next
}

fn index_of(order: &[ItemId], item: ItemId) -> Option<usize> {
    order.iter().position(|candidate| *candidate == item)
}

#[cfg(test)]
#[path = "tests/reorder_tests.rs"]
mod tests;
