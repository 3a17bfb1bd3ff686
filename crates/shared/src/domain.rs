use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(CollectionId);
id_newtype!(ItemId);

/// What kind of parent owns an ordered collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    /// Content blocks inside one quote template.
    TemplateBlocks,
    /// Quote templates belonging to one organization.
    OrganizationTemplates,
}

impl CollectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionKind::TemplateBlocks => "template_blocks",
            CollectionKind::OrganizationTemplates => "organization_templates",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "template_blocks" | "blocks" => Some(CollectionKind::TemplateBlocks),
            "organization_templates" | "templates" => Some(CollectionKind::OrganizationTemplates),
            _ => None,
        }
    }
}

/// The parent a collection is scoped to, e.g. "blocks of template 42".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionScope {
    pub kind: CollectionKind,
    pub parent_ref: String,
}

impl CollectionScope {
    pub fn new(kind: CollectionKind, parent_ref: impl Into<String>) -> Self {
        Self {
            kind,
            parent_ref: parent_ref.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSummary {
    pub collection_id: CollectionId,
    pub scope: CollectionScope,
    pub revision: i64,
    pub item_count: u64,
}

/// An entity that belongs to a user-visible ordered collection.
///
/// `position` is a rank, not an index: it sorts the collection but gaps are
/// allowed and never closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderedItem {
    pub item_id: ItemId,
    pub collection_id: CollectionId,
    pub label: String,
    pub position: i64,
    pub created_at: DateTime<Utc>,
}

/// A collection as read back from a store, items in display order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderedCollection {
    pub collection_id: CollectionId,
    pub scope: CollectionScope,
    pub revision: i64,
    pub items: Vec<OrderedItem>,
}

impl OrderedCollection {
    pub fn item_ids(&self) -> Vec<ItemId> {
        self.items.iter().map(|item| item.item_id).collect()
    }
}

/// Sorts items into the canonical read order: position, then creation time,
/// then id.
pub fn sort_for_display(items: &mut [OrderedItem]) {
    items.sort_by(|a, b| {
        a.position
            .cmp(&b.position)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.item_id.cmp(&b.item_id))
    });
}
