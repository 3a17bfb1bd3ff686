use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite, Transaction,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;
use tracing::{debug, warn};

use shared::{
    domain::{
        sort_for_display, CollectionId, CollectionKind, CollectionScope, CollectionSummary, ItemId,
        OrderedCollection, OrderedItem,
    },
    protocol::PositionBatch,
};

mod memory;
pub use memory::MemoryPositionStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("collection {0} not found")]
    CollectionNotFound(CollectionId),
    #[error("item {item_id} is not part of collection {collection_id}")]
    UnknownItem {
        collection_id: CollectionId,
        item_id: ItemId,
    },
    #[error("collection {collection_id} is at revision {actual}, expected {expected}")]
    StaleRevision {
        collection_id: CollectionId,
        expected: i64,
        actual: i64,
    },
    #[error("collection {collection_id} rejected the update: {message}")]
    Rejected {
        collection_id: CollectionId,
        message: String,
    },
    #[error("storage backend failure: {0}")]
    Backend(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        StoreError::Backend(anyhow::Error::new(value))
    }
}

/// Backing store contract for ordered collections.
///
/// Reads return items by position ascending with ties broken by creation time
/// and id. Position writes are applied as one batch or not at all.
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn load_collection(
        &self,
        collection_id: CollectionId,
    ) -> Result<OrderedCollection, StoreError>;

    /// Applies `batch` and returns the collection's new revision.
    async fn set_positions(
        &self,
        collection_id: CollectionId,
        batch: &PositionBatch,
    ) -> Result<i64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct AppendedItem {
    pub item: OrderedItem,
    pub revision: i64,
}

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn find_collection(&self, scope: &CollectionScope) -> Result<Option<CollectionId>> {
        let row = sqlx::query("SELECT id FROM collections WHERE kind = ? AND parent_ref = ?")
            .bind(scope.kind.as_str())
            .bind(&scope.parent_ref)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| CollectionId(r.get::<i64, _>(0))))
    }

    pub async fn list_collections(
        &self,
        kind: Option<CollectionKind>,
        parent_ref: Option<&str>,
    ) -> Result<Vec<CollectionSummary>> {
        let rows = sqlx::query(
            "SELECT c.id, c.kind, c.parent_ref, c.revision, COUNT(i.id)
             FROM collections c
             LEFT JOIN ordered_items i ON i.collection_id = c.id
             WHERE (?1 IS NULL OR c.kind = ?1) AND (?2 IS NULL OR c.parent_ref = ?2)
             GROUP BY c.id
             ORDER BY c.kind ASC, c.parent_ref ASC",
        )
        .bind(kind.map(|k| k.as_str()))
        .bind(parent_ref)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(CollectionSummary {
                    collection_id: CollectionId(r.get::<i64, _>(0)),
                    scope: CollectionScope {
                        kind: parse_kind(&r.get::<String, _>(1))?,
                        parent_ref: r.get::<String, _>(2),
                    },
                    revision: r.get::<i64, _>(3),
                    item_count: u64::try_from(r.get::<i64, _>(4)).unwrap_or_default(),
                })
            })
            .collect()
    }

    /// Appends an item at the tail of the scope's collection, creating the
    /// collection when this is its first item.
    pub async fn append_item(&self, scope: &CollectionScope, label: &str) -> Result<AppendedItem> {
        let mut tx = self.pool.begin().await?;

        let collection_id = ensure_collection(&mut tx, scope).await?;
        let position: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(position), -1) + 1 FROM ordered_items WHERE collection_id = ?",
        )
        .bind(collection_id.0)
        .fetch_one(&mut *tx)
        .await?;

        let created_at = Utc::now();
        let rec = sqlx::query(
            "INSERT INTO ordered_items (collection_id, label, position, created_at)
             VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(collection_id.0)
        .bind(label)
        .bind(position)
        .bind(created_at)
        .fetch_one(&mut *tx)
        .await?;
        let revision = bump_revision(&mut tx, collection_id).await?;
        tx.commit().await?;

        Ok(AppendedItem {
            item: OrderedItem {
                item_id: ItemId(rec.get::<i64, _>(0)),
                collection_id,
                label: label.to_string(),
                position,
                created_at,
            },
            revision,
        })
    }

    /// Removes an item. The gap it leaves behind is intentionally kept.
    pub async fn remove_item(
        &self,
        collection_id: CollectionId,
        item_id: ItemId,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        current_revision(&mut tx, collection_id).await?;

        let removed = sqlx::query("DELETE FROM ordered_items WHERE id = ? AND collection_id = ?")
            .bind(item_id.0)
            .bind(collection_id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if removed == 0 {
            return Err(StoreError::UnknownItem {
                collection_id,
                item_id,
            });
        }

        let revision = bump_revision(&mut tx, collection_id).await?;
        tx.commit().await?;
        Ok(revision)
    }

    pub async fn load_collection(
        &self,
        collection_id: CollectionId,
    ) -> Result<OrderedCollection, StoreError> {
        let header = sqlx::query("SELECT kind, parent_ref, revision FROM collections WHERE id = ?")
            .bind(collection_id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::CollectionNotFound(collection_id))?;

        let rows = sqlx::query(
            "SELECT id, collection_id, label, position, created_at
             FROM ordered_items
             WHERE collection_id = ?
             ORDER BY position ASC, created_at ASC, id ASC",
        )
        .bind(collection_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut items = rows
            .iter()
            .map(item_from_row)
            .collect::<Result<Vec<_>>>()?;
        // Text timestamps of mixed precision can compare differently in SQL
        // than as parsed values.
        sort_for_display(&mut items);

        Ok(OrderedCollection {
            collection_id,
            scope: CollectionScope {
                kind: parse_kind(&header.get::<String, _>(0))?,
                parent_ref: header.get::<String, _>(1),
            },
            revision: header.get::<i64, _>(2),
            items,
        })
    }

    pub async fn set_positions(
        &self,
        collection_id: CollectionId,
        batch: &PositionBatch,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;

        let actual = current_revision(&mut tx, collection_id).await?;
        if actual != batch.expected_revision {
            warn!(
                collection_id = collection_id.0,
                expected = batch.expected_revision,
                actual,
                "rejecting position batch against stale revision"
            );
            return Err(StoreError::StaleRevision {
                collection_id,
                expected: batch.expected_revision,
                actual,
            });
        }
        if batch.updates.is_empty() {
            return Ok(actual);
        }

        for update in &batch.updates {
            let changed = sqlx::query(
                "UPDATE ordered_items SET position = ? WHERE id = ? AND collection_id = ?",
            )
            .bind(update.position)
            .bind(update.item_id.0)
            .bind(collection_id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if changed == 0 {
                return Err(StoreError::UnknownItem {
                    collection_id,
                    item_id: update.item_id,
                });
            }
        }

        let revision = bump_revision(&mut tx, collection_id).await?;
        tx.commit().await?;
        debug!(
            collection_id = collection_id.0,
            updates = batch.updates.len(),
            revision,
            "applied position batch"
        );
        Ok(revision)
    }
}

#[async_trait]
impl PositionStore for Storage {
    async fn load_collection(
        &self,
        collection_id: CollectionId,
    ) -> Result<OrderedCollection, StoreError> {
        Storage::load_collection(self, collection_id).await
    }

    async fn set_positions(
        &self,
        collection_id: CollectionId,
        batch: &PositionBatch,
    ) -> Result<i64, StoreError> {
        Storage::set_positions(self, collection_id, batch).await
    }
}

async fn ensure_collection(
    tx: &mut Transaction<'_, Sqlite>,
    scope: &CollectionScope,
) -> Result<CollectionId> {
    let rec = sqlx::query(
        "INSERT INTO collections (kind, parent_ref, revision, created_at) VALUES (?, ?, 0, ?)
         ON CONFLICT(kind, parent_ref) DO UPDATE SET kind = excluded.kind
         RETURNING id",
    )
    .bind(scope.kind.as_str())
    .bind(&scope.parent_ref)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await
    .with_context(|| {
        format!(
            "failed to ensure collection {}:{}",
            scope.kind.as_str(),
            scope.parent_ref
        )
    })?;
    Ok(CollectionId(rec.get::<i64, _>(0)))
}

async fn current_revision(
    tx: &mut Transaction<'_, Sqlite>,
    collection_id: CollectionId,
) -> Result<i64, StoreError> {
    let revision: Option<i64> = sqlx::query_scalar("SELECT revision FROM collections WHERE id = ?")
        .bind(collection_id.0)
        .fetch_optional(&mut **tx)
        .await?;
    revision.ok_or(StoreError::CollectionNotFound(collection_id))
}

async fn bump_revision(
    tx: &mut Transaction<'_, Sqlite>,
    collection_id: CollectionId,
) -> Result<i64, StoreError> {
    let revision: i64 = sqlx::query_scalar(
        "UPDATE collections SET revision = revision + 1 WHERE id = ? RETURNING revision",
    )
    .bind(collection_id.0)
    .fetch_one(&mut **tx)
    .await?;
    Ok(revision)
}

fn item_from_row(r: &SqliteRow) -> Result<OrderedItem> {
    Ok(OrderedItem {
        item_id: ItemId(r.try_get::<i64, _>(0)?),
        collection_id: CollectionId(r.try_get::<i64, _>(1)?),
        label: r.try_get::<String, _>(2)?,
        position: r.try_get::<i64, _>(3)?,
        created_at: r.try_get::<DateTime<Utc>, _>(4)?,
    })
}

fn parse_kind(raw: &str) -> Result<CollectionKind> {
    CollectionKind::parse(raw).ok_or_else(|| anyhow!("unknown collection kind '{raw}' in storage"))
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
