use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{OptimisticOrderAdapter, ReorderController, ReorderOutcome};
use shared::domain::{CollectionId, CollectionKind, CollectionScope, ItemId, OrderedCollection};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/collections.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Appends an item at the tail of a collection, creating it if needed.
    CreateItem {
        #[arg(value_parser = parse_kind)]
        kind: CollectionKind,
        parent_ref: String,
        label: String,
    },
    RemoveItem {
        collection_id: i64,
        item_id: i64,
    },
    List {
        #[arg(long, value_parser = parse_kind)]
        kind: Option<CollectionKind>,
        #[arg(long)]
        parent_ref: Option<String>,
    },
    Show {
        collection_id: i64,
    },
    /// Moves an item to a 0-based slot and persists the new order.
    Move {
        collection_id: i64,
        item_id: i64,
        to: usize,
    },
}

fn parse_kind(raw: &str) -> Result<CollectionKind, String> {
    CollectionKind::parse(raw).ok_or_else(|| format!("unknown collection kind: {raw}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateItem {
            kind,
            parent_ref,
            label,
        } => {
            let appended = storage
                .append_item(&CollectionScope::new(kind, parent_ref), &label)
                .await?;
            println!(
                "created item_id={} collection_id={} position={}",
                appended.item.item_id, appended.item.collection_id, appended.item.position
            );
        }
        Command::RemoveItem {
            collection_id,
            item_id,
        } => {
            let revision = storage
                .remove_item(CollectionId(collection_id), ItemId(item_id))
                .await?;
            println!("removed item_id={item_id} revision={revision}");
        }
        Command::List { kind, parent_ref } => {
            for summary in storage.list_collections(kind, parent_ref.as_deref()).await? {
                println!(
                    "{}\t{}\t{}\titems={}\trevision={}",
                    summary.collection_id,
                    summary.scope.kind.as_str(),
                    summary.scope.parent_ref,
                    summary.item_count,
                    summary.revision
                );
            }
        }
        Command::Show { collection_id } => {
            let collection = storage.load_collection(CollectionId(collection_id)).await?;
            print_collection(&collection);
        }
        Command::Move {
            collection_id,
            item_id,
            to,
        } => {
            move_item(storage, CollectionId(collection_id), ItemId(item_id), to).await?;
        }
    }

    Ok(())
}

async fn move_item(storage: Storage, collection_id: CollectionId, item_id: ItemId, to: usize) -> Result<()> {
    let adapter = OptimisticOrderAdapter::new(Arc::new(storage.clone()));
    let collection = adapter.load(collection_id).await?;
    let order = collection.item_ids();

    let mut controller = ReorderController::new();
    controller.begin_drag(item_id, &order)?;
    let Some(new_order) = controller.drop(to, &order)? else {
        println!("item {item_id} is already at slot {to}");
        return Ok(());
    };

    match adapter.apply_and_persist(collection_id, new_order).await {
        Ok(ReorderOutcome::Applied { revision, .. }) => println!("moved item {item_id}; revision={revision}"),
        Ok(ReorderOutcome::Unchanged) => println!("order unchanged"),
        Err(failure) => return Err(failure).context("move failed"),
    }

    print_collection(&storage.load_collection(collection_id).await?);
    Ok(())
}

fn print_collection(collection: &OrderedCollection) {
    println!(
        "collection {} ({} / {}) revision={}",
        collection.collection_id,
        collection.scope.kind.as_str(),
        collection.scope.parent_ref,
        collection.revision
    );
    for item in &collection.items {
        println!("{}\t{}\t{}", item.position, item.item_id, item.label);
    }
}
