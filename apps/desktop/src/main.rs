use std::{sync::Arc, time::Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    spawn_event_watcher, ClientEvent, DragAction, DragOutcome, HttpPositionStore, NoticeBoard,
    OptimisticOrderAdapter, ReorderController,
};
use shared::domain::{CollectionId, CollectionKind, ItemId, OrderedCollection};
use tokio::sync::broadcast::{error::TryRecvError, Receiver};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    List {
        #[arg(long, value_parser = parse_kind)]
        kind: Option<CollectionKind>,
        #[arg(long)]
        parent_ref: Option<String>,
    },
    Show {
        collection_id: i64,
    },
    /// Drags an item to a 0-based slot the way the list view would.
    Move {
        collection_id: i64,
        #[arg(long)]
        item: i64,
        #[arg(long)]
        to: usize,
    },
    /// Prints order changes and reload hints for a collection until interrupted.
    Watch {
        collection_id: i64,
    },
}

fn parse_kind(raw: &str) -> Result<CollectionKind, String> {
    CollectionKind::parse(raw).ok_or_else(|| format!("unknown collection kind: {raw}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();

    let http = HttpPositionStore::new(&args.server_url)?;
    match args.command {
        Command::List { kind, parent_ref } => {
            for summary in http.list_collections(kind, parent_ref.as_deref()).await? {
                println!(
                    "{}\t{}\t{}\titems={}",
                    summary.collection_id,
                    summary.scope.kind.as_str(),
                    summary.scope.parent_ref,
                    summary.item_count
                );
            }
        }
        Command::Show { collection_id } => {
            let adapter = OptimisticOrderAdapter::new(Arc::new(http));
            let collection = adapter.load(CollectionId(collection_id)).await?;
            print_collection(&collection, &collection.item_ids());
        }
        Command::Move {
            collection_id,
            item,
            to,
        } => {
            drag_item(http, CollectionId(collection_id), ItemId(item), to).await?;
        }
        Command::Watch { collection_id } => {
            watch(http, CollectionId(collection_id)).await?;
        }
    }
    Ok(())
}

async fn drag_item(http: HttpPositionStore, collection_id: CollectionId, item: ItemId, to: usize) -> Result<()> {
    let adapter = OptimisticOrderAdapter::new(Arc::new(http));
    let collection = adapter.load(collection_id).await?;
    let mut events = adapter.subscribe();
    let mut notices = NoticeBoard::new();

    let mut controller = ReorderController::new();
    let current = adapter.order(collection_id).await.unwrap_or_default();
    controller.apply(DragAction::BeginDrag(item), &current)?;
    controller.apply(DragAction::Hover(to), &current)?;

    // the order may have moved on while the item was held
    let current = adapter.order(collection_id).await.unwrap_or_default();
    let new_order = match controller.apply(DragAction::Drop(to), &current) {
        Ok(DragOutcome::Reordered(order)) => order,
        Ok(_) => {
            println!("item {item} is already at slot {to}");
            return Ok(());
        }
        Err(err) => {
            info!(error = %err, "drop ignored");
            println!("nothing to do: {err}");
            return Ok(());
        }
    };

    let result = adapter.apply_and_persist(collection_id, new_order).await;
    drain_notices(&mut events, &mut notices);
    for notice in notices.active() {
        println!("[{:?}] {}", notice.level, notice.message);
    }

    match result {
        Ok(_) => {
            let shown = adapter.order(collection_id).await.unwrap_or_default();
            print_collection(&collection, &shown);
            Ok(())
        }
        Err(failure) => {
            print_collection(&collection, &failure.previous_order);
            Err(failure).context(format!("could not move item {item}"))
        }
    }
}

async fn watch(http: HttpPositionStore, collection_id: CollectionId) -> Result<()> {
    let server_url = http.server_url().to_string();
    let adapter = OptimisticOrderAdapter::new(Arc::new(http));
    let collection = adapter.load(collection_id).await?;
    print_collection(&collection, &collection.item_ids());

    let mut events = adapter.subscribe();
    let watcher = spawn_event_watcher(adapter.clone(), &server_url, Some(collection_id)).await?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ClientEvent::ReloadSuggested { revision, .. }) => {
                    println!("collection changed (revision {revision}); reloading");
                    let reloaded = adapter.reload(collection_id).await?;
                    print_collection(&reloaded, &reloaded.item_ids());
                }
                Ok(ClientEvent::Error(message)) => eprintln!("error: {message}"),
                Ok(_) => {}
                Err(_) => break,
            },
        }
    }
    watcher.abort();
    Ok(())
}

fn drain_notices(events: &mut Receiver<ClientEvent>, notices: &mut NoticeBoard) {
    loop {
        match events.try_recv() {
            Ok(ClientEvent::Notice(notice)) => {
                notices.push(notice);
            }
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    notices.prune(Instant::now());
}

fn print_collection(collection: &OrderedCollection, order: &[ItemId]) {
    println!(
        "{} / {}",
        collection.scope.kind.as_str(),
        collection.scope.parent_ref
    );
    for (index, item_id) in order.iter().enumerate() {
        let label = collection
            .items
            .iter()
            .find(|item| item.item_id == *item_id)
            .map(|item| item.label.as_str())
            .unwrap_or("?");
        println!("{index}\t{item_id}\t{label}");
    }
}
