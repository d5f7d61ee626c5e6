use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use messaging::{MessageStore, MessagingClient, MissingNotificationDispatcher};
use shared::domain::{ConversationId, ListingId, UserId};
use storage::Storage;
use tokio_stream::{wrappers::errors::BroadcastStreamRecvError, wrappers::BroadcastStream, StreamExt};
use tracing::warn;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://marketplace.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Find-or-create the conversation between two users.
    OpenConversation {
        buyer_id: i64,
        seller_id: i64,
        #[arg(long)]
        listing_id: Option<i64>,
    },
    /// Append a message to a conversation.
    Send {
        conversation_id: i64,
        sender_id: i64,
        body: String,
    },
    /// Print a conversation's history in display order.
    History { conversation_id: i64 },
    /// Mark every counterpart message in a conversation as read.
    MarkRead {
        conversation_id: i64,
        reader_id: i64,
    },
    /// Print a user's unread total.
    Unread { user_id: i64 },
    /// Run the full optimistic-send / unread round trip with two in-process
    /// clients, printing feed events as they commit.
    Demo {
        buyer_id: i64,
        seller_id: i64,
        #[arg(long)]
        listing_id: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;
    storage.health_check().await?;

    match cli.command {
        Command::OpenConversation {
            buyer_id,
            seller_id,
            listing_id,
        } => {
            let conversation = storage
                .ensure_conversation(
                    UserId(buyer_id),
                    UserId(seller_id),
                    listing_id.map(ListingId),
                )
                .await?;
            println!("conversation_id={}", conversation.conversation_id.0);
        }
        Command::Send {
            conversation_id,
            sender_id,
            body,
        } => {
            let record = storage
                .create_message(ConversationId(conversation_id), UserId(sender_id), &body, &[])
                .await?;
            println!("message_id={}", record.message_id.0);
        }
        Command::History { conversation_id } => {
            for record in storage
                .list_messages(ConversationId(conversation_id))
                .await?
            {
                println!(
                    "{} #{} from {}: {} (read: {})",
                    record.created_at,
                    record.message_id.0,
                    record.sender_id.0,
                    record.body,
                    record.is_read
                );
            }
        }
        Command::MarkRead {
            conversation_id,
            reader_id,
        } => {
            let changed = storage
                .bulk_mark_read(ConversationId(conversation_id), UserId(reader_id))
                .await?;
            println!("marked {changed} messages read");
        }
        Command::Unread { user_id } => {
            let count = storage.unread_count(UserId(user_id)).await?;
            println!("unread={count}");
        }
        Command::Demo {
            buyer_id,
            seller_id,
            listing_id,
        } => {
            run_demo(
                storage,
                UserId(buyer_id),
                UserId(seller_id),
                listing_id.map(ListingId),
            )
            .await?;
        }
    }

    Ok(())
}

async fn run_demo(
    storage: Storage,
    buyer_id: UserId,
    seller_id: UserId,
    listing_id: Option<ListingId>,
) -> Result<()> {
    let conversation = storage
        .ensure_conversation(buyer_id, seller_id, listing_id)
        .await?;
    let conversation_id = conversation.conversation_id;
    println!("conversation_id={}", conversation_id.0);

    let mut feed = BroadcastStream::new(storage.subscribe());
    let printer = tokio::spawn(async move {
        while let Some(event) = feed.next().await {
            match event {
                Ok(event) => println!(
                    "feed: {:?} message_id={} is_read={}",
                    event.kind, event.message.message_id.0, event.message.is_read
                ),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "feed lagged")
                }
            }
        }
    });

    let store: Arc<dyn MessageStore> = Arc::new(storage.clone());
    let buyer = MessagingClient::new(
        Arc::clone(&store),
        Arc::new(MissingNotificationDispatcher),
        buyer_id,
    );
    let seller = MessagingClient::new(store, Arc::new(MissingNotificationDispatcher), seller_id);
    seller.start().await;
    let mut unread = seller.subscribe_unread();

    buyer
        .send(conversation_id, "Is this still available?", vec![])
        .await?;
    unread.changed().await?;
    println!("seller unread after send: {}", *unread.borrow_and_update());

    seller.open_conversation(conversation_id).await?;
    unread.changed().await?;
    println!("seller unread after open: {}", *unread.borrow_and_update());

    for entry in seller.messages(conversation_id).await {
        println!(
            "[{:?}] {}: {}",
            entry.status(),
            entry.sender_id().0,
            entry.body()
        );
    }

    seller.shutdown().await;
    buyer.shutdown().await;
    printer.abort();
    Ok(())
}
