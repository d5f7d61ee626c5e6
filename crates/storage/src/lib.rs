use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use tokio::sync::broadcast;

use shared::{
    domain::{ConversationId, ListingId, MessageId, UserId},
    error::StoreError,
    protocol::{AttachmentPayload, ConversationSummary, FeedEvent, FeedEventKind, MessageRecord},
};

const FEED_CAPACITY: usize = 256;

/// Append-only message ledger over SQLite, doubling as the change feed hub:
/// every committed insert/update is broadcast to subscribers as a `FeedEvent`.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    feed: broadcast::Sender<FeedEvent>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Ok(Self { pool, feed })
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

    /// Subscribe to the change feed. Delivery is at-least-once from the
    /// subscriber's point of view: a lagging receiver drops the oldest events
    /// and must catch up with `list_messages`.
    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.feed.subscribe()
    }

    /// Find-or-create the conversation between two participants, optionally
    /// scoped to a listing. Lookup matches either participant orientation;
    /// repeated calls return the same row.
    pub async fn ensure_conversation(
        &self,
        buyer_id: UserId,
        seller_id: UserId,
        listing_id: Option<ListingId>,
    ) -> Result<ConversationSummary, StoreError> {
        if buyer_id == seller_id {
            return Err(StoreError::rejected(
                "conversation requires two distinct participants",
            ));
        }

        if let Some(existing) = self
            .find_conversation(buyer_id, seller_id, listing_id)
            .await?
        {
            return Ok(existing);
        }

        sqlx::query(
            "INSERT INTO conversations (buyer_id, seller_id, listing_id) VALUES (?, ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(buyer_id.0)
        .bind(seller_id.0)
        .bind(listing_id.map(|id| id.0))
        .execute(&self.pool)
        .await
        .map_err(transient)?;

        self.find_conversation(buyer_id, seller_id, listing_id)
            .await?
            .ok_or_else(|| StoreError::transient("conversation vanished after insert"))
    }

    pub async fn conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<ConversationSummary, StoreError> {
        let row = sqlx::query(
            "SELECT id, buyer_id, seller_id, listing_id FROM conversations WHERE id = ?",
        )
        .bind(conversation_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;

        row.map(conversation_from_row).ok_or_else(|| {
            StoreError::rejected(format!("unknown conversation {}", conversation_id.0))
        })
    }

    /// Append a message to the conversation ledger. The store assigns the id
    /// and canonical timestamp; the committed row is broadcast as an INSERT
    /// feed event before this returns.
    pub async fn create_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        body: &str,
        attachments: &[AttachmentPayload],
    ) -> Result<MessageRecord, StoreError> {
        if body.trim().is_empty() && attachments.is_empty() {
            return Err(StoreError::rejected(
                "message needs a body or at least one attachment",
            ));
        }
        let conversation = self.conversation(conversation_id).await?;
        if !conversation.involves(sender_id) {
            return Err(StoreError::rejected(format!(
                "user {} is not a participant of conversation {}",
                sender_id.0, conversation_id.0
            )));
        }

        let attachments_json = serde_json::to_string(attachments)
            .map_err(|e| StoreError::rejected(format!("unencodable attachments: {e}")))?;

        let row = sqlx::query(
            "INSERT INTO messages (conversation_id, sender_id, body, attachments)
             VALUES (?, ?, ?, ?)
             RETURNING id, created_at",
        )
        .bind(conversation_id.0)
        .bind(sender_id.0)
        .bind(body)
        .bind(attachments_json)
        .fetch_one(&self.pool)
        .await
        .map_err(transient)?;

        let record = MessageRecord {
            message_id: MessageId(row.get::<i64, _>(0)),
            conversation_id,
            sender_id,
            body: body.to_string(),
            attachments: attachments.to_vec(),
            is_read: false,
            likes: BTreeSet::new(),
            created_at: row.get::<DateTime<Utc>, _>(1),
        };

        self.emit(FeedEventKind::Insert, &conversation, record.clone());
        Ok(record)
    }

    /// Full conversation history in display order: `created_at` ascending,
    /// ties broken by store id.
    pub async fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, sender_id, body, attachments, is_read, likes, created_at
             FROM messages
             WHERE conversation_id = ?
             ORDER BY created_at ASC, id ASC",
        )
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(transient)?;

        rows.into_iter().map(message_from_row).collect()
    }

    /// Mark every unread message in the conversation not sent by `reader_id`
    /// as read, in one conditional bulk update. Returns the number of rows
    /// that actually flipped; a repeat call reports 0. Each flipped row is
    /// broadcast as an UPDATE feed event.
    pub async fn bulk_mark_read(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
    ) -> Result<u64, StoreError> {
        let conversation = self.conversation(conversation_id).await?;
        if !conversation.involves(reader_id) {
            return Err(StoreError::rejected(format!(
                "user {} is not a participant of conversation {}",
                reader_id.0, conversation_id.0
            )));
        }

        let mut rows = sqlx::query(
            "UPDATE messages
             SET is_read = 1
             WHERE conversation_id = ? AND sender_id != ? AND is_read = 0
             RETURNING id, conversation_id, sender_id, body, attachments, is_read, likes, created_at",
        )
        .bind(conversation_id.0)
        .bind(reader_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(transient)?;

        rows.sort_by_key(|row| row.get::<i64, _>(0));
        let changed = rows.len() as u64;
        for row in rows {
            let record = message_from_row(row)?;
            self.emit(FeedEventKind::Update, &conversation, record);
        }
        Ok(changed)
    }

    /// Count of unread messages addressed to `user_id` across all of their
    /// conversations. Derived on demand, never stored.
    pub async fn unread_count(&self, user_id: UserId) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*)
             FROM messages m
             INNER JOIN conversations c ON c.id = m.conversation_id
             WHERE (c.buyer_id = ?1 OR c.seller_id = ?1)
               AND m.sender_id != ?1
               AND m.is_read = 0",
        )
        .bind(user_id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(transient)?;
        Ok(count as u64)
    }

    /// Add `user_id` to a message's like-set. Grow-only and commutative;
    /// returns whether the set actually changed. A change is broadcast as an
    /// UPDATE feed event.
    pub async fn append_like(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT id, conversation_id, sender_id, body, attachments, is_read, likes, created_at
             FROM messages WHERE id = ?",
        )
        .bind(message_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?
        .ok_or_else(|| StoreError::rejected(format!("unknown message {}", message_id.0)))?;

        let mut record = message_from_row(row)?;
        let conversation = self.conversation(record.conversation_id).await?;
        if !conversation.involves(user_id) {
            return Err(StoreError::rejected(format!(
                "user {} is not a participant of conversation {}",
                user_id.0, record.conversation_id.0
            )));
        }

        if !record.likes.insert(user_id) {
            return Ok(false);
        }

        let likes_json = serde_json::to_string(&record.likes)
            .map_err(|e| StoreError::transient(format!("unencodable like-set: {e}")))?;
        sqlx::query("UPDATE messages SET likes = ? WHERE id = ?")
            .bind(likes_json)
            .bind(message_id.0)
            .execute(&self.pool)
            .await
            .map_err(transient)?;

        self.emit(FeedEventKind::Update, &conversation, record);
        Ok(true)
    }

    fn emit(
        &self,
        kind: FeedEventKind,
        conversation: &ConversationSummary,
        message: MessageRecord,
    ) {
        let _ = self.feed.send(FeedEvent {
            kind,
            participants: conversation.participants(),
            message,
        });
    }

    async fn find_conversation(
        &self,
        buyer_id: UserId,
        seller_id: UserId,
        listing_id: Option<ListingId>,
    ) -> Result<Option<ConversationSummary>, StoreError> {
        let row = sqlx::query(
            "SELECT id, buyer_id, seller_id, listing_id
             FROM conversations
             WHERE ((buyer_id = ?1 AND seller_id = ?2) OR (buyer_id = ?2 AND seller_id = ?1))
               AND listing_id IS ?3
             LIMIT 1",
        )
        .bind(buyer_id.0)
        .bind(seller_id.0)
        .bind(listing_id.map(|id| id.0))
        .fetch_optional(&self.pool)
        .await
        .map_err(transient)?;

        Ok(row.map(conversation_from_row))
    }
}

fn conversation_from_row(row: SqliteRow) -> ConversationSummary {
    ConversationSummary {
        conversation_id: ConversationId(row.get::<i64, _>(0)),
        buyer_id: UserId(row.get::<i64, _>(1)),
        seller_id: UserId(row.get::<i64, _>(2)),
        listing_id: row.get::<Option<i64>, _>(3).map(ListingId),
    }
}

fn message_from_row(row: SqliteRow) -> Result<MessageRecord, StoreError> {
    let attachments: Vec<AttachmentPayload> =
        serde_json::from_str(&row.get::<String, _>(4))
            .map_err(|e| StoreError::transient(format!("corrupt attachments column: {e}")))?;
    let likes: BTreeSet<UserId> = serde_json::from_str(&row.get::<String, _>(6))
        .map_err(|e| StoreError::transient(format!("corrupt likes column: {e}")))?;

    Ok(MessageRecord {
        message_id: MessageId(row.get::<i64, _>(0)),
        conversation_id: ConversationId(row.get::<i64, _>(1)),
        sender_id: UserId(row.get::<i64, _>(2)),
        body: row.get::<String, _>(3),
        attachments,
        is_read: row.get::<bool, _>(5),
        likes,
        created_at: row.get::<DateTime<Utc>, _>(7),
    })
}

fn transient(err: sqlx::Error) -> StoreError {
    StoreError::transient(err.to_string())
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
