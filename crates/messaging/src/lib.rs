use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::warn;

use shared::{
    domain::{ConversationId, MessageId, TempId, UserId},
    error::StoreError,
    protocol::{AttachmentPayload, FeedEvent, FeedEventKind, FeedFilter, MessageRecord},
};

pub mod cache;
pub mod error;
pub mod notify;
pub mod unread;

pub use cache::{CachedMessage, ConversationCache, DeliveryStatus, PendingSend};
pub use error::SendRequestError;
pub use notify::{
    MissingNotificationDispatcher, NotificationDispatcher, NotificationError,
    WebhookNotificationDispatcher,
};
pub use unread::UnreadAggregator;

/// The store seam the client core talks through. The production
/// implementation is `storage::Storage`; tests drive the client with
/// hand-rolled fakes.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        body: &str,
        attachments: &[AttachmentPayload],
    ) -> Result<MessageRecord, StoreError>;

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<MessageRecord>, StoreError>;

    async fn bulk_mark_read(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
    ) -> Result<u64, StoreError>;

    async fn unread_count(&self, user_id: UserId) -> Result<u64, StoreError>;

    async fn append_like(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<bool, StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<FeedEvent>;
}

#[async_trait]
impl MessageStore for storage::Storage {
    async fn create_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        body: &str,
        attachments: &[AttachmentPayload],
    ) -> Result<MessageRecord, StoreError> {
        storage::Storage::create_message(self, conversation_id, sender_id, body, attachments).await
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        storage::Storage::list_messages(self, conversation_id).await
    }

    async fn bulk_mark_read(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
    ) -> Result<u64, StoreError> {
        storage::Storage::bulk_mark_read(self, conversation_id, reader_id).await
    }

    async fn unread_count(&self, user_id: UserId) -> Result<u64, StoreError> {
        storage::Storage::unread_count(self, user_id).await
    }

    async fn append_like(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<bool, StoreError> {
        storage::Storage::append_like(self, message_id, user_id).await
    }

    fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        storage::Storage::subscribe(self)
    }
}

struct ClientState {
    caches: HashMap<ConversationId, ConversationCache>,
    watchers: HashMap<ConversationId, JoinHandle<()>>,
    user_feed: Option<JoinHandle<()>>,
    unread_worker: Option<JoinHandle<()>>,
}

/// One authenticated user's messaging session: per-conversation caches, the
/// optimistic send pipeline, change-feed reconciliation and the unread
/// aggregate. Identity is fixed at construction so several simulated users
/// can coexist in one process.
pub struct MessagingClient {
    store: Arc<dyn MessageStore>,
    notifier: Arc<dyn NotificationDispatcher>,
    user_id: UserId,
    inner: Mutex<ClientState>,
    unread: UnreadAggregator,
}

impl MessagingClient {
    pub fn new(
        store: Arc<dyn MessageStore>,
        notifier: Arc<dyn NotificationDispatcher>,
        user_id: UserId,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            notifier,
            user_id,
            inner: Mutex::new(ClientState {
                caches: HashMap::new(),
                watchers: HashMap::new(),
                user_feed: None,
                unread_worker: None,
            }),
            unread: UnreadAggregator::new(),
        })
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Attach the session: starts the unread worker and the cross-conversation
    /// feed task, then requests the initial unread recount. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().await;
            if inner.user_feed.is_none() {
                inner.unread_worker = self
                    .unread
                    .spawn_worker(Arc::clone(&self.store), self.user_id)
                    .await;
                inner.user_feed = Some(self.spawn_user_feed_task());
            }
        }
        self.unread.trigger();
    }

    /// Queue a message for the conversation. Returns immediately after the
    /// optimistic cache insert; persistence, confirmation and the recipient
    /// notification run in the background. Store failures never surface here
    /// — they land on the entry as `failed` state with the content preserved
    /// for a manual `retry`.
    pub async fn send(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        body: impl Into<String>,
        attachments: Vec<AttachmentPayload>,
    ) -> Result<TempId, SendRequestError> {
        let body = body.into();
        if body.trim().is_empty() && attachments.is_empty() {
            return Err(SendRequestError::EmptyMessage);
        }

        let temp_id = TempId::generate();
        let pending = PendingSend {
            temp_id,
            conversation_id,
            sender_id: self.user_id,
            body,
            attachments,
            queued_at: Utc::now(),
            failed: false,
            last_error: None,
        };

        {
            let mut inner = self.inner.lock().await;
            inner
                .caches
                .entry(conversation_id)
                .or_default()
                .append_pending(pending);
        }

        let client = Arc::clone(self);
        tokio::spawn(async move { client.run_send_attempt(conversation_id, temp_id).await });
        Ok(temp_id)
    }

    /// Manually retry a failed send with its original content. No automatic
    /// backoff exists anywhere; a hidden retry could double-send.
    pub async fn retry(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        temp_id: TempId,
    ) -> Result<(), SendRequestError> {
        {
            let mut inner = self.inner.lock().await;
            let eligible = inner
                .caches
                .get_mut(&conversation_id)
                .map(|cache| cache.reset_failed(temp_id))
                .unwrap_or(false);
            if !eligible {
                return Err(SendRequestError::UnknownPending(temp_id));
            }
        }

        let client = Arc::clone(self);
        tokio::spawn(async move { client.run_send_attempt(conversation_id, temp_id).await });
        Ok(())
    }

    /// Current view of a conversation: confirmed history merged with
    /// optimistic entries, in display order.
    pub async fn messages(&self, conversation_id: ConversationId) -> Vec<CachedMessage> {
        let inner = self.inner.lock().await;
        inner
            .caches
            .get(&conversation_id)
            .map(|cache| cache.entries().to_vec())
            .unwrap_or_default()
    }

    /// Open a conversation view: subscribe to its slice of the change feed,
    /// fetch full history (the catch-up mandated after every subscription
    /// handshake), then mark everything addressed to us as read.
    pub async fn open_conversation(
        self: &Arc<Self>,
        conversation_id: ConversationId,
    ) -> Result<(), StoreError> {
        // Subscribe before the fetch so no commit falls between the two.
        let feed = self.store.subscribe();
        self.catch_up(conversation_id).await?;

        {
            let mut inner = self.inner.lock().await;
            if let Some(previous) = inner.watchers.remove(&conversation_id) {
                previous.abort();
            }
            let task = self.spawn_conversation_task(conversation_id, feed);
            inner.watchers.insert(conversation_id, task);
        }

        self.mark_read(conversation_id).await?;
        Ok(())
    }

    /// Tear down the conversation subscription. The cache stays; in-flight
    /// sends keep their own handles and still resolve to sent or failed.
    pub async fn close_conversation(&self, conversation_id: ConversationId) {
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.watchers.remove(&conversation_id) {
            task.abort();
        }
    }

    /// Detach the session entirely: abort every conversation watcher, the
    /// user feed task and the unread worker.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        for (_, task) in inner.watchers.drain() {
            task.abort();
        }
        if let Some(task) = inner.user_feed.take() {
            task.abort();
        }
        if let Some(task) = inner.unread_worker.take() {
            task.abort();
        }
    }

    /// Mark every unread message in the conversation not sent by this user as
    /// read. One conditional bulk update in the store; repeat calls converge
    /// and report 0.
    pub async fn mark_read(&self, conversation_id: ConversationId) -> Result<u64, StoreError> {
        let changed = self
            .store
            .bulk_mark_read(conversation_id, self.user_id)
            .await?;
        self.unread.trigger();
        Ok(changed)
    }

    /// Add this user to a message's like-set. The cache picks the change up
    /// through the feed like any other update.
    pub async fn like_message(&self, message_id: MessageId) -> Result<bool, StoreError> {
        self.store.append_like(message_id, self.user_id).await
    }

    /// Latest computed unread total for this user.
    pub fn unread_count(&self) -> u64 {
        self.unread.current()
    }

    /// Watch handle notified whenever the unread total changes.
    pub fn subscribe_unread(&self) -> tokio::sync::watch::Receiver<u64> {
        self.unread.watch()
    }

    async fn run_send_attempt(&self, conversation_id: ConversationId, temp_id: TempId) {
        let (body, attachments) = {
            let inner = self.inner.lock().await;
            let Some(pending) = inner
                .caches
                .get(&conversation_id)
                .and_then(|cache| cache.pending(temp_id))
            else {
                return;
            };
            (pending.body.clone(), pending.attachments.clone())
        };

        match self
            .store
            .create_message(conversation_id, self.user_id, &body, &attachments)
            .await
        {
            Ok(record) => {
                let mut inner = self.inner.lock().await;
                if let Some(cache) = inner.caches.get_mut(&conversation_id) {
                    cache.confirm(temp_id, record);
                }
            }
            Err(err) => {
                warn!(
                    conversation_id = conversation_id.0,
                    temp_id = %temp_id,
                    %err,
                    "send failed; entry kept for manual retry"
                );
                let mut inner = self.inner.lock().await;
                if let Some(cache) = inner.caches.get_mut(&conversation_id) {
                    cache.mark_failed(temp_id, err.to_string());
                }
            }
        }

        self.dispatch_notification(conversation_id, &body);
    }

    fn dispatch_notification(&self, conversation_id: ConversationId, body: &str) {
        let preview = notify::body_preview(body).to_string();
        let notifier = Arc::clone(&self.notifier);
        let sender_id = self.user_id;
        tokio::spawn(async move {
            if let Err(err) = notifier
                .notify_new_message(conversation_id, sender_id, &preview)
                .await
            {
                warn!(
                    conversation_id = conversation_id.0,
                    %err,
                    "new-message notification dropped"
                );
            }
        });
    }

    /// Fetch full history and fold it into the cache. Used on open and after
    /// a feed gap; idempotent because absorption matches by store id.
    async fn catch_up(&self, conversation_id: ConversationId) -> Result<(), StoreError> {
        let history = self.store.list_messages(conversation_id).await?;
        let mut inner = self.inner.lock().await;
        let cache = inner.caches.entry(conversation_id).or_default();
        for record in history {
            cache.absorb_confirmed(self.user_id, record);
        }
        Ok(())
    }

    /// Apply one feed event to the conversation cache. Runs on the
    /// conversation's watcher task, one event at a time.
    async fn reconcile(&self, conversation_id: ConversationId, event: FeedEvent) {
        match event.kind {
            FeedEventKind::Insert => {
                let sender_id = event.message.sender_id;
                let inserted = {
                    let mut inner = self.inner.lock().await;
                    inner
                        .caches
                        .entry(conversation_id)
                        .or_default()
                        .absorb_confirmed(self.user_id, event.message)
                };
                // The view is open (this task only runs while it is), so a
                // counterpart message is read the moment it lands.
                if inserted && sender_id != self.user_id {
                    if let Err(err) = self.mark_read(conversation_id).await {
                        warn!(
                            conversation_id = conversation_id.0,
                            %err,
                            "mark-read on arrival failed"
                        );
                    }
                }
            }
            FeedEventKind::Update => {
                let mut inner = self.inner.lock().await;
                if let Some(cache) = inner.caches.get_mut(&conversation_id) {
                    cache.patch(&event.message);
                }
            }
        }
    }

    fn spawn_conversation_task(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        mut feed: broadcast::Receiver<FeedEvent>,
    ) -> JoinHandle<()> {
        let client = Arc::clone(self);
        let filter = FeedFilter::conversation(conversation_id);
        tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(event) => {
                        if filter.matches(&event) {
                            client.reconcile(conversation_id, event).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            conversation_id = conversation_id.0,
                            skipped, "conversation feed lagged; refetching history"
                        );
                        if let Err(err) = client.catch_up(conversation_id).await {
                            warn!(
                                conversation_id = conversation_id.0,
                                %err,
                                "catch-up after feed gap failed"
                            );
                            continue;
                        }
                        if let Err(err) = client.mark_read(conversation_id).await {
                            warn!(
                                conversation_id = conversation_id.0,
                                %err,
                                "mark-read after feed gap failed"
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_user_feed_task(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        let mut feed = self.store.subscribe();
        let filter = FeedFilter::participant(self.user_id);
        tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(event) => {
                        // Any event touching one of our conversations can move
                        // the total, including the echo of our own mark-read.
                        if filter.matches(&event) {
                            client.unread.trigger();
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "user change feed lagged; forcing unread recount");
                        client.unread.trigger();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
