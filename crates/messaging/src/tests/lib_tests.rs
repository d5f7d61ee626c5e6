use super::*;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex as StdMutex,
    },
    time::Duration,
};

use shared::domain::ListingId;
use tokio::{sync::watch, time::timeout};

const CONVO: ConversationId = ConversationId(7);
const BUYER: UserId = UserId(1);
const SELLER: UserId = UserId(2);

struct InMemoryStore {
    rows: StdMutex<Vec<MessageRecord>>,
    next_id: StdMutex<i64>,
    fail_sends: AtomicBool,
    feed: broadcast::Sender<FeedEvent>,
}

impl InMemoryStore {
    fn new() -> Arc<Self> {
        Self::with_feed_capacity(64)
    }

    fn with_feed_capacity(capacity: usize) -> Arc<Self> {
        let (feed, _) = broadcast::channel(capacity);
        Arc::new(Self {
            rows: StdMutex::new(Vec::new()),
            next_id: StdMutex::new(1),
            fail_sends: AtomicBool::new(false),
            feed,
        })
    }

    fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    fn emit(&self, kind: FeedEventKind, message: MessageRecord) {
        let _ = self.feed.send(FeedEvent {
            kind,
            participants: [BUYER, SELLER],
            message,
        });
    }

    fn insert_row(
        &self,
        sender_id: UserId,
        body: &str,
        attachments: Vec<AttachmentPayload>,
    ) -> MessageRecord {
        let message_id = {
            let mut next = self.next_id.lock().expect("next_id");
            let id = MessageId(*next);
            *next += 1;
            id
        };
        let record = MessageRecord {
            message_id,
            conversation_id: CONVO,
            sender_id,
            body: body.to_string(),
            attachments,
            is_read: false,
            likes: Default::default(),
            created_at: Utc::now(),
        };
        self.rows.lock().expect("rows").push(record.clone());
        record
    }

    fn row(&self, index: usize) -> MessageRecord {
        self.rows.lock().expect("rows")[index].clone()
    }

    fn row_count(&self) -> usize {
        self.rows.lock().expect("rows").len()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn create_message(
        &self,
        _conversation_id: ConversationId,
        sender_id: UserId,
        body: &str,
        attachments: &[AttachmentPayload],
    ) -> Result<MessageRecord, StoreError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(StoreError::transient("simulated network failure"));
        }
        let record = self.insert_row(sender_id, body, attachments.to_vec());
        self.emit(FeedEventKind::Insert, record.clone());
        Ok(record)
    }

    async fn list_messages(
        &self,
        _conversation_id: ConversationId,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let mut rows = self.rows.lock().expect("rows").clone();
        rows.sort_by_key(MessageRecord::sort_key);
        Ok(rows)
    }

    async fn bulk_mark_read(
        &self,
        _conversation_id: ConversationId,
        reader_id: UserId,
    ) -> Result<u64, StoreError> {
        let changed: Vec<MessageRecord> = {
            let mut rows = self.rows.lock().expect("rows");
            rows.iter_mut()
                .filter(|row| row.sender_id != reader_id && !row.is_read)
                .map(|row| {
                    row.is_read = true;
                    row.clone()
                })
                .collect()
        };
        let count = changed.len() as u64;
        for record in changed {
            self.emit(FeedEventKind::Update, record);
        }
        Ok(count)
    }

    async fn unread_count(&self, user_id: UserId) -> Result<u64, StoreError> {
        let rows = self.rows.lock().expect("rows");
        Ok(rows
            .iter()
            .filter(|row| row.sender_id != user_id && !row.is_read)
            .count() as u64)
    }

    async fn append_like(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<bool, StoreError> {
        let updated = {
            let mut rows = self.rows.lock().expect("rows");
            let row = rows
                .iter_mut()
                .find(|row| row.message_id == message_id)
                .ok_or_else(|| StoreError::rejected("unknown message"))?;
            row.likes.insert(user_id).then(|| row.clone())
        };
        match updated {
            Some(record) => {
                self.emit(FeedEventKind::Update, record);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.feed.subscribe()
    }
}

#[derive(Default)]
struct RecordingDispatcher {
    notifications: StdMutex<Vec<(ConversationId, UserId, String)>>,
}

#[async_trait]
impl NotificationDispatcher for RecordingDispatcher {
    async fn notify_new_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        body_preview: &str,
    ) -> Result<(), NotificationError> {
        self.notifications.lock().expect("notifications").push((
            conversation_id,
            sender_id,
            body_preview.to_string(),
        ));
        Ok(())
    }
}

fn client_for(store: &Arc<InMemoryStore>, user_id: UserId) -> Arc<MessagingClient> {
    let store: Arc<dyn MessageStore> = store.clone();
    MessagingClient::new(store, Arc::new(MissingNotificationDispatcher), user_id)
}

async fn wait_for_entries<F>(
    client: &Arc<MessagingClient>,
    conversation_id: ConversationId,
    accept: F,
) -> Vec<CachedMessage>
where
    F: Fn(&[CachedMessage]) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let entries = client.messages(conversation_id).await;
        if accept(&entries) {
            return entries;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for cache state: {entries:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_unread(rx: &mut watch::Receiver<u64>, expected: u64) {
    timeout(Duration::from_secs(3), async {
        loop {
            if *rx.borrow_and_update() == expected {
                return;
            }
            rx.changed().await.expect("unread watch closed");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("unread count never reached {expected}"));
}

#[tokio::test]
async fn optimistic_send_is_visible_immediately_then_confirms() {
    let store = InMemoryStore::new();
    let client = client_for(&store, BUYER);

    client
        .send(CONVO, "Is this still available?", vec![])
        .await
        .expect("send");

    // Before the background persist resolves, the entry is pending.
    let entries = client.messages(CONVO).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status(), DeliveryStatus::Pending);
    assert_eq!(entries[0].body(), "Is this still available?");
    assert!(entries[0].store_id().is_none());

    let entries = wait_for_entries(&client, CONVO, |entries| {
        entries.iter().all(|e| e.status() == DeliveryStatus::Sent)
    })
    .await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].body(), "Is this still available?");
    assert!(entries[0].store_id().is_some());
    assert!(entries[0].temp_id().is_none());
}

#[tokio::test]
async fn send_rejects_empty_payload() {
    let store = InMemoryStore::new();
    let client = client_for(&store, BUYER);

    let err = client
        .send(CONVO, "   ", vec![])
        .await
        .expect_err("empty send");
    assert!(matches!(err, SendRequestError::EmptyMessage));
    assert!(client.messages(CONVO).await.is_empty());
}

#[tokio::test]
async fn failed_send_preserves_content_and_retry_succeeds_once() {
    let store = InMemoryStore::new();
    let client = client_for(&store, BUYER);
    let attachments = vec![AttachmentPayload {
        filename: "bike.jpg".to_string(),
        size_bytes: 2048,
        mime_type: Some("image/jpeg".to_string()),
    }];

    store.set_fail_sends(true);
    let temp_id = client
        .send(CONVO, "take my money", attachments.clone())
        .await
        .expect("send");

    let entries = wait_for_entries(&client, CONVO, |entries| {
        entries.iter().any(|e| e.status() == DeliveryStatus::Failed)
    })
    .await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].body(), "take my money");
    assert_eq!(entries[0].attachments(), attachments.as_slice());

    store.set_fail_sends(false);
    client.retry(CONVO, temp_id).await.expect("retry");

    let entries = wait_for_entries(&client, CONVO, |entries| {
        entries.iter().all(|e| e.status() == DeliveryStatus::Sent)
    })
    .await;
    assert_eq!(entries.len(), 1, "retry must not duplicate the message");
    assert_eq!(entries[0].body(), "take my money");
    assert_eq!(store.row_count(), 1);
}

#[tokio::test]
async fn retry_requires_a_failed_entry() {
    let store = InMemoryStore::new();
    let client = client_for(&store, BUYER);

    let unknown = client
        .retry(CONVO, TempId::generate())
        .await
        .expect_err("unknown temp id");
    assert!(matches!(unknown, SendRequestError::UnknownPending(_)));

    let temp_id = client.send(CONVO, "hello", vec![]).await.expect("send");
    wait_for_entries(&client, CONVO, |entries| {
        entries.iter().all(|e| e.status() == DeliveryStatus::Sent)
    })
    .await;

    let confirmed = client
        .retry(CONVO, temp_id)
        .await
        .expect_err("already confirmed");
    assert!(matches!(confirmed, SendRequestError::UnknownPending(_)));
}

#[tokio::test]
async fn own_sends_confirm_in_send_order() {
    let store = InMemoryStore::new();
    let client = client_for(&store, BUYER);

    for body in ["one", "two", "three"] {
        client.send(CONVO, body, vec![]).await.expect("send");
    }

    let entries = wait_for_entries(&client, CONVO, |entries| {
        entries.len() == 3 && entries.iter().all(|e| e.status() == DeliveryStatus::Sent)
    })
    .await;
    let bodies: Vec<&str> = entries.iter().map(CachedMessage::body).collect();
    assert_eq!(bodies, ["one", "two", "three"]);
    let ids: Vec<MessageId> = entries.iter().filter_map(CachedMessage::store_id).collect();
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
}

#[tokio::test]
async fn duplicate_insert_delivery_is_ignored() {
    let store = InMemoryStore::new();
    let client = client_for(&store, SELLER);
    client.open_conversation(CONVO).await.expect("open");

    let record = store.insert_row(BUYER, "ping", vec![]);
    store.emit(FeedEventKind::Insert, record.clone());
    store.emit(FeedEventKind::Insert, record);

    wait_for_entries(&client, CONVO, |entries| entries.len() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.messages(CONVO).await.len(), 1);
}

#[tokio::test]
async fn cross_session_echo_becomes_a_confirmed_entry() {
    let store = InMemoryStore::new();
    let client = client_for(&store, BUYER);
    client.open_conversation(CONVO).await.expect("open");

    // Same user, different session: no pending entry exists locally.
    let record = store.insert_row(BUYER, "sent from my phone", vec![]);
    store.emit(FeedEventKind::Insert, record);

    let entries = wait_for_entries(&client, CONVO, |entries| entries.len() == 1).await;
    assert_eq!(entries[0].status(), DeliveryStatus::Sent);
    assert_eq!(entries[0].sender_id(), BUYER);
    // Own messages are never marked read by the recipient-side tracker here.
    assert!(!store.row(0).is_read);
}

#[tokio::test]
async fn counterpart_arrival_while_open_is_marked_read() {
    let store = InMemoryStore::new();
    let client = client_for(&store, SELLER);
    client.open_conversation(CONVO).await.expect("open");

    let record = store.insert_row(BUYER, "are you there?", vec![]);
    store.emit(FeedEventKind::Insert, record);

    let entries = wait_for_entries(&client, CONVO, |entries| {
        entries.len() == 1
            && matches!(&entries[0], CachedMessage::Confirmed(record) if record.is_read)
    })
    .await;
    assert_eq!(entries[0].body(), "are you there?");
    assert!(store.row(0).is_read);
}

#[tokio::test]
async fn feed_gap_triggers_history_catch_up() {
    let store = InMemoryStore::with_feed_capacity(1);
    let client = client_for(&store, SELLER);
    client.open_conversation(CONVO).await.expect("open");

    // Burst past the feed buffer before the watcher task gets to run.
    for body in ["first", "second", "third"] {
        let record = store.insert_row(BUYER, body, vec![]);
        store.emit(FeedEventKind::Insert, record);
    }

    let entries = wait_for_entries(&client, CONVO, |entries| entries.len() == 3).await;
    let bodies: Vec<&str> = entries.iter().map(CachedMessage::body).collect();
    assert_eq!(bodies, ["first", "second", "third"]);
}

#[tokio::test]
async fn closed_conversation_stops_reconciling_but_sends_still_resolve() {
    let store = InMemoryStore::new();
    let client = client_for(&store, BUYER);
    client.open_conversation(CONVO).await.expect("open");
    client.close_conversation(CONVO).await;

    let record = store.insert_row(SELLER, "while closed", vec![]);
    store.emit(FeedEventKind::Insert, record);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.messages(CONVO).await.is_empty());

    client.send(CONVO, "after close", vec![]).await.expect("send");
    let entries = wait_for_entries(&client, CONVO, |entries| {
        entries.iter().any(|e| e.status() == DeliveryStatus::Sent)
    })
    .await;
    assert_eq!(entries.last().expect("entry").body(), "after close");
}

#[tokio::test]
async fn notification_carries_truncated_preview_and_fires_even_on_failure() {
    let store = InMemoryStore::new();
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let store_handle: Arc<dyn MessageStore> = store.clone();
    let notifier: Arc<dyn NotificationDispatcher> = dispatcher.clone();
    let client = MessagingClient::new(store_handle, notifier, BUYER);

    let long_body = "x".repeat(300);
    client.send(CONVO, long_body, vec![]).await.expect("send");
    wait_for_entries(&client, CONVO, |entries| {
        entries.iter().all(|e| e.status() == DeliveryStatus::Sent)
    })
    .await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let notifications = dispatcher.notifications.lock().expect("notifications").clone();
        if let Some((conversation_id, sender_id, preview)) = notifications.first() {
            assert_eq!(*conversation_id, CONVO);
            assert_eq!(*sender_id, BUYER);
            assert_eq!(preview.chars().count(), notify::PREVIEW_MAX_CHARS);
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("notification never dispatched");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // A failed persist still notifies; the dispatcher is fire-and-forget
    // either way.
    store.set_fail_sends(true);
    client.send(CONVO, "doomed", vec![]).await.expect("send");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if dispatcher.notifications.lock().expect("notifications").len() == 2 {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("second notification never dispatched");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn notification_dispatch_failure_never_touches_message_state() {
    let store = InMemoryStore::new();
    // MissingNotificationDispatcher fails every dispatch.
    let client = client_for(&store, BUYER);

    client.send(CONVO, "hello", vec![]).await.expect("send");
    let entries = wait_for_entries(&client, CONVO, |entries| {
        entries.iter().all(|e| e.status() == DeliveryStatus::Sent)
    })
    .await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status(), DeliveryStatus::Sent);
}

#[tokio::test]
async fn like_update_reaches_the_open_cache() {
    let store = InMemoryStore::new();
    let client = client_for(&store, SELLER);
    client.open_conversation(CONVO).await.expect("open");

    let record = store.insert_row(BUYER, "nice bike", vec![]);
    store.emit(FeedEventKind::Insert, record.clone());
    wait_for_entries(&client, CONVO, |entries| entries.len() == 1).await;

    assert!(client
        .like_message(record.message_id)
        .await
        .expect("like"));

    wait_for_entries(&client, CONVO, |entries| {
        matches!(&entries[0], CachedMessage::Confirmed(record) if record.likes.contains(&SELLER))
    })
    .await;
}

#[tokio::test]
async fn unread_lifecycle_across_two_clients() {
    let storage = Arc::new(
        storage::Storage::new("sqlite::memory:")
            .await
            .expect("db"),
    );
    let conversation = storage
        .ensure_conversation(BUYER, SELLER, Some(ListingId(5)))
        .await
        .expect("conversation");
    let conversation_id = conversation.conversation_id;

    let buyer_store: Arc<dyn MessageStore> = storage.clone();
    let seller_store: Arc<dyn MessageStore> = storage.clone();
    let buyer = MessagingClient::new(buyer_store, Arc::new(MissingNotificationDispatcher), BUYER);
    let seller = MessagingClient::new(seller_store, Arc::new(MissingNotificationDispatcher), SELLER);

    seller.start().await;
    let mut unread = seller.subscribe_unread();

    buyer
        .send(conversation_id, "Is this still available?", vec![])
        .await
        .expect("send");
    wait_for_unread(&mut unread, 1).await;
    assert_eq!(seller.unread_count(), 1);

    seller
        .open_conversation(conversation_id)
        .await
        .expect("open");
    wait_for_unread(&mut unread, 0).await;

    let history = storage
        .list_messages(conversation_id)
        .await
        .expect("history");
    assert_eq!(history.len(), 1);
    assert!(history[0].is_read);

    seller.shutdown().await;
    buyer.shutdown().await;
}
