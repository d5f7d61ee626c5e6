use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, TempId, UserId},
    protocol::{AttachmentPayload, MessageRecord},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

/// An optimistic entry: the local send that has not been confirmed (or was
/// refused) by the store. Content is kept verbatim so a manual retry can
/// resend exactly what the user wrote.
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub temp_id: TempId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    pub attachments: Vec<AttachmentPayload>,
    pub queued_at: DateTime<Utc>,
    pub failed: bool,
    pub last_error: Option<String>,
}

/// One entry of the per-conversation view. The two variants make the
/// replace-not-merge reconciliation explicit: a pending entry is swapped out
/// wholesale once the store confirms, never mutated field by field.
#[derive(Debug, Clone)]
pub enum CachedMessage {
    Pending(PendingSend),
    Confirmed(MessageRecord),
}

impl CachedMessage {
    pub fn status(&self) -> DeliveryStatus {
        match self {
            Self::Pending(pending) if pending.failed => DeliveryStatus::Failed,
            Self::Pending(_) => DeliveryStatus::Pending,
            Self::Confirmed(_) => DeliveryStatus::Sent,
        }
    }

    pub fn body(&self) -> &str {
        match self {
            Self::Pending(pending) => &pending.body,
            Self::Confirmed(record) => &record.body,
        }
    }

    pub fn attachments(&self) -> &[AttachmentPayload] {
        match self {
            Self::Pending(pending) => &pending.attachments,
            Self::Confirmed(record) => &record.attachments,
        }
    }

    pub fn sender_id(&self) -> UserId {
        match self {
            Self::Pending(pending) => pending.sender_id,
            Self::Confirmed(record) => record.sender_id,
        }
    }

    pub fn store_id(&self) -> Option<MessageId> {
        match self {
            Self::Pending(_) => None,
            Self::Confirmed(record) => Some(record.message_id),
        }
    }

    pub fn temp_id(&self) -> Option<TempId> {
        match self {
            Self::Pending(pending) => Some(pending.temp_id),
            Self::Confirmed(_) => None,
        }
    }
}

/// Ordered view of one conversation, merging confirmed history with
/// optimistic sends. Confirmed entries are kept in store order
/// (`created_at`, then id); pending entries sit at the tail where they were
/// appended, a failed one staying visibly in place until retried.
#[derive(Debug, Default)]
pub struct ConversationCache {
    entries: Vec<CachedMessage>,
}

impl ConversationCache {
    pub fn entries(&self) -> &[CachedMessage] {
        &self.entries
    }

    pub fn append_pending(&mut self, pending: PendingSend) {
        self.entries.push(CachedMessage::Pending(pending));
    }

    pub fn pending(&self, temp_id: TempId) -> Option<&PendingSend> {
        self.entries.iter().find_map(|entry| match entry {
            CachedMessage::Pending(pending) if pending.temp_id == temp_id => Some(pending),
            _ => None,
        })
    }

    /// Replace the pending entry wholesale with the store-confirmed record.
    /// If the change feed already delivered the same store id (own send
    /// echoed from the feed), the pending entry is dropped instead so exactly
    /// one copy remains.
    pub fn confirm(&mut self, temp_id: TempId, record: MessageRecord) -> bool {
        let Some(index) = self.pending_index(temp_id) else {
            return false;
        };
        self.entries.remove(index);
        if !self.contains_store_id(record.message_id) {
            self.insert_confirmed(record);
        }
        true
    }

    pub fn mark_failed(&mut self, temp_id: TempId, error: String) -> bool {
        let Some(index) = self.pending_index(temp_id) else {
            return false;
        };
        if let CachedMessage::Pending(pending) = &mut self.entries[index] {
            pending.failed = true;
            pending.last_error = Some(error);
        }
        true
    }

    /// Flip a failed entry back to in-flight for a manual retry. Only failed
    /// entries are eligible; an in-flight or already-confirmed send is not.
    pub fn reset_failed(&mut self, temp_id: TempId) -> bool {
        let Some(index) = self.pending_index(temp_id) else {
            return false;
        };
        match &mut self.entries[index] {
            CachedMessage::Pending(pending) if pending.failed => {
                pending.failed = false;
                pending.last_error = None;
                true
            }
            _ => false,
        }
    }

    pub fn contains_store_id(&self, message_id: MessageId) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.store_id() == Some(message_id))
    }

    /// True when an in-flight (not failed) pending entry carries the same
    /// content as `record` — the local send pipeline is about to confirm it,
    /// so a feed echo of the same message must be ignored.
    pub fn has_inflight_pending_matching(&self, record: &MessageRecord) -> bool {
        self.entries.iter().any(|entry| match entry {
            CachedMessage::Pending(pending) => {
                !pending.failed
                    && pending.body == record.body
                    && pending.attachments == record.attachments
            }
            _ => false,
        })
    }

    /// Idempotently take a store-confirmed record into the cache: duplicates
    /// of an already-present store id are dropped, own records shadowed by an
    /// in-flight pending entry are left to the send pipeline, everything else
    /// is inserted in store order. Returns whether a new entry appeared.
    pub fn absorb_confirmed(&mut self, local_user: UserId, record: MessageRecord) -> bool {
        if self.contains_store_id(record.message_id) {
            return false;
        }
        if record.sender_id == local_user && self.has_inflight_pending_matching(&record) {
            return false;
        }
        self.insert_confirmed(record);
        true
    }

    /// Patch `is_read`/`likes` of a confirmed entry from an UPDATE feed
    /// event. Merging is monotonic: a read flag never reverts and like-sets
    /// only grow, so replayed or reordered events converge.
    pub fn patch(&mut self, record: &MessageRecord) -> bool {
        for entry in &mut self.entries {
            if let CachedMessage::Confirmed(existing) = entry {
                if existing.message_id != record.message_id {
                    continue;
                }
                let mut changed = false;
                if record.is_read && !existing.is_read {
                    existing.is_read = true;
                    changed = true;
                }
                for user in &record.likes {
                    if existing.likes.insert(*user) {
                        changed = true;
                    }
                }
                return changed;
            }
        }
        false
    }

    fn insert_confirmed(&mut self, record: MessageRecord) {
        let key = record.sort_key();
        let index = self
            .entries
            .iter()
            .position(|entry| match entry {
                CachedMessage::Pending(_) => true,
                CachedMessage::Confirmed(existing) => existing.sort_key() > key,
            })
            .unwrap_or(self.entries.len());
        self.entries.insert(index, CachedMessage::Confirmed(record));
    }

    fn pending_index(&self, temp_id: TempId) -> Option<usize> {
        self.entries.iter().position(|entry| match entry {
            CachedMessage::Pending(pending) => pending.temp_id == temp_id,
            _ => false,
        })
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
