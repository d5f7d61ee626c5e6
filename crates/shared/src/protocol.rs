use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ConversationId, ListingId, MessageId, UserId};

/// A durable 1:1 channel between two marketplace participants, optionally
/// scoped to a listing. Created lazily on the first message attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub buyer_id: UserId,
    pub seller_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_id: Option<ListingId>,
}

impl ConversationSummary {
    pub fn participants(&self) -> [UserId; 2] {
        [self.buyer_id, self.seller_id]
    }

    pub fn involves(&self, user_id: UserId) -> bool {
        self.buyer_id == user_id || self.seller_id == user_id
    }

    pub fn counterpart(&self, user_id: UserId) -> Option<UserId> {
        if self.buyer_id == user_id {
            Some(self.seller_id)
        } else if self.seller_id == user_id {
            Some(self.buyer_id)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub filename: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A message as committed by the store. Immutable after creation except for
/// `is_read` (monotonic false to true) and `likes` (grow-only set).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentPayload>,
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub likes: BTreeSet<UserId>,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    /// In-conversation display order: `created_at` ascending, store id breaks
    /// ties (ids are assigned in commit order).
    pub fn sort_key(&self) -> (DateTime<Utc>, MessageId) {
        (self.created_at, self.message_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedEventKind {
    Insert,
    Update,
}

/// Row-level change emitted by the store as it commits. Participants are
/// carried on the event so subscribers can filter without a lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEvent {
    pub kind: FeedEventKind,
    pub participants: [UserId; 2],
    pub message: MessageRecord,
}

/// Narrowing applied by a change-feed subscriber: everything, one
/// conversation, or everything involving one user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedFilter {
    pub conversation: Option<ConversationId>,
    pub participant: Option<UserId>,
}

impl FeedFilter {
    pub fn conversation(conversation_id: ConversationId) -> Self {
        Self {
            conversation: Some(conversation_id),
            participant: None,
        }
    }

    pub fn participant(user_id: UserId) -> Self {
        Self {
            conversation: None,
            participant: Some(user_id),
        }
    }

    pub fn matches(&self, event: &FeedEvent) -> bool {
        if let Some(conversation_id) = self.conversation {
            if event.message.conversation_id != conversation_id {
                return false;
            }
        }
        if let Some(user_id) = self.participant {
            if !event.participants.contains(&user_id) {
                return false;
            }
        }
        true
    }
}
