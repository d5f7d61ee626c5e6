use async_trait::async_trait;
use serde::Serialize;
use shared::domain::{ConversationId, UserId};
use thiserror::Error;

/// Longest body excerpt forwarded to the recipient notification.
pub const PREVIEW_MAX_CHARS: usize = 120;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notification dispatcher unavailable")]
    Unavailable,
    #[error("webhook dispatch failed: {0}")]
    Http(String),
}

/// External collaborator that emails the recipient about a new message.
/// Invoked fire-and-forget: a failure here is logged and never reaches the
/// sender or the message state.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn notify_new_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        body_preview: &str,
    ) -> Result<(), NotificationError>;
}

pub struct MissingNotificationDispatcher;

#[async_trait]
impl NotificationDispatcher for MissingNotificationDispatcher {
    async fn notify_new_message(
        &self,
        _conversation_id: ConversationId,
        _sender_id: UserId,
        _body_preview: &str,
    ) -> Result<(), NotificationError> {
        Err(NotificationError::Unavailable)
    }
}

#[derive(Debug, Serialize)]
struct NewMessageNotification<'a> {
    conversation_id: i64,
    sender_id: i64,
    body_preview: &'a str,
}

/// Posts new-message notifications to the platform's notification service.
pub struct WebhookNotificationDispatcher {
    http: reqwest::Client,
    endpoint: String,
}

impl WebhookNotificationDispatcher {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl NotificationDispatcher for WebhookNotificationDispatcher {
    async fn notify_new_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        body_preview: &str,
    ) -> Result<(), NotificationError> {
        self.http
            .post(&self.endpoint)
            .json(&NewMessageNotification {
                conversation_id: conversation_id.0,
                sender_id: sender_id.0,
                body_preview,
            })
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| NotificationError::Http(err.to_string()))?;
        Ok(())
    }
}

/// Truncate a message body to the preview length on a char boundary.
pub fn body_preview(body: &str) -> &str {
    match body.char_indices().nth(PREVIEW_MAX_CHARS) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_keeps_short_bodies_intact() {
        assert_eq!(body_preview("is this still available?"), "is this still available?");
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        let body = "ä".repeat(200);
        let preview = body_preview(&body);
        assert_eq!(preview.chars().count(), PREVIEW_MAX_CHARS);
    }
}
