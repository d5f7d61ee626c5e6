use shared::domain::TempId;
use thiserror::Error;

/// The only errors `send`/`retry` surface to the caller. Store failures never
/// appear here; they are recorded on the cache entry as `failed` state.
#[derive(Debug, Clone, Error)]
pub enum SendRequestError {
    #[error("message body and attachments are both empty")]
    EmptyMessage,
    #[error("no failed pending message {0} to retry")]
    UnknownPending(TempId),
}
