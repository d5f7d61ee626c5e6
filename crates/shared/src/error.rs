use thiserror::Error;

/// Failure surface of the persistent message store.
///
/// The two arms are handled identically by callers (a failed send is a failed
/// send either way); the split exists so logs can tell connectivity problems
/// apart from requests the store will never accept.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("store rejected request: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }
}
