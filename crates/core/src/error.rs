// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LetheError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("invalid fact: {0}")]
    InvalidFact(String),
    #[error("invalid rule: {0}")]
    InvalidRule(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl LetheError {
    /// Whether this error means the key-value layer could not be reached at all,
    /// as opposed to a single record or batch failing.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, LetheError::Unavailable(_))
    }
}

impl From<redb::DatabaseError> for LetheError {
    fn from(e: redb::DatabaseError) -> Self {
        LetheError::Unavailable(e.to_string())
    }
}
impl From<redb::TransactionError> for LetheError {
    fn from(e: redb::TransactionError) -> Self {
        LetheError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for LetheError {
    fn from(e: redb::TableError) -> Self {
        LetheError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for LetheError {
    fn from(e: redb::StorageError) -> Self {
        LetheError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for LetheError {
    fn from(e: redb::CommitError) -> Self {
        LetheError::Storage(e.to_string())
    }
}
impl From<tokio::task::JoinError> for LetheError {
    fn from(e: tokio::task::JoinError) -> Self {
        LetheError::Unavailable(format!("storage task failed: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, LetheError>;
