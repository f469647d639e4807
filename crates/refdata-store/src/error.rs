use refdata_types::TypeError;

/// Errors from reference data store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A loader method was called in a state that does not allow it.
    #[error("illegal loader state: {0}")]
    IllegalState(String),

    /// An index entry points at data that does not exist.
    #[error("data corruption: {0}")]
    Corruption(String),

    /// Two indices that must agree do not.
    #[error("consistency violation: {0}")]
    Consistency(String),

    /// A record that must exist was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Waiting for a stream lock was interrupted.
    #[error("interrupted while waiting for lock on {0}")]
    Interrupted(String),

    #[error("UID space exhausted, cannot allocate beyond {0}")]
    UidOverflow(u32),

    #[error("reference count overflow for value {0}")]
    ReferenceCountOverflow(String),

    /// Every unique id slot for a value hash is taken.
    #[error("no free unique id for value hash {0:016x}")]
    UniqueIdExhausted(u64),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No consumer is registered for a stored type id.
    #[error("unknown value type id {0}")]
    UnknownValueType(u8),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Type(TypeError),

    #[error("failed to open database: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("failed to begin transaction: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("failed to open table: {0}")]
    Table(#[from] redb::TableError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("failed to commit transaction: {0}")]
    Commit(#[from] redb::CommitError),
}

impl From<TypeError> for StoreError {
    fn from(err: TypeError) -> Self {
        match err {
            TypeError::UidOverflow(last) => StoreError::UidOverflow(last),
            other => StoreError::Type(other),
        }
    }
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
