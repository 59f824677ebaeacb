use thiserror::Error;

// ---------------------------------------------------------------------------
// DecodeError
// ---------------------------------------------------------------------------

/// A single field that could not be decoded from its wire representation.
///
/// Never fatal on its own: the document converter logs it and treats the
/// field as absent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Unrecognized wire shape for field \"{field}\": {shape}")]
    UnrecognizedShape { field: String, shape: String },

    #[error("Field \"{field}\" expects {expected}, received {received}")]
    KindMismatch {
        field: String,
        expected: String,
        received: String,
    },

    #[error("Field \"{field}\" holds an unparseable {expected}: {value:?}")]
    InvalidValue {
        field: String,
        expected: String,
        value: String,
    },
}

impl DecodeError {
    /// The id of the field that failed to decode.
    pub fn field(&self) -> &str {
        match self {
            Self::UnrecognizedShape { field, .. }
            | Self::KindMismatch { field, .. }
            | Self::InvalidValue { field, .. } => field,
        }
    }
}

// ---------------------------------------------------------------------------
// DocumentError
// ---------------------------------------------------------------------------

/// A remote document that cannot be turned into an entity at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("Remote document has an empty id")]
    MissingId,

    #[error("Document {id}: malformed audit metadata \"{key}\": {reason}")]
    MalformedAudit {
        id: String,
        key: String,
        reason: String,
    },

    #[error("Document {id}: none of its {} field(s) could be decoded", failures.len())]
    Unusable { id: String, failures: Vec<DecodeError> },
}

// ---------------------------------------------------------------------------
// StorageError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Entity not found: {id}")]
    NotFound { id: String },

    #[error("Mutation not found: {id}")]
    MutationNotFound { id: i64 },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Storage corruption in {table}/{id}: failed to parse \"{column}\"")]
    Corruption {
        table: String,
        id: String,
        column: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[cfg(feature = "sqlite")]
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

// ---------------------------------------------------------------------------
// RemoteError
// ---------------------------------------------------------------------------

/// Classification of remote failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Connectivity or timeout.
    Network,
    /// Rejected by the remote's access rules.
    Permission,
    /// Anything else the remote reported.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("Document not found: {parent_id}/{id}")]
    DocumentNotFound { parent_id: String, id: String },

    #[error("Remote write failed ({kind:?}): {message}")]
    WriteFailed {
        message: String,
        kind: RemoteErrorKind,
    },

    #[error("Remote read failed ({kind:?}): {message}")]
    ReadFailed {
        message: String,
        kind: RemoteErrorKind,
    },
}

impl RemoteError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
            kind: RemoteErrorKind::Network,
        }
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
            kind: RemoteErrorKind::Permission,
        }
    }
}

// ---------------------------------------------------------------------------
// SyncError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Sync engine for \"{0}\" is stopped")]
    Stopped(String),

    #[error("Sync engine for \"{0}\" is already running")]
    AlreadyRunning(String),

    #[error("No parent collection is active")]
    NoActiveParent,

    #[error("Mutation targets parent \"{mutation}\" but the engine serves \"{engine}\"")]
    ParentMismatch { mutation: String, engine: String },
}

// ---------------------------------------------------------------------------
// FieldSyncError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FieldSyncError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Invalid mutation: {0}")]
    InvalidMutation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for FieldSyncError {
    fn from(e: rusqlite::Error) -> Self {
        FieldSyncError::Storage(StorageError::Sqlite(e))
    }
}

/// Convenience alias. The default error type is `FieldSyncError`.
pub type Result<T, E = FieldSyncError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
