//! Cache operation error taxonomy
//!
//! Configuration problems, serialization failures and backend I/O faults are
//! kept as distinct variants so callers (and the orchestrator itself) can apply
//! the right degradation policy: bypass on bad configuration, log-and-miss on
//! backend failure, propagate on serializer failure.

/// Result alias used throughout the crate.
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors surfaced by cache operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Key failed validation (empty, overlong, control characters).
    InvalidKey(String),
    /// Tag failed validation (empty, reserved wildcard, control characters).
    InvalidTag(String),
    /// Value could not be serialized. Fatal by design: never silently
    /// downgraded to a miss.
    SerializationError(String),
    /// Stored bytes could not be deserialized. Fatal by design.
    DeserializationError(String),
    /// Backend (distributed tier) I/O failure.
    StorageError(String),
    /// Instance-level configuration problem.
    InvalidConfiguration(String),
    /// A reserved value was requested from an item whose buffer has already
    /// been recycled. Indicates a reservation-protocol violation.
    ItemDisposed,
    /// Every interested caller abandoned the operation.
    OperationCancelled,
    /// Internal coordination failure (population task dropped mid-flight).
    InternalError(String),
}

impl CacheError {
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        CacheError::InvalidKey(msg.into())
    }

    pub fn invalid_tag(msg: impl Into<String>) -> Self {
        CacheError::InvalidTag(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        CacheError::SerializationError(msg.into())
    }

    pub fn deserialization(msg: impl Into<String>) -> Self {
        CacheError::DeserializationError(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        CacheError::StorageError(msg.into())
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        CacheError::InvalidConfiguration(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CacheError::InternalError(msg.into())
    }
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::InvalidKey(msg) => write!(f, "Invalid cache key: {}", msg),
            CacheError::InvalidTag(msg) => write!(f, "Invalid cache tag: {}", msg),
            CacheError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            CacheError::DeserializationError(msg) => write!(f, "Deserialization error: {}", msg),
            CacheError::StorageError(msg) => write!(f, "Storage error: {}", msg),
            CacheError::InvalidConfiguration(msg) => write!(f, "Invalid configuration: {}", msg),
            CacheError::ItemDisposed => write!(f, "Cache item already disposed"),
            CacheError::OperationCancelled => write!(f, "Operation cancelled"),
            CacheError::InternalError(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {}
