//! Coordination-layer error model.

use thiserror::Error;

/// Result type used across the coordination layer.
pub type CoordResult<T> = Result<T, CoordError>;

/// Infrastructure-level error.
///
/// Keep this focused on failures of the coordination machinery itself.
/// Business-level job failures are not errors here; they drive the retry
/// state machine and surface as a terminal job state instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordError {
    /// The shared store was unreachable or an operation failed in transit.
    /// The state of the attempted operation is unknown; callers must not
    /// assume it succeeded.
    #[error("store connection error: {0}")]
    Connection(String),

    /// A value could not be serialized/deserialized to or from the store.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A caller referenced a queue that was never registered.
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// Configuration was malformed or missing.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The component was shut down and no longer accepts work.
    #[error("coordination layer is closed")]
    Closed,
}

impl CoordError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn queue_not_found(name: impl Into<String>) -> Self {
        Self::QueueNotFound(name.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Whether this error indicates the store could not be reached.
    ///
    /// Rate limiters use this to apply their fail-open/fail-closed policy.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}
