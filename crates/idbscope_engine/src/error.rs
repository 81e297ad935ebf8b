//! Error types for engine operations.

use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors reported by a key-value engine.
///
/// The variants follow the exception names browsers use for their
/// persistent key-value store, so an adapter over the real thing can map
/// them one to one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Requested version is lower than the stored version.
    #[error("VersionError: requested version {requested} is less than the existing version {existing}")]
    Version {
        /// Version passed to the open call.
        requested: u64,
        /// Version currently stored.
        existing: u64,
    },

    /// The call is not allowed in the current state of its target.
    #[error("InvalidStateError: {0}")]
    InvalidState(String),

    /// A named store, connection or transaction does not exist.
    #[error("NotFoundError: {0}")]
    NotFound(String),

    /// A uniqueness constraint was violated.
    #[error("ConstraintError: {0}")]
    Constraint(String),

    /// A write was attempted in a read-only transaction.
    #[error("ReadOnlyError: transaction on '{store}' is read-only")]
    ReadOnly {
        /// Store the transaction is scoped to.
        store: String,
    },

    /// The transaction has already finished.
    #[error("TransactionInactiveError: {0}")]
    TransactionInactive(String),

    /// The supplied data or key is not acceptable.
    #[error("DataError: {0}")]
    Data(String),

    /// The operation was aborted.
    #[error("AbortError: {0}")]
    Abort(String),

    /// Any other engine failure.
    #[error("UnknownError: {0}")]
    Unknown(String),
}

impl EngineError {
    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Creates a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Creates a data error.
    pub fn data(message: impl Into<String>) -> Self {
        Self::Data(message.into())
    }

    /// Returns the exception-style name of this error.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Version { .. } => "VersionError",
            Self::InvalidState(_) => "InvalidStateError",
            Self::NotFound(_) => "NotFoundError",
            Self::Constraint(_) => "ConstraintError",
            Self::ReadOnly { .. } => "ReadOnlyError",
            Self::TransactionInactive(_) => "TransactionInactiveError",
            Self::Data(_) => "DataError",
            Self::Abort(_) => "AbortError",
            Self::Unknown(_) => "UnknownError",
        }
    }
}
