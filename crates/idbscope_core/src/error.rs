//! Error types for idbscope core.

use idbscope_engine::EngineError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors returned by session commands.
///
/// Every error that reaches the engine is also recorded in the
/// [`crate::EventLog`], so a caller may ignore the returned value and still
/// observe the failure.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The engine rejected a call.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Database name or version is not acceptable.
    #[error("invalid database identity: {message}")]
    InvalidIdentity {
        /// Why the identity was rejected.
        message: String,
    },

    /// The command is not allowed in the current controller state.
    #[error("invalid operation: {message}")]
    InvalidState {
        /// Why the command was rejected.
        message: String,
    },

    /// No connection is open.
    #[error("no open connection")]
    NotOpen,

    /// No collection has been selected.
    #[error("no active collection")]
    NoActiveCollection,

    /// The collection is not part of the current connection's schema.
    #[error("collection not found: {name}")]
    CollectionNotFound {
        /// Name that was looked up.
        name: String,
    },

    /// A value could not be turned into a record.
    #[error("invalid record: {message}")]
    InvalidRecord {
        /// What is wrong with the value.
        message: String,
    },

    /// A collection could not be created during an upgrade.
    #[error("migration failed on collection '{collection}': {source}")]
    MigrationFailed {
        /// Collection being created.
        collection: String,
        /// The engine's rejection.
        #[source]
        source: EngineError,
    },
}

impl CoreError {
    /// Creates an invalid identity error.
    pub fn invalid_identity(message: impl Into<String>) -> Self {
        Self::InvalidIdentity {
            message: message.into(),
        }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates an invalid record error.
    pub fn invalid_record(message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            message: message.into(),
        }
    }

    /// Creates a collection not found error.
    pub fn collection_not_found(name: impl Into<String>) -> Self {
        Self::CollectionNotFound { name: name.into() }
    }
}

/// Classification of failures recorded in the event log.
///
/// None of these is fatal: each leaves the session either `Closed` or
/// `Open` with its last committed projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    /// Open or delete failed; the controller is back to `Closed`.
    Connection,
    /// Another connection prevents an upgrade or delete.
    Blocked,
    /// A store request or transaction failed.
    Transaction,
    /// The held connection received `versionchange` and was closed.
    VersionConflict,
}

impl ErrorClass {
    /// Returns the class name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "ConnectionError",
            Self::Blocked => "BlockedError",
            Self::Transaction => "TransactionError",
            Self::VersionConflict => "VersionConflictError",
        }
    }
}
