//! Identifiers, requests and events exchanged with an engine.

use crate::error::EngineError;
use serde_json::Value;
use std::fmt;

macro_rules! engine_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        impl $name {
            /// Creates an identifier from its raw value.
            #[must_use]
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            /// Returns the raw identifier value.
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

engine_id!(
    /// Identifies an open (or once-open) database connection.
    ConnectionId,
    "conn"
);
engine_id!(
    /// Identifies an asynchronous request: open, delete, or a store request.
    ///
    /// Request ids are never reused, so a late result can always be matched
    /// (or rejected) by id alone.
    RequestId,
    "req"
);
engine_id!(
    /// Identifies a transaction.
    ///
    /// Transaction ids increase monotonically; an older transaction always
    /// has a smaller id, which the engine uses for scheduling.
    TransactionId,
    "txn"
);

/// Access mode of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionMode {
    /// Reads only; may run alongside other readers.
    ReadOnly,
    /// Reads and writes; excludes overlapping transactions.
    ReadWrite,
}

impl TransactionMode {
    /// Returns the mode name used by browsers.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadOnly => "readonly",
            Self::ReadWrite => "readwrite",
        }
    }
}

/// A request against the single store a transaction is scoped to.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreRequest {
    /// Inserts or replaces a value; the key is read from the store's key path.
    Put(Value),
    /// Reads the value stored under a key.
    Get(String),
    /// Lists every key in ascending order.
    GetAllKeys,
    /// Removes the value stored under a key.
    Delete(String),
    /// Removes every value.
    Clear,
}

impl StoreRequest {
    /// Returns true if the request modifies the store.
    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Put(_) | Self::Delete(_) | Self::Clear)
    }

    /// Returns the operation name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Put(_) => "put",
            Self::Get(_) => "get",
            Self::GetAllKeys => "getAllKeys",
            Self::Delete(_) => "delete",
            Self::Clear => "clear",
        }
    }
}

/// Successful result of a store request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutput {
    /// Key written by a put.
    Key(String),
    /// Value read by a get; `None` if the key is absent.
    Value(Option<Value>),
    /// Keys listed by getAllKeys.
    Keys(Vec<String>),
    /// Delete or clear finished.
    Done,
}

/// Outcome of an open request.
#[derive(Debug, Clone, PartialEq)]
pub enum OpenOutcome {
    /// The connection is ready.
    Success {
        /// The new connection.
        connection: ConnectionId,
        /// Version the connection was opened at.
        version: u64,
    },
    /// The open failed; no connection exists.
    Error(EngineError),
    /// A schema upgrade is running on the new connection.
    ///
    /// Fired before `Success` for the same request. Stores may only be
    /// created while handling this event.
    UpgradeNeeded {
        /// The connection being upgraded.
        connection: ConnectionId,
        /// Version stored before the upgrade (0 for a new database).
        old_version: u64,
        /// Version being upgraded to.
        new_version: u64,
    },
    /// Other connections are still open and prevent the upgrade.
    Blocked {
        /// Version stored now.
        old_version: u64,
        /// Version requested.
        new_version: u64,
    },
}

/// Outcome of a delete-database request.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    /// The database no longer exists.
    Success {
        /// Version the database had before deletion (0 if it did not exist).
        old_version: u64,
    },
    /// The delete failed.
    Error(EngineError),
    /// Other connections are still open and prevent the delete.
    Blocked {
        /// Version stored now.
        old_version: u64,
    },
}

/// Outcome of a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome {
    /// The transaction committed; its writes are durable and visible.
    Complete,
    /// The transaction was rolled back.
    Abort {
        /// Why the transaction aborted.
        reason: String,
    },
}

/// Out-of-band event fired at a listened connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Another party wants to upgrade or delete the database.
    VersionChange {
        /// Version of this connection.
        old_version: u64,
        /// Requested version, or `None` for a delete.
        new_version: Option<u64>,
    },
    /// The engine closed the connection on its own.
    Close,
    /// A transaction on this connection aborted.
    Abort {
        /// Why the transaction aborted.
        reason: String,
    },
    /// A request on this connection failed.
    Error {
        /// The failure, as reported by the request.
        reason: String,
    },
}

/// An asynchronous completion delivered by [`crate::Engine::poll_event`].
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Progress of an open request.
    Open {
        /// The open request.
        request: RequestId,
        /// What happened.
        outcome: OpenOutcome,
    },
    /// Progress of a delete-database request.
    Delete {
        /// The delete request.
        request: RequestId,
        /// What happened.
        outcome: DeleteOutcome,
    },
    /// A store request finished.
    Request {
        /// The store request.
        request: RequestId,
        /// The transaction it ran in.
        transaction: TransactionId,
        /// Its result.
        result: Result<RequestOutput, EngineError>,
    },
    /// A transaction finished.
    Transaction {
        /// The transaction.
        transaction: TransactionId,
        /// How it finished.
        outcome: TransactionOutcome,
    },
    /// An event fired at a listened connection.
    Connection {
        /// The connection.
        connection: ConnectionId,
        /// What happened.
        event: ConnectionEvent,
    },
}
