//! Engine trait definition.

use crate::error::EngineResult;
use crate::types::{ConnectionId, EngineEvent, RequestId, StoreRequest, TransactionId, TransactionMode};

/// An asynchronous, event-driven key-value engine.
///
/// Engines are driven without blocking: every call that would complete
/// asynchronously returns an id immediately, and its completion is delivered
/// later as an [`EngineEvent`] from [`Engine::poll_event`]. The caller owns
/// the dispatch loop, so all callbacks run on the caller's thread, one at a
/// time, in the order the engine fires them.
///
/// # Invariants
///
/// - An `Open` request fires `UpgradeNeeded` (at most once) before `Success`
/// - Stores can only be created while the `UpgradeNeeded` event of their
///   connection is being handled, i.e. before the next `poll_event`
/// - A transaction fires exactly one of `Complete` or `Abort`
/// - Writes become visible to other transactions only after `Complete`
/// - Connection events are delivered only between `listen` and `unlisten`
/// - Closing a connection locally never fires a `Close` event
///
/// # Implementors
///
/// - [`super::InMemoryEngine`] - Deterministic simulation for tests and the CLI
pub trait Engine {
    /// Requests a connection to database `name` at `version`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be issued at all (for example
    /// a zero version); asynchronous failures arrive as events.
    fn open(&mut self, name: &str, version: u64) -> EngineResult<RequestId>;

    /// Requests deletion of database `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be issued.
    fn delete_database(&mut self, name: &str) -> EngineResult<RequestId>;

    /// Closes a connection. Closing an already closed connection is a no-op.
    fn close(&mut self, connection: ConnectionId);

    /// Registers for out-of-band events of a connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown or closed.
    fn listen(&mut self, connection: ConnectionId) -> EngineResult<()>;

    /// Stops delivery of out-of-band events for a connection.
    fn unlisten(&mut self, connection: ConnectionId);

    /// Returns the store names visible to a connection, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown.
    fn store_names(&self, connection: ConnectionId) -> EngineResult<Vec<String>>;

    /// Creates a store whose primary key is read from `key_path`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` outside the connection's upgrade and
    /// `Constraint` if the store already exists.
    fn create_store(
        &mut self,
        connection: ConnectionId,
        name: &str,
        key_path: &str,
    ) -> EngineResult<()>;

    /// Starts a transaction scoped to a single store.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or upgrading, or if the
    /// store does not exist.
    fn transaction(
        &mut self,
        connection: ConnectionId,
        store: &str,
        mode: TransactionMode,
    ) -> EngineResult<TransactionId>;

    /// Issues a request inside a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction has finished, if a write is
    /// issued in a read-only transaction, or if a value has no usable key.
    fn request(
        &mut self,
        transaction: TransactionId,
        request: StoreRequest,
    ) -> EngineResult<RequestId>;

    /// Returns the next pending event, running engine work as needed.
    ///
    /// Returns `None` once nothing is left to deliver to this caller.
    fn poll_event(&mut self) -> Option<EngineEvent>;
}
