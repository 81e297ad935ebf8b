//! A hand-driven engine.
//!
//! [`ScriptedEngine`] never produces events on its own. It records every
//! call made to it and returns whatever events the test pushed, in the order
//! the test chose. That makes it possible to deliver callbacks in orders the
//! in-memory engine never would: results out of order, `blocked` for an open
//! that already succeeded, late results of a superseded refresh.

use idbscope_engine::{
    ConnectionEvent, ConnectionId, DeleteOutcome, Engine, EngineError, EngineEvent, EngineResult,
    OpenOutcome, RequestId, RequestOutput, StoreRequest, TransactionId, TransactionMode,
    TransactionOutcome,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// A call received by a [`ScriptedEngine`].
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    /// `open(name, version)` returned `request`.
    Open {
        /// Database name.
        name: String,
        /// Requested version.
        version: u64,
        /// Returned request id.
        request: RequestId,
    },
    /// `delete_database(name)` returned `request`.
    DeleteDatabase {
        /// Database name.
        name: String,
        /// Returned request id.
        request: RequestId,
    },
    /// `close(connection)`.
    Close(ConnectionId),
    /// `listen(connection)`.
    Listen(ConnectionId),
    /// `unlisten(connection)`.
    Unlisten(ConnectionId),
    /// `create_store(connection, name, key_path)`.
    CreateStore {
        /// Upgrading connection.
        connection: ConnectionId,
        /// Store name.
        name: String,
        /// Key path.
        key_path: String,
    },
    /// `transaction(connection, store, mode)` returned `transaction`.
    Transaction {
        /// Connection.
        connection: ConnectionId,
        /// Store the transaction is scoped to.
        store: String,
        /// Access mode.
        mode: TransactionMode,
        /// Returned transaction id.
        transaction: TransactionId,
    },
    /// `request(transaction, request)` returned `id`.
    Request {
        /// Transaction.
        transaction: TransactionId,
        /// The request.
        request: StoreRequest,
        /// Returned request id.
        id: RequestId,
    },
}

/// A store request issued to a [`ScriptedEngine`].
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedRequest {
    /// Request id.
    pub id: RequestId,
    /// Transaction it was issued in.
    pub transaction: TransactionId,
    /// The request.
    pub request: StoreRequest,
}

/// An engine whose events are pushed by the test.
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    next_id: u64,
    calls: Vec<Call>,
    events: VecDeque<EngineEvent>,
    open_names: HashMap<RequestId, String>,
    databases: HashMap<ConnectionId, String>,
    stores: BTreeMap<String, BTreeSet<String>>,
    upgrading: Option<ConnectionId>,
    live: BTreeSet<ConnectionId>,
    reject_next: Option<EngineError>,
}

impl ScriptedEngine {
    /// Creates an engine with no scripted events.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn take_rejection(&mut self) -> EngineResult<()> {
        match self.reject_next.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Allocates a connection id for use in scripted events.
    pub fn new_connection(&mut self) -> ConnectionId {
        ConnectionId::new(self.next_id())
    }

    /// Queues an event after every queued one.
    pub fn push(&mut self, event: EngineEvent) {
        self.events.push_back(event);
    }

    /// Queues an event before every queued one.
    pub fn push_front(&mut self, event: EngineEvent) {
        self.events.push_front(event);
    }

    /// Makes the next fallible call fail with `err`.
    pub fn reject_next(&mut self, err: EngineError) {
        self.reject_next = Some(err);
    }

    /// Declares the stores database `name` already has.
    pub fn set_stores<I, S>(&mut self, name: &str, stores: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stores
            .insert(name.to_string(), stores.into_iter().map(Into::into).collect());
    }

    /// Every call received so far.
    #[must_use]
    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    /// Removes and returns every call received so far.
    pub fn take_calls(&mut self) -> Vec<Call> {
        std::mem::take(&mut self.calls)
    }

    /// Number of events still queued.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.events.len()
    }

    /// Connections delivered by open events and not closed since.
    #[must_use]
    pub fn live_connections(&self) -> Vec<ConnectionId> {
        self.live.iter().copied().collect()
    }

    /// The most recent open request.
    #[must_use]
    pub fn last_open(&self) -> Option<RequestId> {
        self.calls.iter().rev().find_map(|call| match call {
            Call::Open { request, .. } => Some(*request),
            _ => None,
        })
    }

    /// The most recent delete request.
    #[must_use]
    pub fn last_delete(&self) -> Option<RequestId> {
        self.calls.iter().rev().find_map(|call| match call {
            Call::DeleteDatabase { request, .. } => Some(*request),
            _ => None,
        })
    }

    /// Every store request issued so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<IssuedRequest> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::Request {
                    transaction,
                    request,
                    id,
                } => Some(IssuedRequest {
                    id: *id,
                    transaction: *transaction,
                    request: request.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// The most recent store request.
    #[must_use]
    pub fn last_request(&self) -> Option<IssuedRequest> {
        self.requests().pop()
    }

    /// Store requests matching `predicate`, in order.
    pub fn requests_where(&self, predicate: impl Fn(&StoreRequest) -> bool) -> Vec<IssuedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| predicate(&r.request))
            .collect()
    }

    /// Scripts a complete open: upgrade (if `old_version < version`) then
    /// success, for the most recent open request.
    ///
    /// Returns the new connection.
    pub fn script_open(&mut self, old_version: u64, version: u64) -> Option<ConnectionId> {
        let request = self.last_open()?;
        let connection = self.new_connection();
        if old_version < version {
            self.push(EngineEvent::Open {
                request,
                outcome: OpenOutcome::UpgradeNeeded {
                    connection,
                    old_version,
                    new_version: version,
                },
            });
        }
        self.push(EngineEvent::Open {
            request,
            outcome: OpenOutcome::Success {
                connection,
                version,
            },
        });
        Some(connection)
    }

    /// Scripts the outcome of a store request.
    pub fn script_result(
        &mut self,
        request: &IssuedRequest,
        result: Result<RequestOutput, EngineError>,
    ) {
        self.push(EngineEvent::Request {
            request: request.id,
            transaction: request.transaction,
            result,
        });
    }

    /// Scripts a successful request followed by its transaction's commit.
    pub fn script_commit(&mut self, request: &IssuedRequest, output: RequestOutput) {
        self.script_result(request, Ok(output));
        self.push(EngineEvent::Transaction {
            transaction: request.transaction,
            outcome: TransactionOutcome::Complete,
        });
    }

    /// Scripts a failed request followed by the events a browser fires for
    /// it: the error bubbling to the connection, then the abort.
    pub fn script_failure(&mut self, request: &IssuedRequest, connection: ConnectionId, reason: &str) {
        self.script_result(request, Err(EngineError::Unknown(reason.to_string())));
        self.push(EngineEvent::Connection {
            connection,
            event: ConnectionEvent::Error {
                reason: reason.to_string(),
            },
        });
        self.push(EngineEvent::Transaction {
            transaction: request.transaction,
            outcome: TransactionOutcome::Abort {
                reason: reason.to_string(),
            },
        });
        self.push(EngineEvent::Connection {
            connection,
            event: ConnectionEvent::Abort {
                reason: reason.to_string(),
            },
        });
    }

    /// Scripts a successful delete of the most recent delete request.
    pub fn script_delete(&mut self, old_version: u64) -> Option<RequestId> {
        let request = self.last_delete()?;
        self.push(EngineEvent::Delete {
            request,
            outcome: DeleteOutcome::Success { old_version },
        });
        Some(request)
    }
}

impl Engine for ScriptedEngine {
    fn open(&mut self, name: &str, version: u64) -> EngineResult<RequestId> {
        self.take_rejection()?;
        let request = RequestId::new(self.next_id());
        self.open_names.insert(request, name.to_string());
        self.calls.push(Call::Open {
            name: name.to_string(),
            version,
            request,
        });
        Ok(request)
    }

    fn delete_database(&mut self, name: &str) -> EngineResult<RequestId> {
        self.take_rejection()?;
        let request = RequestId::new(self.next_id());
        self.calls.push(Call::DeleteDatabase {
            name: name.to_string(),
            request,
        });
        Ok(request)
    }

    fn close(&mut self, connection: ConnectionId) {
        self.live.remove(&connection);
        self.calls.push(Call::Close(connection));
    }

    fn listen(&mut self, connection: ConnectionId) -> EngineResult<()> {
        self.take_rejection()?;
        self.calls.push(Call::Listen(connection));
        Ok(())
    }

    fn unlisten(&mut self, connection: ConnectionId) {
        self.calls.push(Call::Unlisten(connection));
    }

    fn store_names(&self, connection: ConnectionId) -> EngineResult<Vec<String>> {
        let database = self
            .databases
            .get(&connection)
            .ok_or_else(|| EngineError::not_found(format!("unknown connection {connection}")))?;
        Ok(self
            .stores
            .get(database)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn create_store(
        &mut self,
        connection: ConnectionId,
        name: &str,
        key_path: &str,
    ) -> EngineResult<()> {
        self.take_rejection()?;
        self.calls.push(Call::CreateStore {
            connection,
            name: name.to_string(),
            key_path: key_path.to_string(),
        });
        if self.upgrading != Some(connection) {
            return Err(EngineError::invalid_state(
                "stores can only be created during a version change transaction",
            ));
        }
        let database = self.databases.get(&connection).cloned().unwrap_or_default();
        if !self.stores.entry(database).or_default().insert(name.to_string()) {
            return Err(EngineError::Constraint(format!(
                "object store '{name}' already exists"
            )));
        }
        Ok(())
    }

    fn transaction(
        &mut self,
        connection: ConnectionId,
        store: &str,
        mode: TransactionMode,
    ) -> EngineResult<TransactionId> {
        self.take_rejection()?;
        let transaction = TransactionId::new(self.next_id());
        self.calls.push(Call::Transaction {
            connection,
            store: store.to_string(),
            mode,
            transaction,
        });
        Ok(transaction)
    }

    fn request(
        &mut self,
        transaction: TransactionId,
        request: StoreRequest,
    ) -> EngineResult<RequestId> {
        self.take_rejection()?;
        let id = RequestId::new(self.next_id());
        self.calls.push(Call::Request {
            transaction,
            request,
            id,
        });
        Ok(id)
    }

    fn poll_event(&mut self) -> Option<EngineEvent> {
        self.upgrading = None;
        let event = self.events.pop_front()?;
        if let EngineEvent::Open { request, outcome } = &event {
            match outcome {
                OpenOutcome::UpgradeNeeded { connection, .. } => {
                    self.upgrading = Some(*connection);
                    self.bind(*request, *connection);
                }
                OpenOutcome::Success { connection, .. } => self.bind(*request, *connection),
                OpenOutcome::Error(_) | OpenOutcome::Blocked { .. } => {}
            }
        }
        Some(event)
    }
}

impl ScriptedEngine {
    fn bind(&mut self, request: RequestId, connection: ConnectionId) {
        if let Some(name) = self.open_names.get(&request) {
            self.databases.insert(connection, name.clone());
        }
        self.live.insert(connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_calls_and_replays_events() {
        let mut engine = ScriptedEngine::new();
        let request = engine.open("orders", 1).unwrap();
        let connection = engine.script_open(0, 1).unwrap();

        assert!(matches!(
            engine.poll_event(),
            Some(EngineEvent::Open {
                outcome: OpenOutcome::UpgradeNeeded { .. },
                ..
            })
        ));
        engine.create_store(connection, "line-items", "id").unwrap();
        assert!(matches!(
            engine.poll_event(),
            Some(EngineEvent::Open { request: r, .. }) if r == request
        ));
        assert!(engine.poll_event().is_none());

        assert_eq!(engine.store_names(connection).unwrap(), vec!["line-items"]);
        assert_eq!(engine.live_connections(), vec![connection]);
        engine.close(connection);
        assert!(engine.live_connections().is_empty());
    }

    #[test]
    fn create_store_outside_upgrade_fails() {
        let mut engine = ScriptedEngine::new();
        engine.open("orders", 1).unwrap();
        let connection = engine.script_open(1, 1).unwrap();
        engine.poll_event();

        assert!(matches!(
            engine.create_store(connection, "x", "id"),
            Err(EngineError::InvalidState(_))
        ));
    }

    #[test]
    fn rejection_applies_once() {
        let mut engine = ScriptedEngine::new();
        engine.reject_next(EngineError::data("nope"));
        assert!(engine.delete_database("orders").is_err());
        assert!(engine.delete_database("orders").is_ok());
    }
}
