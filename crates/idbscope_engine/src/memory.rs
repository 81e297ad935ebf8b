//! In-memory engine for tests and the interactive shell.

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};
use crate::types::{
    ConnectionEvent, ConnectionId, DeleteOutcome, EngineEvent, OpenOutcome, RequestId,
    RequestOutput, StoreRequest, TransactionId, TransactionMode, TransactionOutcome,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};

type ClientId = u64;

#[derive(Debug)]
struct ObjectStore {
    key_path: String,
    records: BTreeMap<String, Value>,
}

#[derive(Debug, Default)]
struct DatabaseState {
    version: u64,
    stores: BTreeMap<String, ObjectStore>,
}

#[derive(Debug)]
struct ConnectionState {
    client: ClientId,
    database: String,
    version: u64,
    open: bool,
    listening: bool,
    upgrading: bool,
}

#[derive(Debug)]
struct TransactionState {
    client: ClientId,
    connection: ConnectionId,
    database: String,
    store: String,
    mode: TransactionMode,
    outstanding: usize,
    /// Copy-on-write view of the store; published on commit.
    staged: Option<BTreeMap<String, Value>>,
}

#[derive(Debug)]
struct PendingRequest {
    transaction: TransactionId,
    request: StoreRequest,
}

#[derive(Debug, Clone, Copy)]
enum VersionTarget {
    Open(u64),
    Delete,
}

/// An open or delete request waiting its turn on one database.
#[derive(Debug, Clone, Copy)]
struct VersionRequest {
    request: RequestId,
    client: ClientId,
    target: VersionTarget,
}

/// An open or delete request waiting for other connections to close.
#[derive(Debug)]
struct Parked {
    request: RequestId,
    client: ClientId,
    database: String,
    target: VersionTarget,
    /// Connections a `versionchange` for this request was delivered to.
    notified: Vec<ConnectionId>,
    blocked_sent: bool,
}

#[derive(Debug)]
struct PendingUpgrade {
    request: RequestId,
    connection: ConnectionId,
    database: String,
    old_version: u64,
    existed: bool,
    created: Vec<String>,
    delivered: bool,
}

#[derive(Debug, Default)]
struct ClientQueue {
    events: VecDeque<EngineEvent>,
    upgrades: Vec<PendingUpgrade>,
}

#[derive(Debug)]
enum Task {
    Open {
        request: RequestId,
        client: ClientId,
        database: String,
        version: u64,
    },
    Delete {
        request: RequestId,
        client: ClientId,
        database: String,
    },
    Resume {
        request: RequestId,
    },
    Execute {
        request: RequestId,
    },
    Settle {
        transaction: TransactionId,
    },
}

/// State shared by every client of one simulated browser profile.
#[derive(Debug, Default)]
struct World {
    next_id: u64,
    next_client: ClientId,
    databases: BTreeMap<String, DatabaseState>,
    connections: HashMap<ConnectionId, ConnectionState>,
    transactions: BTreeMap<TransactionId, TransactionState>,
    requests: HashMap<RequestId, PendingRequest>,
    parked: Vec<Parked>,
    /// Open and delete requests per database, in issue order. The front
    /// one is running; the rest wait for it to finish.
    version_queues: HashMap<String, VecDeque<VersionRequest>>,
    tasks: VecDeque<Task>,
    queues: HashMap<ClientId, ClientQueue>,
    fail_next: Option<String>,
}

/// A deterministic, single-threaded simulation of a browser key-value store.
///
/// The engine keeps every database in memory and models the callback
/// semantics a browser exposes: upgrade transactions, `versionchange`
/// notifications, `blocked` requests, transaction scheduling and
/// auto-commit. Work only happens inside [`Engine::poll_event`], one task at
/// a time, so tests get the same interleaving on every run.
///
/// Several clients (think browser tabs) can share one set of databases:
/// [`InMemoryEngine::peer`] returns a second client with its own event
/// queue.
///
/// # Example
///
/// ```rust
/// use idbscope_engine::{Engine, EngineEvent, InMemoryEngine, OpenOutcome};
///
/// let mut engine = InMemoryEngine::new();
/// let request = engine.open("orders", 1).unwrap();
///
/// let Some(EngineEvent::Open { outcome: OpenOutcome::UpgradeNeeded { connection, .. }, .. }) =
///     engine.poll_event()
/// else {
///     panic!("a new database is upgraded first");
/// };
/// engine.create_store(connection, "line-items", "id").unwrap();
///
/// assert!(matches!(
///     engine.poll_event(),
///     Some(EngineEvent::Open { request: r, outcome: OpenOutcome::Success { .. } }) if r == request
/// ));
/// ```
#[derive(Debug)]
pub struct InMemoryEngine {
    world: Arc<Mutex<World>>,
    client: ClientId,
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEngine {
    /// Creates an engine with no databases.
    #[must_use]
    pub fn new() -> Self {
        let mut world = World::default();
        let client = world.register_client();
        Self {
            world: Arc::new(Mutex::new(world)),
            client,
        }
    }

    /// Returns another client that shares this engine's databases.
    ///
    /// The peer has its own event queue; events for its connections and
    /// requests are only returned by its own `poll_event`.
    #[must_use]
    pub fn peer(&self) -> Self {
        let client = self.world.lock().register_client();
        Self {
            world: Arc::clone(&self.world),
            client,
        }
    }

    /// Makes the next store request executed by any client fail.
    ///
    /// The failure aborts the request's transaction, as an unhandled
    /// request error does in a browser.
    pub fn fail_next_request(&self, reason: impl Into<String>) {
        self.world.lock().fail_next = Some(reason.into());
    }

    /// Closes a connection from the engine side.
    ///
    /// Unlike [`Engine::close`], this fires a `Close` event at a listened
    /// connection and aborts its unfinished transactions.
    pub fn force_close(&self, connection: ConnectionId) {
        self.world.lock().force_close(connection);
    }

    /// Returns the stored version of a database, if it exists.
    #[must_use]
    pub fn database_version(&self, name: &str) -> Option<u64> {
        self.world.lock().databases.get(name).map(|db| db.version)
    }

    /// Returns the names and versions of every database.
    #[must_use]
    pub fn databases(&self) -> Vec<(String, u64)> {
        self.world
            .lock()
            .databases
            .iter()
            .map(|(name, db)| (name.clone(), db.version))
            .collect()
    }

    /// Returns the number of connections that are currently open.
    #[must_use]
    pub fn open_connection_count(&self) -> usize {
        self.world
            .lock()
            .connections
            .values()
            .filter(|c| c.open)
            .count()
    }
}

impl Engine for InMemoryEngine {
    fn open(&mut self, name: &str, version: u64) -> EngineResult<RequestId> {
        if version == 0 {
            return Err(EngineError::data("version must be a positive integer"));
        }
        let mut world = self.world.lock();
        let request = RequestId(world.next_id());
        world.tasks.push_back(Task::Open {
            request,
            client: self.client,
            database: name.to_string(),
            version,
        });
        debug!(%request, name, version, "open requested");
        Ok(request)
    }

    fn delete_database(&mut self, name: &str) -> EngineResult<RequestId> {
        let mut world = self.world.lock();
        let request = RequestId(world.next_id());
        world.tasks.push_back(Task::Delete {
            request,
            client: self.client,
            database: name.to_string(),
        });
        debug!(%request, name, "delete requested");
        Ok(request)
    }

    fn close(&mut self, connection: ConnectionId) {
        self.world.lock().close_connection(connection);
    }

    fn listen(&mut self, connection: ConnectionId) -> EngineResult<()> {
        let mut world = self.world.lock();
        let conn = world
            .connections
            .get_mut(&connection)
            .ok_or_else(|| EngineError::not_found(format!("unknown connection {connection}")))?;
        if !conn.open {
            return Err(EngineError::invalid_state("the connection is closed"));
        }
        conn.listening = true;
        Ok(())
    }

    fn unlisten(&mut self, connection: ConnectionId) {
        if let Some(conn) = self.world.lock().connections.get_mut(&connection) {
            conn.listening = false;
        }
    }

    fn store_names(&self, connection: ConnectionId) -> EngineResult<Vec<String>> {
        let world = self.world.lock();
        let conn = world
            .connections
            .get(&connection)
            .ok_or_else(|| EngineError::not_found(format!("unknown connection {connection}")))?;
        Ok(world
            .databases
            .get(&conn.database)
            .map(|db| db.stores.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn create_store(
        &mut self,
        connection: ConnectionId,
        name: &str,
        key_path: &str,
    ) -> EngineResult<()> {
        self.world.lock().create_store(connection, name, key_path)
    }

    fn transaction(
        &mut self,
        connection: ConnectionId,
        store: &str,
        mode: TransactionMode,
    ) -> EngineResult<TransactionId> {
        self.world.lock().begin_transaction(connection, store, mode)
    }

    fn request(
        &mut self,
        transaction: TransactionId,
        request: StoreRequest,
    ) -> EngineResult<RequestId> {
        self.world.lock().issue_request(transaction, request)
    }

    fn poll_event(&mut self) -> Option<EngineEvent> {
        let mut world = self.world.lock();
        world.finish_delivered_upgrades(self.client);
        loop {
            let next = world
                .queues
                .get_mut(&self.client)
                .and_then(|queue| queue.events.pop_front());
            if let Some(event) = next {
                if let EngineEvent::Open {
                    outcome: OpenOutcome::UpgradeNeeded { connection, .. },
                    ..
                } = &event
                {
                    world.mark_upgrade_delivered(self.client, *connection);
                }
                return Some(event);
            }
            let task = world.tasks.pop_front()?;
            world.run(task);
        }
    }
}

fn extract_key(value: &Value, key_path: &str) -> EngineResult<String> {
    value
        .get(key_path)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| {
            EngineError::data(format!("value has no string key at key path '{key_path}'"))
        })
}

impl World {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn register_client(&mut self) -> ClientId {
        let client = self.next_client;
        self.next_client += 1;
        self.queues.insert(client, ClientQueue::default());
        client
    }

    fn deliver(&mut self, client: ClientId, event: EngineEvent) {
        trace!(client, ?event, "event queued");
        self.queues.entry(client).or_default().events.push_back(event);
    }

    /// Returns false if nobody listens to `connection`.
    fn notify_connection(&mut self, connection: ConnectionId, event: ConnectionEvent) -> bool {
        let client = match self.connections.get(&connection) {
            Some(conn) if conn.listening => conn.client,
            _ => return false,
        };
        self.deliver(client, EngineEvent::Connection { connection, event });
        true
    }

    /// Open connections to `database`, in creation order.
    fn blockers(&self, database: &str) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.open && c.database == database)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    fn new_connection(
        &mut self,
        client: ClientId,
        database: &str,
        version: u64,
        upgrading: bool,
    ) -> ConnectionId {
        let connection = ConnectionId(self.next_id());
        self.connections.insert(
            connection,
            ConnectionState {
                client,
                database: database.to_string(),
                version,
                open: true,
                listening: false,
                upgrading,
            },
        );
        connection
    }

    fn run(&mut self, task: Task) {
        match task {
            Task::Open {
                request,
                client,
                database,
                version,
            } => self.enqueue(
                database,
                VersionRequest {
                    request,
                    client,
                    target: VersionTarget::Open(version),
                },
            ),
            Task::Delete {
                request,
                client,
                database,
            } => self.enqueue(
                database,
                VersionRequest {
                    request,
                    client,
                    target: VersionTarget::Delete,
                },
            ),
            Task::Resume { request } => self.resume(request),
            Task::Execute { request } => self.execute(request),
            Task::Settle { transaction } => self.settle(transaction),
        }
    }

    fn enqueue(&mut self, database: String, next: VersionRequest) {
        let queue = self.version_queues.entry(database.clone()).or_default();
        queue.push_back(next);
        if queue.len() == 1 {
            self.begin(database, next);
        } else {
            trace!(request = %next.request, %database, waiting = queue.len() - 1, "request queued");
        }
    }

    fn begin(&mut self, database: String, next: VersionRequest) {
        match next.target {
            VersionTarget::Open(version) => {
                self.begin_open(next.request, next.client, database, version);
            }
            VersionTarget::Delete => self.begin_delete(next.request, next.client, database),
        }
    }

    /// Retires the running request on `database` and starts the next one.
    fn finish_version_request(&mut self, database: &str) {
        let next = self.version_queues.get_mut(database).and_then(|queue| {
            queue.pop_front();
            queue.front().copied()
        });
        match next {
            Some(next) => self.begin(database.to_string(), next),
            None => {
                self.version_queues.remove(database);
            }
        }
    }

    fn begin_open(&mut self, request: RequestId, client: ClientId, database: String, version: u64) {
        let existing = self.databases.get(&database).map(|db| db.version);
        match existing {
            Some(current) if version <= current => {
                self.open_without_upgrade(request, client, &database, version, current);
            }
            _ => {
                let old_version = existing.unwrap_or(0);
                let notified = self.request_version_change(&database, Some(version));
                self.park(request, client, database, VersionTarget::Open(version), notified);
                trace!(%request, old_version, version, "upgrade parked");
            }
        }
    }

    fn open_without_upgrade(
        &mut self,
        request: RequestId,
        client: ClientId,
        database: &str,
        version: u64,
        current: u64,
    ) {
        let outcome = if version < current {
            OpenOutcome::Error(EngineError::Version {
                requested: version,
                existing: current,
            })
        } else {
            let connection = self.new_connection(client, database, version, false);
            OpenOutcome::Success {
                connection,
                version,
            }
        };
        self.deliver(client, EngineEvent::Open { request, outcome });
        self.finish_version_request(database);
    }

    fn begin_delete(&mut self, request: RequestId, client: ClientId, database: String) {
        if !self.databases.contains_key(&database) {
            self.deliver(
                client,
                EngineEvent::Delete {
                    request,
                    outcome: DeleteOutcome::Success { old_version: 0 },
                },
            );
            self.finish_version_request(&database);
            return;
        }
        let notified = self.request_version_change(&database, None);
        self.park(request, client, database, VersionTarget::Delete, notified);
    }

    /// Fires `versionchange` at open connections to `database`, skipping
    /// `already`; returns the connections it reached.
    fn request_version_change_except(
        &mut self,
        database: &str,
        new_version: Option<u64>,
        already: &[ConnectionId],
    ) -> Vec<ConnectionId> {
        let mut reached = Vec::new();
        for connection in self.blockers(database) {
            if already.contains(&connection) {
                continue;
            }
            let old_version = self.connections[&connection].version;
            let event = ConnectionEvent::VersionChange {
                old_version,
                new_version,
            };
            if self.notify_connection(connection, event) {
                reached.push(connection);
            }
        }
        reached
    }

    fn request_version_change(
        &mut self,
        database: &str,
        new_version: Option<u64>,
    ) -> Vec<ConnectionId> {
        self.request_version_change_except(database, new_version, &[])
    }

    fn park(
        &mut self,
        request: RequestId,
        client: ClientId,
        database: String,
        target: VersionTarget,
        notified: Vec<ConnectionId>,
    ) {
        self.parked.push(Parked {
            request,
            client,
            database,
            target,
            notified,
            blocked_sent: false,
        });
        self.tasks.push_back(Task::Resume { request });
    }

    fn resume_parked(&mut self, database: &str) {
        let waiting: Vec<RequestId> = self
            .parked
            .iter()
            .filter(|p| p.database == database)
            .map(|p| p.request)
            .collect();
        for request in waiting {
            self.tasks.push_back(Task::Resume { request });
        }
    }

    fn resume(&mut self, request: RequestId) {
        let Some(index) = self.parked.iter().position(|p| p.request == request) else {
            return;
        };
        let database = self.parked[index].database.clone();
        let old_version = self.databases.get(&database).map_or(0, |db| db.version);

        if !self.blockers(&database).is_empty() {
            // Connections that started listening after the request was
            // issued are asked to close before `blocked` is reported.
            let new_version = match self.parked[index].target {
                VersionTarget::Open(version) => Some(version),
                VersionTarget::Delete => None,
            };
            let already = std::mem::take(&mut self.parked[index].notified);
            let reached = self.request_version_change_except(&database, new_version, &already);
            let parked = &mut self.parked[index];
            parked.notified = already;
            if !reached.is_empty() {
                parked.notified.extend(reached);
                self.tasks.push_back(Task::Resume { request });
                return;
            }
            if parked.blocked_sent {
                return;
            }
            parked.blocked_sent = true;
            let client = parked.client;
            let event = match parked.target {
                VersionTarget::Open(new_version) => EngineEvent::Open {
                    request,
                    outcome: OpenOutcome::Blocked {
                        old_version,
                        new_version,
                    },
                },
                VersionTarget::Delete => EngineEvent::Delete {
                    request,
                    outcome: DeleteOutcome::Blocked { old_version },
                },
            };
            self.deliver(client, event);
            return;
        }

        let parked = self.parked.remove(index);
        match parked.target {
            VersionTarget::Open(version) => {
                self.start_upgrade(parked.request, parked.client, parked.database, version);
            }
            VersionTarget::Delete => {
                self.databases.remove(&parked.database);
                debug!(database = %parked.database, old_version, "database deleted");
                self.deliver(
                    parked.client,
                    EngineEvent::Delete {
                        request,
                        outcome: DeleteOutcome::Success { old_version },
                    },
                );
                self.finish_version_request(&parked.database);
            }
        }
    }

    fn start_upgrade(&mut self, request: RequestId, client: ClientId, database: String, version: u64) {
        let existing = self.databases.get(&database).map(|db| db.version);
        if let Some(current) = existing {
            if version <= current {
                self.open_without_upgrade(request, client, &database, version, current);
                return;
            }
        }
        let old_version = existing.unwrap_or(0);
        self.databases.entry(database.clone()).or_default().version = version;
        let connection = self.new_connection(client, &database, version, true);
        debug!(%connection, %database, old_version, version, "upgrade started");

        let queue = self.queues.entry(client).or_default();
        queue.events.push_back(EngineEvent::Open {
            request,
            outcome: OpenOutcome::UpgradeNeeded {
                connection,
                old_version,
                new_version: version,
            },
        });
        queue.upgrades.push(PendingUpgrade {
            request,
            connection,
            database,
            old_version,
            existed: existing.is_some(),
            created: Vec::new(),
            delivered: false,
        });
    }

    fn mark_upgrade_delivered(&mut self, client: ClientId, connection: ConnectionId) {
        if let Some(queue) = self.queues.get_mut(&client) {
            for upgrade in &mut queue.upgrades {
                if upgrade.connection == connection {
                    upgrade.delivered = true;
                }
            }
        }
    }

    /// Ends every upgrade whose `UpgradeNeeded` event the client has handled.
    fn finish_delivered_upgrades(&mut self, client: ClientId) {
        let finished: Vec<PendingUpgrade> = match self.queues.get_mut(&client) {
            Some(queue) if queue.upgrades.iter().any(|u| u.delivered) => {
                let (done, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut queue.upgrades)
                    .into_iter()
                    .partition(|u| u.delivered);
                queue.upgrades = pending;
                done
            }
            _ => return,
        };
        for upgrade in finished {
            self.finish_upgrade(client, upgrade);
        }
    }

    fn finish_upgrade(&mut self, client: ClientId, upgrade: PendingUpgrade) {
        let (open, version) = match self.connections.get_mut(&upgrade.connection) {
            Some(conn) => {
                conn.upgrading = false;
                (conn.open, conn.version)
            }
            None => (false, 0),
        };

        let outcome = if open {
            OpenOutcome::Success {
                connection: upgrade.connection,
                version,
            }
        } else {
            if !upgrade.existed {
                self.databases.remove(&upgrade.database);
            } else if let Some(db) = self.databases.get_mut(&upgrade.database) {
                db.version = upgrade.old_version;
                for name in &upgrade.created {
                    db.stores.remove(name);
                }
            }
            debug!(connection = %upgrade.connection, "upgrade rolled back");
            self.resume_parked(&upgrade.database);
            OpenOutcome::Error(EngineError::Abort(
                "the version change transaction was aborted".into(),
            ))
        };

        self.queues
            .entry(client)
            .or_default()
            .events
            .push_front(EngineEvent::Open {
                request: upgrade.request,
                outcome,
            });
        self.finish_version_request(&upgrade.database);
    }

    fn create_store(
        &mut self,
        connection: ConnectionId,
        name: &str,
        key_path: &str,
    ) -> EngineResult<()> {
        let conn = self
            .connections
            .get(&connection)
            .ok_or_else(|| EngineError::not_found(format!("unknown connection {connection}")))?;
        if !conn.upgrading {
            return Err(EngineError::invalid_state(
                "stores can only be created during a version change transaction",
            ));
        }
        let (client, database) = (conn.client, conn.database.clone());
        let db = self.databases.entry(database).or_default();
        if db.stores.contains_key(name) {
            return Err(EngineError::Constraint(format!(
                "object store '{name}' already exists"
            )));
        }
        db.stores.insert(
            name.to_string(),
            ObjectStore {
                key_path: key_path.to_string(),
                records: BTreeMap::new(),
            },
        );
        if let Some(upgrade) = self
            .queues
            .get_mut(&client)
            .and_then(|q| q.upgrades.iter_mut().find(|u| u.connection == connection))
        {
            upgrade.created.push(name.to_string());
        }
        debug!(%connection, store = name, key_path, "store created");
        Ok(())
    }

    fn close_connection(&mut self, connection: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&connection) else {
            return;
        };
        if !conn.open {
            return;
        }
        conn.open = false;
        conn.listening = false;
        let database = conn.database.clone();
        debug!(%connection, %database, "connection closed");
        self.resume_parked(&database);
    }

    fn force_close(&mut self, connection: ConnectionId) {
        let database = match self.connections.get(&connection) {
            Some(conn) if conn.open => conn.database.clone(),
            _ => return,
        };
        let running: Vec<TransactionId> = self
            .transactions
            .iter()
            .filter(|(_, t)| t.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for transaction in running {
            self.abort_transaction(transaction, "the connection was closed".into());
        }
        self.notify_connection(connection, ConnectionEvent::Close);
        if let Some(conn) = self.connections.get_mut(&connection) {
            conn.open = false;
            conn.listening = false;
        }
        debug!(%connection, %database, "connection force-closed");
        self.resume_parked(&database);
    }

    fn begin_transaction(
        &mut self,
        connection: ConnectionId,
        store: &str,
        mode: TransactionMode,
    ) -> EngineResult<TransactionId> {
        let conn = self
            .connections
            .get(&connection)
            .ok_or_else(|| EngineError::not_found(format!("unknown connection {connection}")))?;
        if !conn.open {
            return Err(EngineError::invalid_state("the connection is closed"));
        }
        if conn.upgrading {
            return Err(EngineError::invalid_state(
                "a version change transaction is running",
            ));
        }
        let has_store = self
            .databases
            .get(&conn.database)
            .is_some_and(|db| db.stores.contains_key(store));
        if !has_store {
            return Err(EngineError::not_found(format!(
                "object store '{store}' not found"
            )));
        }
        let state = TransactionState {
            client: conn.client,
            connection,
            database: conn.database.clone(),
            store: store.to_string(),
            mode,
            outstanding: 0,
            staged: None,
        };
        let transaction = TransactionId(self.next_id());
        self.transactions.insert(transaction, state);
        self.tasks.push_back(Task::Settle { transaction });
        trace!(%transaction, store, mode = mode.as_str(), "transaction started");
        Ok(transaction)
    }

    fn issue_request(
        &mut self,
        transaction: TransactionId,
        request: StoreRequest,
    ) -> EngineResult<RequestId> {
        let tx = self.transactions.get(&transaction).ok_or_else(|| {
            EngineError::TransactionInactive(format!("{transaction} has finished"))
        })?;
        if request.is_write() && tx.mode == TransactionMode::ReadOnly {
            return Err(EngineError::ReadOnly {
                store: tx.store.clone(),
            });
        }
        if let StoreRequest::Put(value) = &request {
            let key_path = self
                .databases
                .get(&tx.database)
                .and_then(|db| db.stores.get(&tx.store))
                .map(|s| s.key_path.as_str())
                .ok_or_else(|| EngineError::not_found(format!("object store '{}' not found", tx.store)))?;
            extract_key(value, key_path)?;
        }

        let id = RequestId(self.next_id());
        if let Some(tx) = self.transactions.get_mut(&transaction) {
            tx.outstanding += 1;
        }
        trace!(request = %id, %transaction, op = request.name(), "request issued");
        self.requests.insert(id, PendingRequest { transaction, request });
        self.tasks.push_back(Task::Execute { request: id });
        Ok(id)
    }

    /// True if an older unfinished transaction overlaps `transaction` and
    /// either side writes.
    fn must_wait(&self, transaction: TransactionId) -> bool {
        let Some(tx) = self.transactions.get(&transaction) else {
            return false;
        };
        self.transactions.range(..transaction).any(|(_, older)| {
            older.database == tx.database
                && older.store == tx.store
                && (older.mode == TransactionMode::ReadWrite
                    || tx.mode == TransactionMode::ReadWrite)
        })
    }

    fn execute(&mut self, request: RequestId) {
        let Some(transaction) = self.requests.get(&request).map(|p| p.transaction) else {
            return;
        };
        if self.must_wait(transaction) {
            self.tasks.push_back(Task::Execute { request });
            return;
        }
        let (Some(pending), Some(client)) = (
            self.requests.remove(&request),
            self.transactions.get(&transaction).map(|t| t.client),
        ) else {
            return;
        };

        let result = match self.fail_next.take() {
            Some(reason) => Err(EngineError::Unknown(reason)),
            None => self.apply(transaction, pending.request),
        };
        match result {
            Ok(output) => {
                self.deliver(
                    client,
                    EngineEvent::Request {
                        request,
                        transaction,
                        result: Ok(output),
                    },
                );
                if let Some(tx) = self.transactions.get_mut(&transaction) {
                    tx.outstanding = tx.outstanding.saturating_sub(1);
                }
                self.tasks.push_back(Task::Settle { transaction });
            }
            Err(error) => {
                let reason = error.to_string();
                self.deliver(
                    client,
                    EngineEvent::Request {
                        request,
                        transaction,
                        result: Err(error),
                    },
                );
                self.abort_transaction(transaction, reason);
            }
        }
    }

    fn apply(
        &mut self,
        transaction: TransactionId,
        request: StoreRequest,
    ) -> EngineResult<RequestOutput> {
        let World {
            transactions,
            databases,
            ..
        } = self;
        let tx = transactions
            .get_mut(&transaction)
            .ok_or_else(|| EngineError::TransactionInactive(format!("{transaction} has finished")))?;
        let store = databases
            .get(&tx.database)
            .and_then(|db| db.stores.get(&tx.store))
            .ok_or_else(|| EngineError::not_found(format!("object store '{}' not found", tx.store)))?;

        let output = match request {
            StoreRequest::Put(value) => {
                let key = extract_key(&value, &store.key_path)?;
                tx.staged
                    .get_or_insert_with(|| store.records.clone())
                    .insert(key.clone(), value);
                RequestOutput::Key(key)
            }
            StoreRequest::Get(key) => {
                let view = tx.staged.as_ref().unwrap_or(&store.records);
                RequestOutput::Value(view.get(&key).cloned())
            }
            StoreRequest::GetAllKeys => {
                let view = tx.staged.as_ref().unwrap_or(&store.records);
                RequestOutput::Keys(view.keys().cloned().collect())
            }
            StoreRequest::Delete(key) => {
                tx.staged
                    .get_or_insert_with(|| store.records.clone())
                    .remove(&key);
                RequestOutput::Done
            }
            StoreRequest::Clear => {
                tx.staged.get_or_insert_with(BTreeMap::new).clear();
                RequestOutput::Done
            }
        };
        Ok(output)
    }

    fn settle(&mut self, transaction: TransactionId) {
        match self.transactions.get(&transaction) {
            Some(tx) if tx.outstanding == 0 => {}
            _ => return,
        }
        let Some(tx) = self.transactions.remove(&transaction) else {
            return;
        };
        if let Some(staged) = tx.staged {
            if let Some(store) = self
                .databases
                .get_mut(&tx.database)
                .and_then(|db| db.stores.get_mut(&tx.store))
            {
                store.records = staged;
            }
        }
        trace!(%transaction, "transaction committed");
        self.deliver(
            tx.client,
            EngineEvent::Transaction {
                transaction,
                outcome: TransactionOutcome::Complete,
            },
        );
    }

    fn abort_transaction(&mut self, transaction: TransactionId, reason: String) {
        let Some(tx) = self.transactions.remove(&transaction) else {
            return;
        };
        let mut cancelled: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|(_, p)| p.transaction == transaction)
            .map(|(id, _)| *id)
            .collect();
        cancelled.sort();
        for request in cancelled {
            self.requests.remove(&request);
            self.deliver(
                tx.client,
                EngineEvent::Request {
                    request,
                    transaction,
                    result: Err(EngineError::Abort("the transaction was aborted".into())),
                },
            );
        }
        debug!(%transaction, %reason, "transaction aborted");
        self.notify_connection(
            tx.connection,
            ConnectionEvent::Error {
                reason: reason.clone(),
            },
        );
        self.deliver(
            tx.client,
            EngineEvent::Transaction {
                transaction,
                outcome: TransactionOutcome::Abort {
                    reason: reason.clone(),
                },
            },
        );
        self.notify_connection(tx.connection, ConnectionEvent::Abort { reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(engine: &mut InMemoryEngine) -> Vec<EngineEvent> {
        std::iter::from_fn(|| engine.poll_event()).collect()
    }

    /// Opens `name` at `version`, creating `stores` during the upgrade.
    fn open_with_stores(engine: &mut InMemoryEngine, name: &str, version: u64, stores: &[&str]) -> ConnectionId {
        let request = engine.open(name, version).unwrap();
        loop {
            match engine.poll_event().expect("open must finish") {
                EngineEvent::Open {
                    request: r,
                    outcome: OpenOutcome::UpgradeNeeded { connection, .. },
                } if r == request => {
                    for store in stores {
                        engine.create_store(connection, store, "id").unwrap();
                    }
                }
                EngineEvent::Open {
                    request: r,
                    outcome: OpenOutcome::Success { connection, .. },
                } if r == request => return connection,
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    fn run_request(
        engine: &mut InMemoryEngine,
        connection: ConnectionId,
        mode: TransactionMode,
        request: StoreRequest,
    ) -> RequestOutput {
        let tx = engine.transaction(connection, "items", mode).unwrap();
        engine.request(tx, request).unwrap();
        let events = drain(engine);
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::Transaction { transaction, outcome: TransactionOutcome::Complete } if *transaction == tx
        )));
        events
            .into_iter()
            .find_map(|e| match e {
                EngineEvent::Request { result, .. } => Some(result.unwrap()),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn new_database_fires_upgrade_then_success() {
        let mut engine = InMemoryEngine::new();
        let request = engine.open("orders", 1).unwrap();
        let events = drain(&mut engine);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            EngineEvent::Open { outcome: OpenOutcome::UpgradeNeeded { old_version: 0, new_version: 1, .. }, .. }
        ));
        assert!(matches!(
            events[1],
            EngineEvent::Open { request: r, outcome: OpenOutcome::Success { version: 1, .. } } if r == request
        ));
        assert_eq!(engine.database_version("orders"), Some(1));
    }

    #[test]
    fn same_version_opens_without_upgrade() {
        let mut engine = InMemoryEngine::new();
        let first = open_with_stores(&mut engine, "orders", 1, &["items"]);
        engine.close(first);

        engine.open("orders", 1).unwrap();
        let events = drain(&mut engine);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], EngineEvent::Open { outcome: OpenOutcome::Success { .. }, .. }));
    }

    #[test]
    fn lower_version_is_rejected() {
        let mut engine = InMemoryEngine::new();
        let conn = open_with_stores(&mut engine, "orders", 3, &[]);
        engine.close(conn);

        engine.open("orders", 2).unwrap();
        let events = drain(&mut engine);
        assert!(matches!(
            &events[0],
            EngineEvent::Open { outcome: OpenOutcome::Error(EngineError::Version { requested: 2, existing: 3 }), .. }
        ));
    }

    #[test]
    fn zero_version_fails_synchronously() {
        let mut engine = InMemoryEngine::new();
        assert!(matches!(engine.open("orders", 0), Err(EngineError::Data(_))));
    }

    #[test]
    fn create_store_outside_upgrade_is_rejected() {
        let mut engine = InMemoryEngine::new();
        let conn = open_with_stores(&mut engine, "orders", 1, &["items"]);
        let result = engine.create_store(conn, "other", "id");
        assert!(matches!(result, Err(EngineError::InvalidState(_))));
        assert_eq!(engine.store_names(conn).unwrap(), vec!["items".to_string()]);
    }

    #[test]
    fn duplicate_store_is_a_constraint_error() {
        let mut engine = InMemoryEngine::new();
        engine.open("orders", 1).unwrap();
        let Some(EngineEvent::Open { outcome: OpenOutcome::UpgradeNeeded { connection, .. }, .. }) =
            engine.poll_event()
        else {
            panic!("expected upgrade");
        };
        engine.create_store(connection, "items", "id").unwrap();
        assert!(matches!(
            engine.create_store(connection, "items", "id"),
            Err(EngineError::Constraint(_))
        ));
    }

    #[test]
    fn closing_inside_upgrade_rolls_back() {
        let mut engine = InMemoryEngine::new();
        engine.open("orders", 1).unwrap();
        let Some(EngineEvent::Open { outcome: OpenOutcome::UpgradeNeeded { connection, .. }, .. }) =
            engine.poll_event()
        else {
            panic!("expected upgrade");
        };
        engine.create_store(connection, "items", "id").unwrap();
        engine.close(connection);

        let events = drain(&mut engine);
        assert!(matches!(
            &events[0],
            EngineEvent::Open { outcome: OpenOutcome::Error(EngineError::Abort(_)), .. }
        ));
        assert_eq!(engine.database_version("orders"), None);
    }

    #[test]
    fn put_is_visible_after_commit() {
        let mut engine = InMemoryEngine::new();
        let conn = open_with_stores(&mut engine, "orders", 1, &["items"]);

        let out = run_request(
            &mut engine,
            conn,
            TransactionMode::ReadWrite,
            StoreRequest::Put(json!({"id": "a1", "qty": 2})),
        );
        assert_eq!(out, RequestOutput::Key("a1".into()));

        let out = run_request(&mut engine, conn, TransactionMode::ReadOnly, StoreRequest::Get("a1".into()));
        assert_eq!(out, RequestOutput::Value(Some(json!({"id": "a1", "qty": 2}))));
    }

    #[test]
    fn get_all_keys_is_sorted() {
        let mut engine = InMemoryEngine::new();
        let conn = open_with_stores(&mut engine, "orders", 1, &["items"]);
        for id in ["c", "a", "b"] {
            run_request(&mut engine, conn, TransactionMode::ReadWrite, StoreRequest::Put(json!({"id": id})));
        }
        let out = run_request(&mut engine, conn, TransactionMode::ReadOnly, StoreRequest::GetAllKeys);
        assert_eq!(out, RequestOutput::Keys(vec!["a".into(), "b".into(), "c".into()]));

        run_request(&mut engine, conn, TransactionMode::ReadWrite, StoreRequest::Clear);
        let out = run_request(&mut engine, conn, TransactionMode::ReadOnly, StoreRequest::GetAllKeys);
        assert_eq!(out, RequestOutput::Keys(vec![]));
    }

    #[test]
    fn read_waits_for_older_write() {
        let mut engine = InMemoryEngine::new();
        let conn = open_with_stores(&mut engine, "orders", 1, &["items"]);

        let write = engine.transaction(conn, "items", TransactionMode::ReadWrite).unwrap();
        engine.request(write, StoreRequest::Put(json!({"id": "a1"}))).unwrap();
        let read = engine.transaction(conn, "items", TransactionMode::ReadOnly).unwrap();
        engine.request(read, StoreRequest::GetAllKeys).unwrap();

        let keys = drain(&mut engine)
            .into_iter()
            .find_map(|e| match e {
                EngineEvent::Request { transaction, result: Ok(RequestOutput::Keys(keys)), .. }
                    if transaction == read => Some(keys),
                _ => None,
            })
            .unwrap();
        assert_eq!(keys, vec!["a1".to_string()]);
    }

    #[test]
    fn write_in_readonly_transaction_is_rejected() {
        let mut engine = InMemoryEngine::new();
        let conn = open_with_stores(&mut engine, "orders", 1, &["items"]);
        let tx = engine.transaction(conn, "items", TransactionMode::ReadOnly).unwrap();
        assert!(matches!(
            engine.request(tx, StoreRequest::Clear),
            Err(EngineError::ReadOnly { .. })
        ));
    }

    #[test]
    fn put_without_key_is_a_data_error() {
        let mut engine = InMemoryEngine::new();
        let conn = open_with_stores(&mut engine, "orders", 1, &["items"]);
        let tx = engine.transaction(conn, "items", TransactionMode::ReadWrite).unwrap();
        assert!(matches!(
            engine.request(tx, StoreRequest::Put(json!({"qty": 1}))),
            Err(EngineError::Data(_))
        ));
    }

    #[test]
    fn unknown_store_is_not_found() {
        let mut engine = InMemoryEngine::new();
        let conn = open_with_stores(&mut engine, "orders", 1, &["items"]);
        assert!(matches!(
            engine.transaction(conn, "missing", TransactionMode::ReadOnly),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn failed_request_aborts_and_bubbles() {
        let mut engine = InMemoryEngine::new();
        let conn = open_with_stores(&mut engine, "orders", 1, &["items"]);
        engine.listen(conn).unwrap();

        engine.fail_next_request("disk full");
        let tx = engine.transaction(conn, "items", TransactionMode::ReadWrite).unwrap();
        engine.request(tx, StoreRequest::Put(json!({"id": "a1"}))).unwrap();
        let events = drain(&mut engine);

        assert!(matches!(&events[0], EngineEvent::Request { result: Err(EngineError::Unknown(_)), .. }));
        assert!(matches!(&events[1], EngineEvent::Connection { event: ConnectionEvent::Error { .. }, .. }));
        assert!(matches!(&events[2], EngineEvent::Transaction { outcome: TransactionOutcome::Abort { .. }, .. }));
        assert!(matches!(&events[3], EngineEvent::Connection { event: ConnectionEvent::Abort { .. }, .. }));

        let out = run_request(&mut engine, conn, TransactionMode::ReadOnly, StoreRequest::GetAllKeys);
        assert_eq!(out, RequestOutput::Keys(vec![]));
    }

    #[test]
    fn upgrade_is_blocked_by_peer_until_it_closes() {
        let mut engine = InMemoryEngine::new();
        let mut peer = engine.peer();
        let held = open_with_stores(&mut peer, "orders", 1, &["items"]);
        peer.listen(held).unwrap();

        let request = engine.open("orders", 2).unwrap();
        let events = drain(&mut engine);
        assert_eq!(
            events,
            vec![EngineEvent::Open {
                request,
                outcome: OpenOutcome::Blocked { old_version: 1, new_version: 2 },
            }]
        );
        assert_eq!(
            drain(&mut peer),
            vec![EngineEvent::Connection {
                connection: held,
                event: ConnectionEvent::VersionChange { old_version: 1, new_version: Some(2) },
            }]
        );

        peer.close(held);
        let events = drain(&mut engine);
        assert!(matches!(events[0], EngineEvent::Open { outcome: OpenOutcome::UpgradeNeeded { old_version: 1, new_version: 2, .. }, .. }));
        assert!(matches!(events[1], EngineEvent::Open { outcome: OpenOutcome::Success { version: 2, .. }, .. }));
    }

    #[test]
    fn delete_database_removes_it() {
        let mut engine = InMemoryEngine::new();
        let conn = open_with_stores(&mut engine, "orders", 4, &["items"]);
        engine.close(conn);

        let request = engine.delete_database("orders").unwrap();
        assert_eq!(
            drain(&mut engine),
            vec![EngineEvent::Delete { request, outcome: DeleteOutcome::Success { old_version: 4 } }]
        );
        assert!(engine.databases().is_empty());
    }

    #[test]
    fn delete_waits_for_an_earlier_open() {
        let mut engine = InMemoryEngine::new();
        engine.open("orders", 1).unwrap();
        let delete = engine.delete_database("orders").unwrap();

        let events = drain(&mut engine);
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], EngineEvent::Open { outcome: OpenOutcome::UpgradeNeeded { .. }, .. }));
        let EngineEvent::Open { outcome: OpenOutcome::Success { connection, .. }, .. } = events[1] else {
            panic!("open must succeed before the delete runs: {events:?}");
        };
        assert_eq!(
            events[2],
            EngineEvent::Delete { request: delete, outcome: DeleteOutcome::Blocked { old_version: 1 } }
        );

        engine.close(connection);
        assert_eq!(
            drain(&mut engine),
            vec![EngineEvent::Delete { request: delete, outcome: DeleteOutcome::Success { old_version: 1 } }]
        );
        assert!(engine.databases().is_empty());
    }

    #[test]
    fn open_waits_for_a_parked_delete() {
        let mut engine = InMemoryEngine::new();
        let conn = open_with_stores(&mut engine, "orders", 1, &["items"]);
        engine.listen(conn).unwrap();

        let delete = engine.delete_database("orders").unwrap();
        let open = engine.open("orders", 1).unwrap();
        assert_eq!(
            drain(&mut engine),
            vec![
                EngineEvent::Connection {
                    connection: conn,
                    event: ConnectionEvent::VersionChange { old_version: 1, new_version: None },
                },
                EngineEvent::Delete { request: delete, outcome: DeleteOutcome::Blocked { old_version: 1 } },
            ]
        );

        engine.close(conn);
        let events = drain(&mut engine);
        assert_eq!(
            events[0],
            EngineEvent::Delete { request: delete, outcome: DeleteOutcome::Success { old_version: 1 } }
        );
        assert!(matches!(
            events[1],
            EngineEvent::Open { request: r, outcome: OpenOutcome::UpgradeNeeded { old_version: 0, new_version: 1, .. } } if r == open
        ));
        assert!(matches!(
            events[2],
            EngineEvent::Open { request: r, outcome: OpenOutcome::Success { .. } } if r == open
        ));
        assert_eq!(engine.database_version("orders"), Some(1));
    }

    #[test]
    fn late_listener_is_asked_to_close_before_blocked() {
        let mut engine = InMemoryEngine::new();
        engine.open("orders", 1).unwrap();
        let delete = engine.delete_database("orders").unwrap();

        // The delete is queued behind the open; the new connection starts
        // listening before the delete gets to run.
        let upgrade = engine.poll_event();
        assert!(matches!(upgrade, Some(EngineEvent::Open { outcome: OpenOutcome::UpgradeNeeded { .. }, .. })));
        let Some(EngineEvent::Open { outcome: OpenOutcome::Success { connection, .. }, .. }) = engine.poll_event() else {
            panic!("open must succeed first");
        };
        engine.listen(connection).unwrap();

        assert_eq!(
            engine.poll_event(),
            Some(EngineEvent::Connection {
                connection,
                event: ConnectionEvent::VersionChange { old_version: 1, new_version: None },
            })
        );
        engine.close(connection);
        assert_eq!(
            drain(&mut engine),
            vec![EngineEvent::Delete { request: delete, outcome: DeleteOutcome::Success { old_version: 1 } }]
        );
    }

    #[test]
    fn force_close_fires_close_on_listened_connection() {
        let mut engine = InMemoryEngine::new();
        let conn = open_with_stores(&mut engine, "orders", 1, &["items"]);
        engine.listen(conn).unwrap();

        engine.force_close(conn);
        assert_eq!(
            drain(&mut engine),
            vec![EngineEvent::Connection { connection: conn, event: ConnectionEvent::Close }]
        );
        assert_eq!(engine.open_connection_count(), 0);
    }

    #[test]
    fn local_close_fires_nothing() {
        let mut engine = InMemoryEngine::new();
        let conn = open_with_stores(&mut engine, "orders", 1, &["items"]);
        engine.listen(conn).unwrap();
        engine.close(conn);
        assert!(drain(&mut engine).is_empty());
        assert!(matches!(engine.listen(conn), Err(EngineError::InvalidState(_))));
    }
}
