//! The session: one engine, one controller, and the components around it.
//!
//! A [`Session`] is the single dispatcher of engine callbacks. Commands are
//! issued synchronously; their completions arrive through
//! [`Session::poll`] or [`Session::dispatch`] and are routed to the
//! component that issued them. Whenever the held connection changes, the
//! collection list is re-read and the projection starts over.

use crate::browser::StoreBrowser;
use crate::config::SessionConfig;
use crate::connection::{ConnectionController, ConnectionState};
use crate::coordinator::TransactionCoordinator;
use crate::error::{CoreError, CoreResult};
use crate::event_log::{EventLog, LifecycleEvent};
use crate::migrator::SchemaMigrator;
use crate::types::{CollectionName, ConnectionHandle, DatabaseIdentity, Record};
use idbscope_engine::{ConnectionId, Engine, EngineEvent, RequestId, TransactionId};
use serde::Serialize;
use tracing::{debug, warn};

/// Everything a presentation layer shows, at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    /// Controller state.
    pub state: ConnectionState,
    /// Identity of the most recent open request.
    pub identity: Option<DatabaseIdentity>,
    /// Collections of the held connection.
    pub collections: Vec<CollectionName>,
    /// Active collection.
    pub active_collection: Option<CollectionName>,
    /// Last committed contents of the active collection.
    pub projection: Vec<Record>,
    /// Number of events held by the log.
    pub event_count: usize,
    /// Sequence number of the latest event.
    pub last_sequence: u64,
}

/// An interactive session over an engine.
///
/// # Example
///
/// ```rust
/// use idbscope_core::{DatabaseIdentity, Record, Session, SessionConfig};
/// use idbscope_engine::InMemoryEngine;
///
/// let config = SessionConfig::new().collection("line-items");
/// let mut session = Session::with_config(InMemoryEngine::new(), config);
///
/// session.open(DatabaseIdentity::new("orders", 1).unwrap()).unwrap();
/// session.run_until_idle();
///
/// session.put(Record::new("a1").with_field("qty", 2)).unwrap();
/// session.run_until_idle();
///
/// assert_eq!(session.projection(), [Record::new("a1").with_field("qty", 2)]);
/// ```
pub struct Session<E: Engine> {
    engine: E,
    config: SessionConfig,
    log: EventLog,
    controller: ConnectionController,
    browser: StoreBrowser,
    coordinator: TransactionCoordinator,
    /// Last selected collection; reselected on the next connection if present.
    preferred: Option<CollectionName>,
}

impl<E: Engine> Session<E> {
    /// Creates a session with the default configuration.
    pub fn new(engine: E) -> Self {
        Self::with_config(engine, SessionConfig::default())
    }

    /// Creates a session with a custom configuration.
    pub fn with_config(engine: E, config: SessionConfig) -> Self {
        Self {
            engine,
            log: EventLog::with_max_events(config.max_events),
            controller: ConnectionController::new(SchemaMigrator::from_config(&config)),
            browser: StoreBrowser::new(),
            coordinator: TransactionCoordinator::new(config.key_path.clone()),
            preferred: None,
            config,
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Opens `identity`, closing the held connection first.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` while another open is in flight, or the
    /// engine's rejection.
    pub fn open(&mut self, identity: DatabaseIdentity) -> CoreResult<RequestId> {
        let before = self.controller.handle_id();
        let result = self.controller.open(&mut self.engine, &self.log, identity);
        self.sync_handle(before);
        result
    }

    /// Deletes database `name`, closing the held connection first.
    ///
    /// # Errors
    ///
    /// Returns the engine's rejection.
    pub fn delete(&mut self, name: &str) -> CoreResult<RequestId> {
        let before = self.controller.handle_id();
        let result = self.controller.delete(&mut self.engine, &self.log, name);
        self.sync_handle(before);
        result
    }

    /// Makes `name` the active collection and refreshes the projection.
    ///
    /// Selecting a different collection empties the projection first.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen` without a connection, `CollectionNotFound` for
    /// unknown names, or the engine's rejection of the refresh.
    pub fn select_collection(&mut self, name: &str) -> CoreResult<()> {
        let handle = self.controller.handle().ok_or(CoreError::NotOpen)?;
        if self.browser.select_active(name)? {
            self.coordinator.reset_projection();
        }
        self.preferred = Some(name.to_string());
        self.coordinator
            .refresh(&mut self.engine, &self.log, handle, name)
    }

    /// Writes `record` into the active collection.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen`, `NoActiveCollection`, or the engine's rejection.
    pub fn put(&mut self, record: Record) -> CoreResult<TransactionId> {
        let (handle, collection) = Self::target(&self.controller, &self.browser)?;
        self.coordinator
            .put(&mut self.engine, &self.log, handle, collection, &record)
    }

    /// Deletes the record stored under `id` in the active collection.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen`, `NoActiveCollection`, or the engine's rejection.
    pub fn delete_record(&mut self, id: &str) -> CoreResult<TransactionId> {
        let (handle, collection) = Self::target(&self.controller, &self.browser)?;
        self.coordinator
            .delete_record(&mut self.engine, &self.log, handle, collection, id)
    }

    /// Removes every record of the active collection.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen`, `NoActiveCollection`, or the engine's rejection.
    pub fn clear(&mut self) -> CoreResult<TransactionId> {
        let (handle, collection) = Self::target(&self.controller, &self.browser)?;
        self.coordinator
            .clear(&mut self.engine, &self.log, handle, collection)
    }

    /// Re-reads the active collection.
    ///
    /// # Errors
    ///
    /// Returns `NotOpen`, `NoActiveCollection`, or the engine's rejection.
    pub fn refresh(&mut self) -> CoreResult<()> {
        let (handle, collection) = Self::target(&self.controller, &self.browser)?;
        self.coordinator
            .refresh(&mut self.engine, &self.log, handle, collection)
    }

    /// Removes every event from the log.
    pub fn clear_event_log(&mut self) {
        self.log.clear();
    }

    fn target<'a>(
        controller: &'a ConnectionController,
        browser: &'a StoreBrowser,
    ) -> CoreResult<(&'a ConnectionHandle, &'a str)> {
        let handle = controller.handle().ok_or(CoreError::NotOpen)?;
        let collection = browser.active().ok_or(CoreError::NoActiveCollection)?;
        Ok((handle, collection))
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Routes one engine event to the component waiting for it.
    pub fn dispatch(&mut self, event: EngineEvent) {
        let before = self.controller.handle_id();
        match event {
            EngineEvent::Open { request, outcome } => {
                self.controller
                    .handle_open_event(&mut self.engine, &self.log, request, outcome);
            }
            EngineEvent::Delete { request, outcome } => {
                self.controller
                    .handle_delete_event(&mut self.engine, &self.log, request, outcome);
            }
            EngineEvent::Connection { connection, event } => {
                self.controller
                    .handle_connection_event(&mut self.engine, &self.log, connection, event);
            }
            EngineEvent::Request {
                request,
                transaction,
                result,
            } => {
                let handled = self.coordinator.handle_request(
                    &mut self.engine,
                    &self.log,
                    self.controller.handle(),
                    request,
                    transaction,
                    result,
                );
                if !handled {
                    debug!(%request, %transaction, "result of an unknown request ignored");
                }
            }
            EngineEvent::Transaction {
                transaction,
                outcome,
            } => {
                let handled = self.coordinator.handle_transaction(
                    &mut self.engine,
                    &self.log,
                    self.controller.handle(),
                    self.browser.active(),
                    transaction,
                    outcome,
                );
                if !handled {
                    debug!(%transaction, "outcome of an unknown transaction ignored");
                }
            }
        }
        self.sync_handle(before);
    }

    /// Handles the next engine event, if any.
    ///
    /// Returns false once the engine has nothing left to deliver.
    pub fn poll(&mut self) -> bool {
        match self.engine.poll_event() {
            Some(event) => {
                self.dispatch(event);
                true
            }
            None => false,
        }
    }

    /// Handles engine events until none is left; returns how many.
    pub fn run_until_idle(&mut self) -> usize {
        let mut handled = 0;
        while self.poll() {
            handled += 1;
        }
        handled
    }

    fn sync_handle(&mut self, before: Option<ConnectionId>) {
        if self.controller.handle_id() == before {
            return;
        }
        debug!(?before, after = ?self.controller.handle_id(), "connection handle changed");

        self.coordinator.reset();
        self.browser.reset();

        let Some(handle) = self.controller.handle() else {
            return;
        };
        if let Err(err) = self.browser.list_collections(&self.engine, handle) {
            warn!(error = %err, "could not list collections");
            return;
        }

        let selected = self
            .preferred
            .clone()
            .filter(|name| self.browser.contains(name))
            .or_else(|| {
                self.config
                    .auto_select
                    .then(|| self.browser.collections().first().cloned())
                    .flatten()
            });
        let Some(name) = selected else {
            return;
        };
        if let Err(err) = self.browser.select_active(&name) {
            warn!(collection = %name, error = %err, "could not select collection");
            return;
        }
        self.preferred = Some(name.clone());
        if let Err(err) = self
            .coordinator
            .refresh(&mut self.engine, &self.log, handle, &name)
        {
            warn!(collection = %name, error = %err, "initial refresh failed");
        }
    }

    // ========================================================================
    // Observables
    // ========================================================================

    /// The event log.
    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    /// A copy of every event held by the log.
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.log.events()
    }

    /// Controller state.
    pub fn state(&self) -> ConnectionState {
        self.controller.state()
    }

    /// Identity of the most recent open request.
    pub fn identity(&self) -> Option<&DatabaseIdentity> {
        self.controller.identity()
    }

    /// The held connection.
    pub fn handle(&self) -> Option<&ConnectionHandle> {
        self.controller.handle()
    }

    /// Collections of the held connection.
    pub fn collections(&self) -> &[CollectionName] {
        self.browser.collections()
    }

    /// The active collection.
    pub fn active_collection(&self) -> Option<&str> {
        self.browser.active()
    }

    /// Last committed contents of the active collection.
    pub fn projection(&self) -> &[Record] {
        self.coordinator.projection()
    }

    /// Returns true while a refresh is collecting results.
    pub fn is_refreshing(&self) -> bool {
        self.coordinator.is_refreshing()
    }

    /// Captures every observable at once.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state(),
            identity: self.identity().cloned(),
            collections: self.collections().to_vec(),
            active_collection: self.active_collection().map(str::to_owned),
            projection: self.projection().to_vec(),
            event_count: self.log.len(),
            last_sequence: self.log.latest_sequence(),
        }
    }

    /// The session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The engine.
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// The engine, mutably.
    ///
    /// Calls made through it bypass the session; their events are still
    /// delivered by [`Session::poll`].
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }
}

impl<E: Engine> std::fmt::Debug for Session<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("identity", &self.identity())
            .field("active_collection", &self.active_collection())
            .field("events", &self.log.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::{EventKind, EventOrigin};
    use idbscope_engine::InMemoryEngine;

    fn session() -> Session<InMemoryEngine> {
        let config = SessionConfig::new().collections(["line-items", "customers"]);
        Session::with_config(InMemoryEngine::new(), config)
    }

    fn open(session: &mut Session<InMemoryEngine>, name: &str, version: u64) {
        session
            .open(DatabaseIdentity::new(name, version).unwrap())
            .unwrap();
        session.run_until_idle();
    }

    #[test]
    fn open_lists_and_selects_first_collection() {
        let mut session = session();
        open(&mut session, "orders", 1);

        assert_eq!(session.state(), ConnectionState::Open);
        assert_eq!(session.collections(), ["customers", "line-items"]);
        assert_eq!(session.active_collection(), Some("customers"));
        assert!(session.projection().is_empty());
    }

    #[test]
    fn commands_need_a_connection_and_collection() {
        let mut session = session();
        assert!(matches!(session.put(Record::new("a1")), Err(CoreError::NotOpen)));
        assert!(matches!(
            session.select_collection("line-items"),
            Err(CoreError::NotOpen)
        ));

        let mut session = Session::with_config(
            InMemoryEngine::new(),
            SessionConfig::new().collection("line-items").auto_select(false),
        );
        open(&mut session, "orders", 1);
        assert!(matches!(
            session.clear(),
            Err(CoreError::NoActiveCollection)
        ));
    }

    #[test]
    fn put_then_switch_and_back() {
        let mut session = session();
        open(&mut session, "orders", 1);
        session.select_collection("line-items").unwrap();
        session.put(Record::new("a1").with_field("qty", 2)).unwrap();

        session.select_collection("customers").unwrap();
        assert!(session.projection().is_empty());
        session.select_collection("line-items").unwrap();
        session.run_until_idle();

        assert_eq!(
            session.projection(),
            [Record::new("a1").with_field("qty", 2)]
        );
    }

    #[test]
    fn reopen_keeps_active_collection() {
        let mut session = session();
        open(&mut session, "orders", 1);
        session.select_collection("line-items").unwrap();
        session.put(Record::new("a1")).unwrap();
        session.run_until_idle();

        open(&mut session, "orders", 1);
        assert_eq!(session.active_collection(), Some("line-items"));
        assert_eq!(session.projection(), [Record::new("a1")]);
    }

    #[test]
    fn versionchange_clears_observables() {
        let mut session = session();
        open(&mut session, "orders", 1);

        let mut peer = session.engine().peer();
        peer.open("orders", 2).unwrap();
        while peer.poll_event().is_some() {}
        session.run_until_idle();

        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(session.collections().is_empty());
        assert_eq!(session.active_collection(), None);
        let events = session.events();
        let close = events.last().unwrap();
        assert_eq!(close.kind, EventKind::Close);
        assert_eq!(close.origin, EventOrigin::Controller);
    }

    #[test]
    fn snapshot_serializes() {
        let mut session = session();
        open(&mut session, "orders", 1);
        session.put(Record::new("c1").with_field("name", "Ada")).unwrap();
        session.run_until_idle();

        let snapshot = session.snapshot();
        assert_eq!(snapshot.event_count, 2);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["state"], "open");
        assert_eq!(json["identity"]["name"], "orders");
        assert_eq!(json["projection"][0]["name"], "Ada");
    }

    #[test]
    fn clear_event_log_keeps_sequence() {
        let mut session = session();
        open(&mut session, "orders", 1);
        session.clear_event_log();
        assert!(session.events().is_empty());

        session.delete("orders").unwrap();
        session.run_until_idle();
        assert_eq!(session.events()[0].sequence, 3);
    }
}
