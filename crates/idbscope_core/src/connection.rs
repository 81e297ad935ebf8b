//! Connection lifecycle state machine.
//!
//! The [`ConnectionController`] is the only owner of the live
//! [`ConnectionHandle`]. It issues open and delete requests, reacts to their
//! callbacks and to out-of-band connection events, and records every one of
//! them in the [`EventLog`] before anything else observes the change.

use crate::error::{CoreError, CoreResult, ErrorClass};
use crate::event_log::{EventKind, EventLog, EventOrigin, LifecycleEvent};
use crate::migrator::SchemaMigrator;
use crate::types::{ConnectionHandle, DatabaseIdentity};
use idbscope_engine::{
    ConnectionEvent, ConnectionId, DeleteOutcome, Engine, OpenOutcome, RequestId,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

/// Controller state.
///
/// `Closing`, `Blocked`, `VersionChangeRequested` and `Error` are passed
/// through while a command or callback is handled; between callbacks the
/// controller rests in `Closed`, `Opening` or `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    /// No connection is held or requested.
    Closed,
    /// An open request is in flight.
    Opening,
    /// A connection is held.
    Open,
    /// The held connection is being closed.
    Closing,
    /// An open or delete request is waiting for other connections.
    Blocked,
    /// Another party asked for the held connection to go away.
    VersionChangeRequested,
    /// The open request failed.
    Error,
}

impl ConnectionState {
    /// Returns the state name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Blocked => "blocked",
            Self::VersionChangeRequested => "version-change-requested",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct PendingOpen {
    request: RequestId,
    identity: DatabaseIdentity,
    upgrade: Option<ConnectionId>,
}

#[derive(Debug)]
struct PendingDelete {
    request: RequestId,
    name: String,
}

fn open_target(identity: &DatabaseIdentity) -> String {
    format!("IDBOpenDBRequest {identity}")
}

fn delete_target(name: &str) -> String {
    format!("IDBOpenDBRequest deleteDatabase({name})")
}

/// Owns the connection handle and drives its lifecycle.
#[derive(Debug)]
pub struct ConnectionController {
    state: ConnectionState,
    identity: Option<DatabaseIdentity>,
    handle: Option<ConnectionHandle>,
    pending_open: Option<PendingOpen>,
    last_open: Option<RequestId>,
    pending_deletes: Vec<PendingDelete>,
    migrator: SchemaMigrator,
}

impl ConnectionController {
    /// Creates a closed controller that runs `migrator` during upgrades.
    #[must_use]
    pub fn new(migrator: SchemaMigrator) -> Self {
        Self {
            state: ConnectionState::Closed,
            identity: None,
            handle: None,
            pending_open: None,
            last_open: None,
            pending_deletes: Vec::new(),
            migrator,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Identity of the most recent open request.
    #[must_use]
    pub fn identity(&self) -> Option<&DatabaseIdentity> {
        self.identity.as_ref()
    }

    /// The held connection, if any.
    #[must_use]
    pub fn handle(&self) -> Option<&ConnectionHandle> {
        self.handle.as_ref()
    }

    /// Id of the held connection, if any.
    #[must_use]
    pub fn handle_id(&self) -> Option<ConnectionId> {
        self.handle.as_ref().map(ConnectionHandle::id)
    }

    /// The open request the controller is waiting on, if any.
    #[must_use]
    pub fn pending_open(&self) -> Option<RequestId> {
        self.pending_open.as_ref().map(|p| p.request)
    }

    /// The schema migrator run during upgrades.
    #[must_use]
    pub fn migrator(&self) -> &SchemaMigrator {
        &self.migrator
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "connection state changed");
            self.state = next;
        }
    }

    /// Requests a connection to `identity`.
    ///
    /// A held connection is closed first, and a `close` event is recorded
    /// for it. A request still parked behind a `blocked` notification is
    /// superseded; its late results are discarded.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` while another open request is in flight, or
    /// the engine's rejection (also recorded as an `error` event).
    pub fn open<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        log: &EventLog,
        identity: DatabaseIdentity,
    ) -> CoreResult<RequestId> {
        if self.state == ConnectionState::Opening {
            return Err(CoreError::invalid_state(format!(
                "an open request for {} is already in flight",
                self.identity
                    .as_ref()
                    .map_or_else(String::new, ToString::to_string)
            )));
        }
        self.release_handle(engine, log);
        if let Some(superseded) = self.pending_open.take() {
            debug!(request = %superseded.request, "pending open superseded");
            if let Some(connection) = superseded.upgrade {
                engine.close(connection);
            }
        }

        self.identity = Some(identity.clone());
        match engine.open(identity.name(), identity.version()) {
            Ok(request) => {
                debug!(%request, %identity, "open issued");
                self.pending_open = Some(PendingOpen {
                    request,
                    identity,
                    upgrade: None,
                });
                self.last_open = Some(request);
                self.transition(ConnectionState::Opening);
                Ok(request)
            }
            Err(err) => {
                log.record(
                    LifecycleEvent::new(
                        EventKind::Error,
                        EventOrigin::Engine,
                        "DOMException",
                        open_target(&identity),
                    )
                    .with_detail(err.to_string())
                    .with_class(ErrorClass::Connection),
                );
                self.transition(ConnectionState::Closed);
                Err(err.into())
            }
        }
    }

    /// Requests deletion of database `name`.
    ///
    /// A held connection is closed first, and a `close` event is recorded
    /// for it.
    ///
    /// # Errors
    ///
    /// Returns the engine's rejection, also recorded as an `error` event.
    pub fn delete<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        log: &EventLog,
        name: &str,
    ) -> CoreResult<RequestId> {
        if self.release_handle(engine, log) {
            self.transition(ConnectionState::Closed);
        }
        match engine.delete_database(name) {
            Ok(request) => {
                debug!(%request, name, "delete issued");
                self.pending_deletes.push(PendingDelete {
                    request,
                    name: name.to_string(),
                });
                Ok(request)
            }
            Err(err) => {
                log.record(
                    LifecycleEvent::new(
                        EventKind::Error,
                        EventOrigin::Engine,
                        "DOMException",
                        delete_target(name),
                    )
                    .with_detail(err.to_string())
                    .with_class(ErrorClass::Connection),
                );
                Err(err.into())
            }
        }
    }

    /// Closes the held connection and records a synthetic `close` event.
    ///
    /// Returns false if no connection was held.
    fn release_handle<E: Engine + ?Sized>(&mut self, engine: &mut E, log: &EventLog) -> bool {
        let Some(handle) = self.handle.take() else {
            return false;
        };
        self.transition(ConnectionState::Closing);
        engine.unlisten(handle.id());
        engine.close(handle.id());
        log.record(LifecycleEvent::synthetic_close(handle.describe()));
        info!(connection = %handle.id(), identity = %handle.identity(), "connection released");
        true
    }

    /// Handles progress of an open request.
    pub fn handle_open_event<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        log: &EventLog,
        request: RequestId,
        outcome: OpenOutcome,
    ) {
        let current = self.pending_open.as_ref().map(|p| p.request) == Some(request);
        match outcome {
            OpenOutcome::UpgradeNeeded {
                connection,
                old_version,
                new_version,
            } => {
                if !current {
                    warn!(%request, %connection, "upgrade of a superseded open; closing it");
                    engine.close(connection);
                    return;
                }
                self.on_upgrade_needed(engine, log, connection, old_version, new_version);
            }
            OpenOutcome::Success {
                connection,
                version,
            } => {
                if !current {
                    warn!(%request, %connection, "success of a superseded open; closing it");
                    engine.close(connection);
                    return;
                }
                self.on_open_success(engine, log, connection, version);
            }
            OpenOutcome::Error(err) => {
                if !current {
                    warn!(%request, error = %err, "error of a superseded open discarded");
                    return;
                }
                let Some(pending) = self.pending_open.take() else {
                    return;
                };
                log.record(
                    LifecycleEvent::new(
                        EventKind::Error,
                        EventOrigin::Engine,
                        "Event",
                        open_target(&pending.identity),
                    )
                    .with_detail(err.to_string())
                    .with_class(ErrorClass::Connection),
                );
                warn!(identity = %pending.identity, error = %err, "open failed");
                self.transition(ConnectionState::Error);
                self.transition(ConnectionState::Closed);
            }
            OpenOutcome::Blocked {
                old_version,
                new_version,
            } => {
                if self.last_open != Some(request) {
                    warn!(%request, "blocked notice of a superseded open discarded");
                    return;
                }
                let target = self
                    .pending_open
                    .as_ref()
                    .map(|p| &p.identity)
                    .or(self.identity.as_ref())
                    .map_or_else(|| "IDBOpenDBRequest".to_string(), open_target);
                self.on_blocked(
                    engine,
                    log,
                    LifecycleEvent::new(
                        EventKind::Blocked,
                        EventOrigin::Engine,
                        "IDBVersionChangeEvent",
                        target,
                    )
                    .with_detail(format!("v{old_version} -> v{new_version}")),
                );
            }
        }
    }

    fn on_upgrade_needed<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        log: &EventLog,
        connection: ConnectionId,
        old_version: u64,
        new_version: u64,
    ) {
        let Some(pending) = self.pending_open.as_mut() else {
            return;
        };
        pending.upgrade = Some(connection);
        let identity = pending.identity.clone();
        log.record(
            LifecycleEvent::new(
                EventKind::UpgradeNeeded,
                EventOrigin::Engine,
                "IDBVersionChangeEvent",
                open_target(&identity),
            )
            .with_detail(format!("v{old_version} -> v{new_version}")),
        );
        self.transition(ConnectionState::Opening);

        match self.migrator.run(engine, connection) {
            Ok(report) => {
                info!(
                    %identity,
                    created = ?report.created,
                    existing = ?report.existing,
                    "schema migrated"
                );
            }
            Err(err) => {
                warn!(%identity, error = %err, "schema migration failed");
                log.record(
                    LifecycleEvent::new(
                        EventKind::Error,
                        EventOrigin::Engine,
                        "DOMException",
                        format!("IDBDatabase {identity}"),
                    )
                    .with_detail(err.to_string())
                    .with_class(ErrorClass::Connection),
                );
            }
        }
    }

    fn on_open_success<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        log: &EventLog,
        connection: ConnectionId,
        version: u64,
    ) {
        let Some(pending) = self.pending_open.take() else {
            return;
        };
        // A handle can only be held here if a delete raced the open.
        self.release_handle(engine, log);

        if let Err(err) = engine.listen(connection) {
            warn!(%connection, error = %err, "could not listen to the new connection");
        }
        let identity = pending.identity;
        log.record(
            LifecycleEvent::new(
                EventKind::Success,
                EventOrigin::Engine,
                "Event",
                open_target(&identity),
            )
            .with_detail(format!("opened at v{version}")),
        );
        info!(%connection, %identity, "connection established");
        self.handle = Some(ConnectionHandle::new(connection, identity.clone()));
        self.identity = Some(identity);
        self.transition(ConnectionState::Open);
    }

    fn on_blocked<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        log: &EventLog,
        event: LifecycleEvent,
    ) {
        log.record(event.with_class(ErrorClass::Blocked));
        self.transition(ConnectionState::Blocked);
        self.release_handle(engine, log);
        self.transition(ConnectionState::Closed);
    }

    /// Handles progress of a delete-database request.
    pub fn handle_delete_event<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        log: &EventLog,
        request: RequestId,
        outcome: DeleteOutcome,
    ) {
        let Some(index) = self.pending_deletes.iter().position(|d| d.request == request) else {
            warn!(%request, "result of an unknown delete request discarded");
            return;
        };
        let target = delete_target(&self.pending_deletes[index].name);
        match outcome {
            DeleteOutcome::Success { old_version } => {
                let pending = self.pending_deletes.remove(index);
                log.record(
                    LifecycleEvent::new(
                        EventKind::Success,
                        EventOrigin::Engine,
                        "IDBVersionChangeEvent",
                        target,
                    )
                    .with_detail(format!("deleted at v{old_version}")),
                );
                info!(name = %pending.name, old_version, "database deleted");
                self.release_handle(engine, log);
                if self.pending_open.is_none() {
                    self.transition(ConnectionState::Closed);
                }
            }
            DeleteOutcome::Error(err) => {
                let pending = self.pending_deletes.remove(index);
                warn!(name = %pending.name, error = %err, "delete failed");
                log.record(
                    LifecycleEvent::new(EventKind::Error, EventOrigin::Engine, "Event", target)
                        .with_detail(err.to_string())
                        .with_class(ErrorClass::Connection),
                );
            }
            DeleteOutcome::Blocked { old_version } => {
                log.record(
                    LifecycleEvent::new(
                        EventKind::Blocked,
                        EventOrigin::Engine,
                        "IDBVersionChangeEvent",
                        target,
                    )
                    .with_detail(format!("v{old_version} -> deleted"))
                    .with_class(ErrorClass::Blocked),
                );
                if self.release_handle(engine, log) {
                    self.transition(ConnectionState::Closed);
                }
            }
        }
    }

    /// Handles an event fired at a listened connection.
    pub fn handle_connection_event<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        log: &EventLog,
        connection: ConnectionId,
        event: ConnectionEvent,
    ) {
        let target = match &self.handle {
            Some(handle) if handle.id() == connection => handle.describe(),
            _ => {
                warn!(%connection, ?event, "event for a released connection discarded");
                return;
            }
        };
        match event {
            ConnectionEvent::VersionChange {
                old_version,
                new_version,
            } => {
                let requested =
                    new_version.map_or_else(|| "deleted".to_string(), |v| format!("v{v}"));
                log.record(
                    LifecycleEvent::new(
                        EventKind::VersionChange,
                        EventOrigin::Engine,
                        "IDBVersionChangeEvent",
                        target,
                    )
                    .with_detail(format!("v{old_version} -> {requested}"))
                    .with_class(ErrorClass::VersionConflict),
                );
                self.transition(ConnectionState::VersionChangeRequested);
                self.release_handle(engine, log);
                self.transition(ConnectionState::Closed);
            }
            ConnectionEvent::Close => {
                engine.unlisten(connection);
                self.handle = None;
                log.record(LifecycleEvent::new(
                    EventKind::Close,
                    EventOrigin::Engine,
                    "Event",
                    target,
                ));
                warn!(%connection, "connection closed by the engine");
                self.transition(ConnectionState::Closed);
            }
            ConnectionEvent::Abort { reason } => {
                log.record(
                    LifecycleEvent::new(EventKind::Abort, EventOrigin::Engine, "Event", target)
                        .with_detail(reason)
                        .with_class(ErrorClass::Transaction),
                );
            }
            ConnectionEvent::Error { reason } => {
                log.record(
                    LifecycleEvent::new(EventKind::Error, EventOrigin::Engine, "Event", target)
                        .with_detail(reason)
                        .with_class(ErrorClass::Transaction),
                );
            }
        }
    }
}
