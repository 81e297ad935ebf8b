//! Test fixtures and session helpers.
//!
//! Provides ready-made sessions over both engines and the sample records
//! used across the scenario tests.

use crate::scripted::ScriptedEngine;
use idbscope_core::{DatabaseIdentity, Record, Session, SessionConfig};
use idbscope_engine::{ConnectionId, InMemoryEngine};

/// Collection created by the default fixtures.
pub const LINE_ITEMS: &str = "line-items";

/// Database opened by the default fixtures.
pub const ORDERS: &str = "orders";

/// Configuration ensuring [`LINE_ITEMS`].
pub fn line_items_config() -> SessionConfig {
    SessionConfig::new().collection(LINE_ITEMS)
}

/// Builds an identity, panicking on a zero version.
pub fn identity(name: &str, version: u64) -> DatabaseIdentity {
    DatabaseIdentity::new(name, version).expect("fixture versions are positive")
}

/// A line item with a quantity.
pub fn line_item(id: &str, qty: i64) -> Record {
    Record::new(id).with_field("qty", qty)
}

/// A handful of line items.
pub fn sample_records() -> Vec<Record> {
    vec![
        line_item("a1", 2),
        line_item("a2", 1),
        Record::new("b7").with_field("qty", 12).with_field("note", "rush"),
    ]
}

/// Sorts records by key so projections can be compared.
pub fn sorted(records: &[Record]) -> Vec<Record> {
    let mut records = records.to_vec();
    records.sort_by(|a, b| a.id.cmp(&b.id));
    records
}

/// A session over an [`InMemoryEngine`].
pub struct TestSession {
    /// The session.
    pub session: Session<InMemoryEngine>,
}

impl TestSession {
    /// Creates a session ensuring [`LINE_ITEMS`].
    pub fn new() -> Self {
        Self::with_config(line_items_config())
    }

    /// Creates a session with a custom configuration.
    pub fn with_config(config: SessionConfig) -> Self {
        Self {
            session: Session::with_config(InMemoryEngine::new(), config),
        }
    }

    /// Creates a session already open on `orders v1`.
    pub fn opened() -> Self {
        let mut test = Self::new();
        test.open(ORDERS, 1);
        test
    }

    /// Opens `name` at `version` and runs until idle.
    pub fn open(&mut self, name: &str, version: u64) {
        self.session
            .open(identity(name, version))
            .expect("open request is issued");
        self.session.run_until_idle();
    }

    /// Writes `record` into the active collection and runs until idle.
    pub fn put(&mut self, record: Record) {
        self.session.put(record).expect("put is issued");
        self.session.run_until_idle();
    }

    /// Returns another client of the same engine.
    pub fn peer(&self) -> InMemoryEngine {
        self.session.engine().peer()
    }
}

impl Default for TestSession {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestSession {
    type Target = Session<InMemoryEngine>;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl std::ops::DerefMut for TestSession {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.session
    }
}

/// A session over a [`ScriptedEngine`].
pub type ScriptedSession = Session<ScriptedEngine>;

/// Creates a scripted session ensuring [`LINE_ITEMS`], open on `orders v1`.
///
/// Returns the session and the connection it holds.
pub fn scripted_open_session() -> (ScriptedSession, ConnectionId) {
    let mut session = Session::with_config(ScriptedEngine::new(), line_items_config());
    session
        .open(identity(ORDERS, 1))
        .expect("open request is issued");
    let connection = session
        .engine_mut()
        .script_open(0, 1)
        .expect("an open request was issued");
    session.run_until_idle();
    (session, connection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use idbscope_core::ConnectionState;

    #[test]
    fn opened_session_is_ready() {
        let test = TestSession::opened();
        assert_eq!(test.state(), ConnectionState::Open);
        assert_eq!(test.active_collection(), Some(LINE_ITEMS));
    }

    #[test]
    fn scripted_session_is_ready() {
        let (session, connection) = scripted_open_session();
        assert_eq!(session.handle().map(|h| h.id()), Some(connection));
        assert!(session.is_refreshing());
    }
}
