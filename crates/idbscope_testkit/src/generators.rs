//! Property-based test generators using proptest.
//!
//! Provides strategies for identities, records and whole command
//! sequences, and a driver that applies a command to a session.

use crate::fixtures::LINE_ITEMS;
use idbscope_core::{DatabaseIdentity, Record, Session};
use idbscope_engine::{ConnectionId, Engine, EngineEvent, InMemoryEngine, OpenOutcome};
use proptest::prelude::*;

/// Strategy for database names from a small pool, so commands collide.
pub fn database_name_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["orders", "customers"]).prop_map(str::to_owned)
}

/// Strategy for valid identities.
pub fn identity_strategy() -> impl Strategy<Value = DatabaseIdentity> {
    (database_name_strategy(), 1u64..4).prop_map(|(name, version)| {
        DatabaseIdentity::new(name, version).expect("versions start at one")
    })
}

/// Strategy for record keys from a small pool.
pub fn record_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-c][0-3]").expect("Invalid regex")
}

/// Strategy for records with a few scalar fields.
pub fn record_strategy() -> impl Strategy<Value = Record> {
    (
        record_id_strategy(),
        prop::collection::btree_map("[a-z]{1,6}", any::<i32>(), 0..3),
    )
        .prop_map(|(id, fields)| {
            fields
                .into_iter()
                .filter(|(name, _)| name != "id")
                .fold(Record::new(id), |record, (name, value)| {
                    record.with_field(name, value)
                })
        })
}

/// A user action against a session, or engine progress.
#[derive(Debug, Clone)]
pub enum Command {
    /// Open a database.
    Open(DatabaseIdentity),
    /// Delete a database.
    Delete(String),
    /// Write a record into the active collection.
    Put(Record),
    /// Delete a record of the active collection.
    DeleteRecord(String),
    /// Clear the active collection.
    Clear,
    /// Select the default collection.
    Select,
    /// Let a second client open a database at a version.
    PeerOpen(DatabaseIdentity),
    /// Close every connection of the second client.
    PeerClose,
    /// Deliver up to this many engine events.
    Poll(usize),
}

/// Strategy for a single command.
pub fn command_strategy() -> impl Strategy<Value = Command> {
    prop_oneof![
        3 => identity_strategy().prop_map(Command::Open),
        1 => database_name_strategy().prop_map(Command::Delete),
        3 => record_strategy().prop_map(Command::Put),
        1 => record_id_strategy().prop_map(Command::DeleteRecord),
        1 => Just(Command::Clear),
        1 => Just(Command::Select),
        1 => identity_strategy().prop_map(Command::PeerOpen),
        1 => Just(Command::PeerClose),
        4 => (1usize..8).prop_map(Command::Poll),
    ]
}

/// Strategy for command sequences.
pub fn command_sequence_strategy(max_len: usize) -> impl Strategy<Value = Vec<Command>> {
    prop::collection::vec(command_strategy(), 1..max_len)
}

/// A second client that holds connections and never reacts to
/// `versionchange`, so it keeps blocking upgrades until told to close.
pub struct Peer {
    engine: InMemoryEngine,
    connections: Vec<ConnectionId>,
}

impl Peer {
    /// Creates a peer of `engine`.
    pub fn new(engine: &InMemoryEngine) -> Self {
        Self {
            engine: engine.peer(),
            connections: Vec::new(),
        }
    }

    /// Requests a connection; it is held once its success is delivered.
    pub fn open(&mut self, identity: &DatabaseIdentity) {
        // Failures are part of the exercise; nothing to do on rejection.
        let _ = self.engine.open(identity.name(), identity.version());
    }

    /// Delivers pending peer events, keeping every connection that opens.
    pub fn pump(&mut self) {
        while let Some(event) = self.engine.poll_event() {
            if let EngineEvent::Open {
                outcome: OpenOutcome::Success { connection, .. },
                ..
            } = event
            {
                self.connections.push(connection);
            }
        }
    }

    /// Closes every held connection.
    pub fn close_all(&mut self) {
        for connection in self.connections.drain(..) {
            self.engine.close(connection);
        }
    }

    /// Number of held connections.
    pub fn held(&self) -> usize {
        self.connections.len()
    }
}

/// Applies `command` to `session`; command errors are expected and ignored.
pub fn apply(session: &mut Session<InMemoryEngine>, peer: &mut Peer, command: &Command) {
    let _ = match command {
        Command::Open(identity) => session.open(identity.clone()).map(drop),
        Command::Delete(name) => session.delete(name).map(drop),
        Command::Put(record) => session.put(record.clone()).map(drop),
        Command::DeleteRecord(id) => session.delete_record(id).map(drop),
        Command::Clear => session.clear().map(drop),
        Command::Select => session.select_collection(LINE_ITEMS),
        Command::PeerOpen(identity) => {
            peer.open(identity);
            Ok(())
        }
        Command::PeerClose => {
            peer.close_all();
            Ok(())
        }
        Command::Poll(count) => {
            for _ in 0..*count {
                if !session.poll() {
                    break;
                }
            }
            Ok(())
        }
    };
    peer.pump();
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::strategy::ValueTree;
    use proptest::test_runner::TestRunner;

    #[test]
    fn records_never_carry_the_key_field() {
        let mut runner = TestRunner::default();
        for _ in 0..32 {
            let record = record_strategy()
                .new_tree(&mut runner)
                .unwrap()
                .current();
            assert!(!record.fields.contains_key("id"));
            assert_eq!(record.id.len(), 2);
        }
    }

    #[test]
    fn command_sequences_are_not_empty() {
        let mut runner = TestRunner::default();
        let commands = command_sequence_strategy(10)
            .new_tree(&mut runner)
            .unwrap()
            .current();
        assert!(!commands.is_empty());
    }
}
