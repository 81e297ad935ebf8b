//! Property tests over random command sequences.

use idbscope_core::{ConnectionState, EventKind, EventOrigin, Session};
use idbscope_engine::InMemoryEngine;
use idbscope_testkit::prelude::*;
use proptest::prelude::*;

fn fresh_session() -> Session<InMemoryEngine> {
    Session::with_config(InMemoryEngine::new(), line_items_config())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The session never holds more than one open connection, whatever the
    /// interleaving of commands, peer activity and engine progress.
    #[test]
    fn at_most_one_connection_is_live(commands in command_sequence_strategy(40)) {
        let mut session = fresh_session();
        let mut peer = Peer::new(session.engine());

        for command in &commands {
            apply(&mut session, &mut peer, command);
            prop_assert_eq!(session.handle().is_some(), session.state() == ConnectionState::Open);

            // Connections of superseded opens are closed as soon as their
            // events are dispatched; settle before counting.
            session.run_until_idle();
            peer.pump();
            let own = session.engine().open_connection_count() - peer.held();
            prop_assert!(own <= 1, "{} connections after {:?}", own, command);
        }
    }

    /// Every established handle that goes away leaves exactly one `close`
    /// event behind.
    #[test]
    fn every_released_handle_records_one_close(commands in command_sequence_strategy(40)) {
        let mut session = fresh_session();
        let mut peer = Peer::new(session.engine());

        for command in &commands {
            apply(&mut session, &mut peer, command);

            let events = session.events();
            let established = events
                .iter()
                .filter(|e| e.kind == EventKind::Success)
                .filter(|e| e.detail.as_deref().is_some_and(|d| d.starts_with("opened at")))
                .count();
            let closes = events.iter().filter(|e| e.kind == EventKind::Close).count();
            let held = usize::from(session.handle().is_some());
            prop_assert_eq!(established, closes + held);
        }
    }

    /// Once every write has settled, the projection matches what a fresh
    /// read of the collection returns.
    #[test]
    fn settled_projection_matches_the_store(records in prop::collection::vec(record_strategy(), 1..12)) {
        let mut session = fresh_session();
        session.open(identity(ORDERS, 1)).unwrap();
        session.run_until_idle();

        let mut expected = std::collections::BTreeMap::new();
        for record in records {
            expected.insert(record.id.clone(), record.clone());
            session.put(record).unwrap();
        }
        session.run_until_idle();

        let expected: Vec<_> = expected.into_values().collect();
        prop_assert_eq!(sorted(session.projection()), expected);
    }
}

#[test]
fn controller_closes_are_distinguished_from_engine_closes() {
    let mut session = fresh_session();
    session.open(identity(ORDERS, 1)).unwrap();
    session.run_until_idle();
    let connection = session.handle().unwrap().id();
    session.engine().force_close(connection);
    session.run_until_idle();

    session.open(identity(ORDERS, 1)).unwrap();
    session.run_until_idle();
    session.open(identity(ORDERS, 1)).unwrap();
    session.run_until_idle();

    let origins: Vec<EventOrigin> = session
        .events()
        .iter()
        .filter(|e| e.kind == EventKind::Close)
        .map(|e| e.origin)
        .collect();
    assert_eq!(origins, vec![EventOrigin::Engine, EventOrigin::Controller]);
}
