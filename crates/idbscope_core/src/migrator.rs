//! Schema migration run inside upgrade callbacks.

use crate::config::SessionConfig;
use crate::error::{CoreError, CoreResult};
use crate::types::CollectionName;
use idbscope_engine::{ConnectionId, Engine};
use tracing::debug;

/// Outcome of [`SchemaMigrator::ensure_collections`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Collections created by this run.
    pub created: Vec<CollectionName>,
    /// Collections that were already present.
    pub existing: Vec<CollectionName>,
}

impl MigrationReport {
    /// Returns true if the run changed the schema.
    #[must_use]
    pub fn changed(&self) -> bool {
        !self.created.is_empty()
    }
}

/// Creates the collections a session expects, once per upgrade.
///
/// Collections are only ever created, never dropped or altered. Running the
/// migrator twice inside the same upgrade leaves the schema as one run does.
#[derive(Debug, Clone)]
pub struct SchemaMigrator {
    collections: Vec<CollectionName>,
    key_path: String,
}

impl SchemaMigrator {
    /// Creates a migrator for `collections`, keyed by `key_path`.
    ///
    /// Duplicate names are ignored.
    pub fn new<I, S>(collections: I, key_path: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<CollectionName> = Vec::new();
        for name in collections {
            let name = name.into();
            if !unique.contains(&name) {
                unique.push(name);
            }
        }
        Self {
            collections: unique,
            key_path: key_path.into(),
        }
    }

    /// Creates a migrator from a session configuration.
    #[must_use]
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.collections.iter().cloned(), config.key_path.clone())
    }

    /// Collections ensured by [`SchemaMigrator::run`].
    #[must_use]
    pub fn collections(&self) -> &[CollectionName] {
        &self.collections
    }

    /// Primary key field of created collections.
    #[must_use]
    pub fn key_path(&self) -> &str {
        &self.key_path
    }

    /// Ensures every configured collection exists.
    ///
    /// # Errors
    ///
    /// See [`SchemaMigrator::ensure_collections`].
    pub fn run<E: Engine + ?Sized>(
        &self,
        engine: &mut E,
        connection: ConnectionId,
    ) -> CoreResult<MigrationReport> {
        self.ensure_collections(engine, connection, &self.collections)
    }

    /// Creates each of `names` that the connection does not have yet.
    ///
    /// Must be called while the connection's upgrade is running; the engine
    /// rejects store creation anywhere else.
    ///
    /// # Errors
    ///
    /// Returns `MigrationFailed` naming the first collection the engine
    /// refused to create; collections before it stay created.
    pub fn ensure_collections<E: Engine + ?Sized>(
        &self,
        engine: &mut E,
        connection: ConnectionId,
        names: &[CollectionName],
    ) -> CoreResult<MigrationReport> {
        let mut present = engine.store_names(connection)?;
        let mut report = MigrationReport::default();

        for name in names {
            if present.contains(name) {
                if !report.existing.contains(name) {
                    report.existing.push(name.clone());
                }
                continue;
            }
            engine
                .create_store(connection, name, &self.key_path)
                .map_err(|source| CoreError::MigrationFailed {
                    collection: name.clone(),
                    source,
                })?;
            debug!(%connection, collection = %name, key_path = %self.key_path, "collection created");
            present.push(name.clone());
            report.created.push(name.clone());
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use idbscope_engine::{EngineError, EngineEvent, InMemoryEngine, OpenOutcome};
    use proptest::prelude::*;

    fn upgrade(engine: &mut InMemoryEngine, name: &str, version: u64) -> ConnectionId {
        engine.open(name, version).unwrap();
        match engine.poll_event() {
            Some(EngineEvent::Open {
                outcome: OpenOutcome::UpgradeNeeded { connection, .. },
                ..
            }) => connection,
            other => panic!("expected upgrade, got {other:?}"),
        }
    }

    #[test]
    fn creates_missing_collections() {
        let mut engine = InMemoryEngine::new();
        let connection = upgrade(&mut engine, "orders", 1);

        let migrator = SchemaMigrator::new(["line-items", "customers", "line-items"], "id");
        assert_eq!(migrator.collections().len(), 2);

        let report = migrator.run(&mut engine, connection).unwrap();
        assert_eq!(report.created, vec!["line-items", "customers"]);
        assert!(report.existing.is_empty());
        assert_eq!(
            engine.store_names(connection).unwrap(),
            vec!["customers", "line-items"]
        );
    }

    #[test]
    fn second_run_is_a_no_op() {
        let mut engine = InMemoryEngine::new();
        let connection = upgrade(&mut engine, "orders", 1);
        let migrator = SchemaMigrator::new(["line-items"], "id");

        migrator.run(&mut engine, connection).unwrap();
        let report = migrator.run(&mut engine, connection).unwrap();

        assert!(!report.changed());
        assert_eq!(report.existing, vec!["line-items"]);
    }

    #[test]
    fn later_upgrade_only_adds_new_collections() {
        let mut engine = InMemoryEngine::new();
        let connection = upgrade(&mut engine, "orders", 1);
        SchemaMigrator::new(["line-items"], "id")
            .run(&mut engine, connection)
            .unwrap();
        while engine.poll_event().is_some() {}
        engine.close(connection);

        let connection = upgrade(&mut engine, "orders", 2);
        let report = SchemaMigrator::new(["line-items", "customers"], "id")
            .run(&mut engine, connection)
            .unwrap();
        assert_eq!(report.created, vec!["customers"]);
        assert_eq!(report.existing, vec!["line-items"]);
    }

    #[test]
    fn outside_upgrade_is_reported() {
        let mut engine = InMemoryEngine::new();
        let connection = upgrade(&mut engine, "orders", 1);
        while engine.poll_event().is_some() {}

        let err = SchemaMigrator::new(["line-items"], "id")
            .run(&mut engine, connection)
            .unwrap_err();
        match err {
            CoreError::MigrationFailed { collection, source } => {
                assert_eq!(collection, "line-items");
                assert!(matches!(source, EngineError::InvalidState(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    proptest! {
        #[test]
        fn ensure_twice_equals_once(names in prop::collection::vec("[a-d]{1,2}", 0..6)) {
            let mut once = InMemoryEngine::new();
            let a = upgrade(&mut once, "db", 1);
            let migrator = SchemaMigrator::new(names.clone(), "id");
            migrator.run(&mut once, a).unwrap();

            let mut twice = InMemoryEngine::new();
            let b = upgrade(&mut twice, "db", 1);
            migrator.run(&mut twice, b).unwrap();
            let second = migrator.run(&mut twice, b).unwrap();

            prop_assert!(second.created.is_empty());
            prop_assert_eq!(once.store_names(a).unwrap(), twice.store_names(b).unwrap());
        }
    }
}
