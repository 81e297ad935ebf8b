//! Collection enumeration and selection.

use crate::error::{CoreError, CoreResult};
use crate::types::{CollectionName, ConnectionHandle};
use idbscope_engine::{ConnectionId, Engine};
use tracing::debug;

/// Tracks the collections of the current connection and which one is active.
#[derive(Debug, Default)]
pub struct StoreBrowser {
    collections: Vec<CollectionName>,
    active: Option<CollectionName>,
    listed_for: Option<ConnectionId>,
}

impl StoreBrowser {
    /// Creates an empty browser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-reads the collection set of `handle`.
    ///
    /// The active collection is kept only if it is still present.
    ///
    /// # Errors
    ///
    /// Returns an engine error if the connection cannot be queried; the
    /// browser is then empty.
    pub fn list_collections<E: Engine + ?Sized>(
        &mut self,
        engine: &E,
        handle: &ConnectionHandle,
    ) -> CoreResult<&[CollectionName]> {
        self.collections.clear();
        self.listed_for = None;
        let names = engine.store_names(handle.id())?;
        self.collections = names;
        self.listed_for = Some(handle.id());
        if let Some(active) = &self.active {
            if !self.collections.contains(active) {
                debug!(collection = %active, "active collection no longer exists");
                self.active = None;
            }
        }
        Ok(&self.collections)
    }

    /// Collections of the last listed connection.
    #[must_use]
    pub fn collections(&self) -> &[CollectionName] {
        &self.collections
    }

    /// Connection the collections were listed for.
    #[must_use]
    pub fn listed_for(&self) -> Option<ConnectionId> {
        self.listed_for
    }

    /// Returns the active collection.
    #[must_use]
    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    /// Returns true if `name` is one of the listed collections.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.collections.iter().any(|c| c == name)
    }

    /// Makes `name` the active collection.
    ///
    /// Returns true if the active collection changed.
    ///
    /// # Errors
    ///
    /// Returns `CollectionNotFound` if `name` was not listed.
    pub fn select_active(&mut self, name: &str) -> CoreResult<bool> {
        if !self.contains(name) {
            return Err(CoreError::collection_not_found(name));
        }
        if self.active.as_deref() == Some(name) {
            return Ok(false);
        }
        debug!(collection = name, "active collection selected");
        self.active = Some(name.to_string());
        Ok(true)
    }

    /// Forgets the listed collections and the selection.
    pub fn reset(&mut self) {
        self.collections.clear();
        self.active = None;
        self.listed_for = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DatabaseIdentity;
    use idbscope_engine::{EngineEvent, InMemoryEngine, OpenOutcome};

    fn open_with(stores: &[&str]) -> (InMemoryEngine, ConnectionHandle) {
        let mut engine = InMemoryEngine::new();
        engine.open("orders", 1).unwrap();
        let Some(EngineEvent::Open {
            outcome: OpenOutcome::UpgradeNeeded { connection, .. },
            ..
        }) = engine.poll_event()
        else {
            panic!("expected upgrade");
        };
        for store in stores {
            engine.create_store(connection, store, "id").unwrap();
        }
        while engine.poll_event().is_some() {}
        let identity = DatabaseIdentity::new("orders", 1).unwrap();
        (engine, ConnectionHandle::new(connection, identity))
    }

    #[test]
    fn lists_sorted_collections() {
        let (engine, handle) = open_with(&["line-items", "customers"]);
        let mut browser = StoreBrowser::new();

        let names = browser.list_collections(&engine, &handle).unwrap();
        assert_eq!(names, ["customers", "line-items"]);
        assert_eq!(browser.listed_for(), Some(handle.id()));
    }

    #[test]
    fn select_rejects_unknown_names() {
        let (engine, handle) = open_with(&["line-items"]);
        let mut browser = StoreBrowser::new();
        browser.list_collections(&engine, &handle).unwrap();

        assert!(matches!(
            browser.select_active("nope"),
            Err(CoreError::CollectionNotFound { .. })
        ));
        assert_eq!(browser.active(), None);
    }

    #[test]
    fn select_reports_changes() {
        let (engine, handle) = open_with(&["a", "b"]);
        let mut browser = StoreBrowser::new();
        browser.list_collections(&engine, &handle).unwrap();

        assert!(browser.select_active("a").unwrap());
        assert!(!browser.select_active("a").unwrap());
        assert!(browser.select_active("b").unwrap());
        assert_eq!(browser.active(), Some("b"));

        browser.reset();
        assert!(browser.collections().is_empty());
        assert_eq!(browser.active(), None);
    }
}
