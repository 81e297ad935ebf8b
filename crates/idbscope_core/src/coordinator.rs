//! Short-lived transactions against the active collection.
//!
//! Every operation opens a fresh transaction scoped to one collection. Writes
//! trigger a refresh of the projection once their transaction commits; a
//! refresh lists the keys, then fans out one get per key and applies the
//! result only when every get has returned.
//!
//! Each refresh is tagged with a generation number when issued. Starting a
//! new refresh, or resetting the projection, bumps the generation; results
//! carrying an older tag are discarded.

use crate::error::{CoreResult, ErrorClass};
use crate::event_log::{EventKind, EventLog, EventOrigin, LifecycleEvent};
use crate::types::{CollectionName, ConnectionHandle, Record};
use idbscope_engine::{
    Engine, EngineError, RequestId, RequestOutput, StoreRequest, TransactionId, TransactionMode,
    TransactionOutcome,
};
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace, warn};

#[derive(Debug)]
struct PendingWrite {
    collection: CollectionName,
    operation: &'static str,
}

#[derive(Debug)]
enum RefreshPhase {
    /// Waiting for the key listing.
    Keys { request: RequestId },
    /// Waiting for one get per key.
    Values {
        expected: usize,
        outstanding: HashSet<RequestId>,
        records: Vec<Record>,
    },
}

#[derive(Debug)]
struct RefreshCollector {
    generation: u64,
    collection: CollectionName,
    phase: RefreshPhase,
}

/// Runs store operations and maintains the projection of the active
/// collection.
#[derive(Debug)]
pub struct TransactionCoordinator {
    key_path: String,
    projection: Vec<Record>,
    generation: u64,
    collector: Option<RefreshCollector>,
    reads: HashMap<RequestId, u64>,
    read_transactions: HashSet<TransactionId>,
    writes: HashMap<TransactionId, PendingWrite>,
}

impl TransactionCoordinator {
    /// Creates a coordinator for records keyed by `key_path`.
    pub fn new(key_path: impl Into<String>) -> Self {
        Self {
            key_path: key_path.into(),
            projection: Vec::new(),
            generation: 0,
            collector: None,
            reads: HashMap::new(),
            read_transactions: HashSet::new(),
            writes: HashMap::new(),
        }
    }

    /// Last committed contents of the active collection.
    ///
    /// No ordering is promised.
    #[must_use]
    pub fn projection(&self) -> &[Record] {
        &self.projection
    }

    /// Current refresh generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns true while a refresh is collecting results.
    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.collector.is_some()
    }

    /// Number of write transactions waiting for their outcome.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    /// Empties the projection and makes in-flight refresh results stale.
    pub fn reset_projection(&mut self) {
        self.generation += 1;
        self.collector = None;
        self.projection.clear();
    }

    /// Forgets everything tied to the previous connection.
    pub fn reset(&mut self) {
        self.reset_projection();
        self.reads.clear();
        self.read_transactions.clear();
        self.writes.clear();
    }

    fn reject(log: &EventLog, target: String, err: &EngineError) {
        warn!(%target, error = %err, "request rejected");
        log.record(
            LifecycleEvent::new(EventKind::Error, EventOrigin::Engine, "DOMException", target)
                .with_detail(err.to_string())
                .with_class(ErrorClass::Transaction),
        );
    }

    fn write<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        log: &EventLog,
        handle: &ConnectionHandle,
        collection: &str,
        request: StoreRequest,
    ) -> CoreResult<TransactionId> {
        let operation = request.name();
        let transaction = engine
            .transaction(handle.id(), collection, TransactionMode::ReadWrite)
            .inspect_err(|err| Self::reject(log, handle.describe(), err))?;
        let id = engine
            .request(transaction, request)
            .inspect_err(|err| Self::reject(log, format!("IDBTransaction {collection}"), err))?;
        debug!(%transaction, request = %id, collection, operation, "write issued");
        self.writes.insert(
            transaction,
            PendingWrite {
                collection: collection.to_string(),
                operation,
            },
        );
        Ok(transaction)
    }

    /// Writes `record` into `collection`.
    ///
    /// The projection is refreshed once the transaction commits.
    ///
    /// # Errors
    ///
    /// Returns the engine's synchronous rejection, also recorded as an
    /// `error` event.
    pub fn put<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        log: &EventLog,
        handle: &ConnectionHandle,
        collection: &str,
        record: &Record,
    ) -> CoreResult<TransactionId> {
        let value = record.to_value(&self.key_path);
        self.write(engine, log, handle, collection, StoreRequest::Put(value))
    }

    /// Deletes the record stored under `id`.
    ///
    /// # Errors
    ///
    /// Returns the engine's synchronous rejection.
    pub fn delete_record<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        log: &EventLog,
        handle: &ConnectionHandle,
        collection: &str,
        id: &str,
    ) -> CoreResult<TransactionId> {
        self.write(
            engine,
            log,
            handle,
            collection,
            StoreRequest::Delete(id.to_string()),
        )
    }

    /// Removes every record of `collection`.
    ///
    /// # Errors
    ///
    /// Returns the engine's synchronous rejection.
    pub fn clear<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        log: &EventLog,
        handle: &ConnectionHandle,
        collection: &str,
    ) -> CoreResult<TransactionId> {
        self.write(engine, log, handle, collection, StoreRequest::Clear)
    }

    /// Starts re-reading `collection` into the projection.
    ///
    /// Any refresh still in flight becomes stale. The projection keeps its
    /// current contents until the new refresh resolves.
    ///
    /// # Errors
    ///
    /// Returns the engine's synchronous rejection.
    pub fn refresh<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        log: &EventLog,
        handle: &ConnectionHandle,
        collection: &str,
    ) -> CoreResult<()> {
        self.generation += 1;
        self.collector = None;

        let transaction = engine
            .transaction(handle.id(), collection, TransactionMode::ReadOnly)
            .inspect_err(|err| Self::reject(log, handle.describe(), err))?;
        let request = engine
            .request(transaction, StoreRequest::GetAllKeys)
            .inspect_err(|err| Self::reject(log, format!("IDBTransaction {collection}"), err))?;

        trace!(generation = self.generation, collection, "refresh started");
        self.read_transactions.insert(transaction);
        self.reads.insert(request, self.generation);
        self.collector = Some(RefreshCollector {
            generation: self.generation,
            collection: collection.to_string(),
            phase: RefreshPhase::Keys { request },
        });
        Ok(())
    }

    /// Handles the result of a store request.
    ///
    /// Returns false if the request was not issued by this coordinator.
    pub fn handle_request<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        log: &EventLog,
        handle: Option<&ConnectionHandle>,
        request: RequestId,
        transaction: TransactionId,
        result: Result<RequestOutput, EngineError>,
    ) -> bool {
        if let Some(write) = self.writes.get(&transaction) {
            match &result {
                Ok(_) => trace!(%request, operation = write.operation, "write request done"),
                Err(err) => warn!(
                    %request,
                    collection = %write.collection,
                    operation = write.operation,
                    error = %err,
                    "write request failed"
                ),
            }
            return true;
        }

        let Some(generation) = self.reads.remove(&request) else {
            return false;
        };
        if generation != self.generation {
            debug!(%request, generation, current = self.generation, "stale refresh result discarded");
            return true;
        }
        let Some(mut collector) = self.collector.take() else {
            return true;
        };

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                warn!(%request, collection = %collector.collection, error = %err, "refresh failed; projection kept");
                return true;
            }
        };

        match &mut collector.phase {
            RefreshPhase::Keys { request: expected } => {
                let expected = *expected;
                match output {
                    RequestOutput::Keys(keys) if expected == request => {
                        self.on_keys(engine, log, handle, collector, &keys);
                    }
                    other => warn!(%request, output = ?other, "unexpected key listing; projection kept"),
                }
            }
            RefreshPhase::Values {
                expected,
                outstanding,
                records,
            } => {
                let value = match output {
                    RequestOutput::Value(value) => value,
                    other => {
                        warn!(%request, output = ?other, "unexpected refresh result; projection kept");
                        return true;
                    }
                };
                if !outstanding.remove(&request) {
                    self.collector = Some(collector);
                    return true;
                }
                if let Some(value) = value {
                    match Record::from_value(value, &self.key_path) {
                        Ok(record) => records.push(record),
                        Err(err) => warn!(%request, error = %err, "unreadable record skipped"),
                    }
                }
                if outstanding.is_empty() {
                    trace!(
                        collection = %collector.collection,
                        expected = *expected,
                        resolved = records.len(),
                        "refresh resolved"
                    );
                    self.projection = std::mem::take(records);
                } else {
                    self.collector = Some(collector);
                }
            }
        }
        true
    }

    fn on_keys<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        log: &EventLog,
        handle: Option<&ConnectionHandle>,
        mut collector: RefreshCollector,
        keys: &[String],
    ) {
        if keys.is_empty() {
            self.projection.clear();
            trace!(collection = %collector.collection, "refresh resolved empty");
            return;
        }
        let Some(handle) = handle else {
            return;
        };
        match self.fan_out(engine, log, handle, &collector, keys) {
            Some(outstanding) => {
                collector.phase = RefreshPhase::Values {
                    expected: keys.len(),
                    outstanding,
                    records: Vec::with_capacity(keys.len()),
                };
                self.collector = Some(collector);
            }
            None => {
                warn!(collection = %collector.collection, "refresh abandoned; projection kept");
            }
        }
    }

    fn fan_out<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        log: &EventLog,
        handle: &ConnectionHandle,
        collector: &RefreshCollector,
        keys: &[String],
    ) -> Option<HashSet<RequestId>> {
        let mut outstanding = HashSet::with_capacity(keys.len());
        for key in keys {
            let transaction = engine
                .transaction(handle.id(), &collector.collection, TransactionMode::ReadOnly)
                .inspect_err(|err| Self::reject(log, handle.describe(), err))
                .ok()?;
            let request = engine
                .request(transaction, StoreRequest::Get(key.clone()))
                .inspect_err(|err| {
                    Self::reject(log, format!("IDBTransaction {}", collector.collection), err);
                })
                .ok()?;
            self.read_transactions.insert(transaction);
            self.reads.insert(request, collector.generation);
            outstanding.insert(request);
        }
        Some(outstanding)
    }

    /// Handles the outcome of a transaction.
    ///
    /// When a write transaction on `active` commits, the projection is
    /// refreshed. An aborted write never triggers a refresh. Returns false
    /// if the transaction was not started by this coordinator.
    pub fn handle_transaction<E: Engine + ?Sized>(
        &mut self,
        engine: &mut E,
        log: &EventLog,
        handle: Option<&ConnectionHandle>,
        active: Option<&str>,
        transaction: TransactionId,
        outcome: TransactionOutcome,
    ) -> bool {
        if self.read_transactions.remove(&transaction) {
            if let TransactionOutcome::Abort { reason } = outcome {
                debug!(%transaction, %reason, "read transaction aborted");
            }
            return true;
        }
        let Some(write) = self.writes.remove(&transaction) else {
            return false;
        };
        match outcome {
            TransactionOutcome::Complete => {
                debug!(%transaction, collection = %write.collection, operation = write.operation, "write committed");
                if active != Some(write.collection.as_str()) {
                    return true;
                }
                if let Some(handle) = handle {
                    if let Err(err) = self.refresh(engine, log, handle, &write.collection) {
                        warn!(collection = %write.collection, error = %err, "refresh after commit failed");
                    }
                }
            }
            TransactionOutcome::Abort { reason } => {
                warn!(%transaction, collection = %write.collection, operation = write.operation, %reason, "write aborted; projection kept");
            }
        }
        true
    }
}
