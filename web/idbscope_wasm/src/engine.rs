//! IndexedDB engine adapter.
//!
//! Adapts the browser's callback-based IndexedDB to the polled
//! [`Engine`] trait. A fixed set of callbacks is registered on every
//! request, transaction and listened connection; each one queues an
//! [`EngineEvent`] and then runs the waker, which lets the session dispatch
//! synchronously. Running inside the callback matters for upgrades: object
//! stores can only be created while `upgradeneeded` is being handled.

use crate::convert::{engine_error, from_js, keys_from_js, reason, to_js, RequestKind};
use crate::error::{WasmError, WasmResult};
use crate::utils::idb_factory;
use idbscope_engine::{
    ConnectionEvent, ConnectionId, DeleteOutcome, Engine, EngineError, EngineEvent, EngineResult,
    OpenOutcome, RequestId, RequestOutput, StoreRequest, TransactionId, TransactionMode,
    TransactionOutcome,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{
    Event, IdbDatabase, IdbFactory, IdbOpenDbRequest, IdbRequest, IdbTransaction,
    IdbTransactionMode, IdbVersionChangeEvent,
};

/// Called after an event has been queued.
pub type Waker = Rc<dyn Fn()>;

struct OpenEntry {
    id: RequestId,
    request: IdbOpenDbRequest,
    version: u64,
    connection: Option<ConnectionId>,
}

struct DeleteEntry {
    id: RequestId,
    request: IdbOpenDbRequest,
}

struct ConnectionEntry {
    id: ConnectionId,
    db: IdbDatabase,
    listening: bool,
}

struct TransactionEntry {
    id: TransactionId,
    tx: IdbTransaction,
    store: String,
    mode: TransactionMode,
}

struct RequestEntry {
    id: RequestId,
    transaction: TransactionId,
    request: IdbRequest,
    kind: RequestKind,
}

#[derive(Default)]
struct Shared {
    next_id: u64,
    events: VecDeque<EngineEvent>,
    opens: Vec<OpenEntry>,
    deletes: Vec<DeleteEntry>,
    connections: Vec<ConnectionEntry>,
    transactions: Vec<TransactionEntry>,
    requests: Vec<RequestEntry>,
    waker: Option<Waker>,
}

fn target<T: JsCast>(event: &Event) -> Option<T> {
    event.target()?.dyn_into().ok()
}

fn current_target<T: JsCast>(event: &Event) -> Option<T> {
    event.current_target()?.dyn_into().ok()
}

fn request_error(request: &IdbRequest) -> EngineError {
    match request.error() {
        Ok(Some(exception)) => engine_error(&exception),
        Ok(None) => EngineError::Abort("request failed".into()),
        Err(thrown) => engine_error(&thrown),
    }
}

impl Shared {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn register(&mut self, db: IdbDatabase) -> ConnectionId {
        let id = ConnectionId::new(self.next_id());
        self.connections.push(ConnectionEntry {
            id,
            db,
            listening: false,
        });
        id
    }

    fn connection_of(&self, db: &IdbDatabase) -> Option<&ConnectionEntry> {
        self.connections.iter().find(|c| &c.db == db)
    }

    fn on_open_upgrade(&mut self, event: IdbVersionChangeEvent) {
        let Some(request) = target::<IdbOpenDbRequest>(&event) else {
            return;
        };
        let Some(index) = self.opens.iter().position(|o| o.request == request) else {
            return;
        };
        let Ok(db) = request.result().and_then(|r| r.dyn_into::<IdbDatabase>()) else {
            return;
        };
        let connection = self.register(db);
        let entry = &mut self.opens[index];
        entry.connection = Some(connection);
        let outcome = OpenOutcome::UpgradeNeeded {
            connection,
            old_version: event.old_version() as u64,
            new_version: event.new_version().map_or(entry.version, |v| v as u64),
        };
        let id = entry.id;
        self.events.push_back(EngineEvent::Open {
            request: id,
            outcome,
        });
    }

    fn on_open_success(&mut self, event: Event) {
        let Some(request) = target::<IdbOpenDbRequest>(&event) else {
            return;
        };
        let Some(index) = self.opens.iter().position(|o| o.request == request) else {
            return;
        };
        let entry = self.opens.remove(index);
        let outcome = match request.result().and_then(|r| r.dyn_into::<IdbDatabase>()) {
            Ok(db) => {
                let version = db.version() as u64;
                let connection = entry.connection.unwrap_or_else(|| self.register(db));
                OpenOutcome::Success {
                    connection,
                    version,
                }
            }
            Err(thrown) => OpenOutcome::Error(engine_error(&thrown)),
        };
        self.events.push_back(EngineEvent::Open {
            request: entry.id,
            outcome,
        });
    }

    fn on_open_error(&mut self, event: Event) {
        let Some(request) = target::<IdbOpenDbRequest>(&event) else {
            return;
        };
        let Some(index) = self.opens.iter().position(|o| o.request == request) else {
            return;
        };
        let entry = self.opens.remove(index);
        if let Some(connection) = entry.connection {
            self.connections.retain(|c| c.id != connection);
        }
        self.events.push_back(EngineEvent::Open {
            request: entry.id,
            outcome: OpenOutcome::Error(request_error(&request)),
        });
    }

    fn on_open_blocked(&mut self, event: IdbVersionChangeEvent) {
        let Some(request) = target::<IdbOpenDbRequest>(&event) else {
            return;
        };
        let Some(entry) = self.opens.iter().find(|o| o.request == request) else {
            return;
        };
        let open = EngineEvent::Open {
            request: entry.id,
            outcome: OpenOutcome::Blocked {
                old_version: event.old_version() as u64,
                new_version: entry.version,
            },
        };
        self.events.push_back(open);
    }

    fn take_delete(&mut self, event: &Event) -> Option<(RequestId, IdbOpenDbRequest)> {
        let request = target::<IdbOpenDbRequest>(event)?;
        let index = self.deletes.iter().position(|d| d.request == request)?;
        let entry = self.deletes.remove(index);
        Some((entry.id, entry.request))
    }

    fn on_delete_success(&mut self, event: IdbVersionChangeEvent) {
        if let Some((id, _)) = self.take_delete(&event) {
            self.events.push_back(EngineEvent::Delete {
                request: id,
                outcome: DeleteOutcome::Success {
                    old_version: event.old_version() as u64,
                },
            });
        }
    }

    fn on_delete_error(&mut self, event: Event) {
        if let Some((id, request)) = self.take_delete(&event) {
            self.events.push_back(EngineEvent::Delete {
                request: id,
                outcome: DeleteOutcome::Error(request_error(&request)),
            });
        }
    }

    fn on_delete_blocked(&mut self, event: IdbVersionChangeEvent) {
        let Some(request) = target::<IdbOpenDbRequest>(&event) else {
            return;
        };
        if let Some(entry) = self.deletes.iter().find(|d| d.request == request) {
            let blocked = EngineEvent::Delete {
                request: entry.id,
                outcome: DeleteOutcome::Blocked {
                    old_version: event.old_version() as u64,
                },
            };
            self.events.push_back(blocked);
        }
    }

    fn on_request_success(&mut self, event: Event) {
        let Some(request) = target::<IdbRequest>(&event) else {
            return;
        };
        let Some(index) = self.requests.iter().position(|r| r.request == request) else {
            return;
        };
        let entry = self.requests.remove(index);
        let result = request
            .result()
            .map_err(|thrown| engine_error(&thrown))
            .and_then(|value| match entry.kind {
                RequestKind::Put => value
                    .as_string()
                    .map(RequestOutput::Key)
                    .ok_or_else(|| EngineError::data("put returned a non-string key")),
                RequestKind::Get => from_js(value).map(RequestOutput::Value),
                RequestKind::GetAllKeys => keys_from_js(&value).map(RequestOutput::Keys),
                RequestKind::Delete | RequestKind::Clear => Ok(RequestOutput::Done),
            });
        self.events.push_back(EngineEvent::Request {
            request: entry.id,
            transaction: entry.transaction,
            result,
        });
    }

    fn on_request_error(&mut self, event: Event) {
        let Some(request) = target::<IdbRequest>(&event) else {
            return;
        };
        let Some(index) = self.requests.iter().position(|r| r.request == request) else {
            return;
        };
        let entry = self.requests.remove(index);
        self.events.push_back(EngineEvent::Request {
            request: entry.id,
            transaction: entry.transaction,
            result: Err(request_error(&request)),
        });
    }

    fn take_transaction(&mut self, event: &Event) -> Option<(TransactionId, IdbTransaction)> {
        let tx = target::<IdbTransaction>(event)?;
        let index = self.transactions.iter().position(|t| t.tx == tx)?;
        let entry = self.transactions.remove(index);
        Some((entry.id, entry.tx))
    }

    fn on_transaction_complete(&mut self, event: Event) {
        if let Some((id, _)) = self.take_transaction(&event) {
            self.events.push_back(EngineEvent::Transaction {
                transaction: id,
                outcome: TransactionOutcome::Complete,
            });
        }
    }

    fn on_transaction_abort(&mut self, event: Event) {
        if let Some((id, tx)) = self.take_transaction(&event) {
            self.events.push_back(EngineEvent::Transaction {
                transaction: id,
                outcome: TransactionOutcome::Abort {
                    reason: reason(tx.error()),
                },
            });
        }
    }

    fn push_connection(&mut self, event: &Event, connection_event: ConnectionEvent) {
        let Some(db) = current_target::<IdbDatabase>(event) else {
            return;
        };
        let Some(entry) = self.connection_of(&db) else {
            return;
        };
        if entry.listening {
            let id = entry.id;
            self.events.push_back(EngineEvent::Connection {
                connection: id,
                event: connection_event,
            });
        }
    }

    fn on_versionchange(&mut self, event: IdbVersionChangeEvent) {
        let change = ConnectionEvent::VersionChange {
            old_version: event.old_version() as u64,
            new_version: event.new_version().map(|v| v as u64),
        };
        self.push_connection(&event, change);
    }

    fn on_close(&mut self, event: Event) {
        self.push_connection(&event, ConnectionEvent::Close);
        if let Some(db) = current_target::<IdbDatabase>(&event) {
            self.connections.retain(|c| c.db != db);
        }
    }

    fn on_abort(&mut self, event: Event) {
        let reason = reason(target::<IdbTransaction>(&event).and_then(|tx| tx.error()));
        self.push_connection(&event, ConnectionEvent::Abort { reason });
    }

    fn on_error(&mut self, event: Event) {
        let reason = target::<IdbRequest>(&event)
            .map(|request| request_error(&request).to_string())
            .unwrap_or_else(|| "UnknownError".to_string());
        self.push_connection(&event, ConnectionEvent::Error { reason });
    }
}

type Handler<T> = Closure<dyn FnMut(T)>;

/// Builds a long-lived callback that updates the shared state and then
/// runs the waker with no borrow held.
fn handler<T>(shared: &Rc<RefCell<Shared>>, on_event: fn(&mut Shared, T)) -> Handler<T>
where
    T: wasm_bindgen::convert::FromWasmAbi + 'static,
{
    let shared = Rc::clone(shared);
    Closure::wrap(Box::new(move |event: T| {
        let waker = {
            let mut state = shared.borrow_mut();
            on_event(&mut state, event);
            state.waker.clone()
        };
        if let Some(wake) = waker {
            wake();
        }
    }) as Box<dyn FnMut(T)>)
}

struct Handlers {
    open_upgrade: Handler<IdbVersionChangeEvent>,
    open_success: Handler<Event>,
    open_error: Handler<Event>,
    open_blocked: Handler<IdbVersionChangeEvent>,
    delete_success: Handler<IdbVersionChangeEvent>,
    delete_error: Handler<Event>,
    delete_blocked: Handler<IdbVersionChangeEvent>,
    request_success: Handler<Event>,
    request_error: Handler<Event>,
    transaction_complete: Handler<Event>,
    transaction_abort: Handler<Event>,
    versionchange: Handler<IdbVersionChangeEvent>,
    close: Handler<Event>,
    abort: Handler<Event>,
    error: Handler<Event>,
}

impl Handlers {
    fn new(shared: &Rc<RefCell<Shared>>) -> Self {
        Self {
            open_upgrade: handler(shared, Shared::on_open_upgrade),
            open_success: handler(shared, Shared::on_open_success),
            open_error: handler(shared, Shared::on_open_error),
            open_blocked: handler(shared, Shared::on_open_blocked),
            delete_success: handler(shared, Shared::on_delete_success),
            delete_error: handler(shared, Shared::on_delete_error),
            delete_blocked: handler(shared, Shared::on_delete_blocked),
            request_success: handler(shared, Shared::on_request_success),
            request_error: handler(shared, Shared::on_request_error),
            transaction_complete: handler(shared, Shared::on_transaction_complete),
            transaction_abort: handler(shared, Shared::on_transaction_abort),
            versionchange: handler(shared, Shared::on_versionchange),
            close: handler(shared, Shared::on_close),
            abort: handler(shared, Shared::on_abort),
            error: handler(shared, Shared::on_error),
        }
    }
}

fn callback(closure: &JsValue) -> Option<&js_sys::Function> {
    Some(closure.unchecked_ref())
}

/// An [`Engine`] over the browser's IndexedDB.
pub struct BrowserEngine {
    factory: IdbFactory,
    shared: Rc<RefCell<Shared>>,
    handlers: Handlers,
}

impl BrowserEngine {
    /// Creates an engine over the global `indexedDB` factory.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` if no factory is available.
    pub fn new() -> WasmResult<Self> {
        let factory = idb_factory()
            .ok_or_else(|| WasmError::NotSupported("IndexedDB not available".into()))?;
        let shared = Rc::new(RefCell::new(Shared::default()));
        let handlers = Handlers::new(&shared);
        Ok(Self {
            factory,
            shared,
            handlers,
        })
    }

    /// Sets the function run after every queued event.
    pub fn set_waker(&self, waker: Waker) {
        self.shared.borrow_mut().waker = Some(waker);
    }

    fn with_connection<T>(
        &self,
        connection: ConnectionId,
        f: impl FnOnce(&ConnectionEntry) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let shared = self.shared.borrow();
        let entry = shared
            .connections
            .iter()
            .find(|c| c.id == connection)
            .ok_or_else(|| EngineError::not_found(format!("connection {connection} is closed")))?;
        f(entry)
    }

    fn set_listeners(&self, db: &IdbDatabase, on: bool) {
        if on {
            db.set_onversionchange(callback(self.handlers.versionchange.as_ref()));
            db.set_onclose(callback(self.handlers.close.as_ref()));
            db.set_onabort(callback(self.handlers.abort.as_ref()));
            db.set_onerror(callback(self.handlers.error.as_ref()));
        } else {
            db.set_onversionchange(None);
            db.set_onclose(None);
            db.set_onabort(None);
            db.set_onerror(None);
        }
    }
}

impl Engine for BrowserEngine {
    fn open(&mut self, name: &str, version: u64) -> EngineResult<RequestId> {
        if version == 0 {
            return Err(EngineError::data("version must be at least 1"));
        }
        let request = self
            .factory
            .open_with_f64(name, version as f64)
            .map_err(|thrown| engine_error(&thrown))?;
        request.set_onupgradeneeded(callback(self.handlers.open_upgrade.as_ref()));
        request.set_onblocked(callback(self.handlers.open_blocked.as_ref()));
        request.set_onsuccess(callback(self.handlers.open_success.as_ref()));
        request.set_onerror(callback(self.handlers.open_error.as_ref()));

        let mut shared = self.shared.borrow_mut();
        let id = RequestId::new(shared.next_id());
        shared.opens.push(OpenEntry {
            id,
            request,
            version,
            connection: None,
        });
        Ok(id)
    }

    fn delete_database(&mut self, name: &str) -> EngineResult<RequestId> {
        let request = self
            .factory
            .delete_database(name)
            .map_err(|thrown| engine_error(&thrown))?;
        request.set_onblocked(callback(self.handlers.delete_blocked.as_ref()));
        request.set_onsuccess(callback(self.handlers.delete_success.as_ref()));
        request.set_onerror(callback(self.handlers.delete_error.as_ref()));

        let mut shared = self.shared.borrow_mut();
        let id = RequestId::new(shared.next_id());
        shared.deletes.push(DeleteEntry { id, request });
        Ok(id)
    }

    fn close(&mut self, connection: ConnectionId) {
        let entry = {
            let mut shared = self.shared.borrow_mut();
            let Some(index) = shared.connections.iter().position(|c| c.id == connection) else {
                return;
            };
            shared.connections.remove(index)
        };
        self.set_listeners(&entry.db, false);
        entry.db.close();
    }

    fn listen(&mut self, connection: ConnectionId) -> EngineResult<()> {
        let db = self.with_connection(connection, |entry| Ok(entry.db.clone()))?;
        self.set_listeners(&db, true);
        if let Some(entry) = self
            .shared
            .borrow_mut()
            .connections
            .iter_mut()
            .find(|c| c.id == connection)
        {
            entry.listening = true;
        }
        Ok(())
    }

    fn unlisten(&mut self, connection: ConnectionId) {
        let Ok(db) = self.with_connection(connection, |entry| Ok(entry.db.clone())) else {
            return;
        };
        self.set_listeners(&db, false);
        if let Some(entry) = self
            .shared
            .borrow_mut()
            .connections
            .iter_mut()
            .find(|c| c.id == connection)
        {
            entry.listening = false;
        }
    }

    fn store_names(&self, connection: ConnectionId) -> EngineResult<Vec<String>> {
        self.with_connection(connection, |entry| {
            let names = entry.db.object_store_names();
            Ok((0..names.length()).filter_map(|i| names.item(i)).collect())
        })
    }

    fn create_store(
        &mut self,
        connection: ConnectionId,
        name: &str,
        key_path: &str,
    ) -> EngineResult<()> {
        self.with_connection(connection, |entry| {
            let params = js_sys::Object::new();
            js_sys::Reflect::set(&params, &"keyPath".into(), &key_path.into())
                .map_err(|thrown| engine_error(&thrown))?;
            entry
                .db
                .create_object_store_with_optional_parameters(name, params.unchecked_ref())
                .map(drop)
                .map_err(|thrown| engine_error(&thrown))
        })
    }

    fn transaction(
        &mut self,
        connection: ConnectionId,
        store: &str,
        mode: TransactionMode,
    ) -> EngineResult<TransactionId> {
        let idb_mode = match mode {
            TransactionMode::ReadOnly => IdbTransactionMode::Readonly,
            TransactionMode::ReadWrite => IdbTransactionMode::Readwrite,
        };
        let tx = self.with_connection(connection, |entry| {
            entry
                .db
                .transaction_with_str_and_mode(store, idb_mode)
                .map_err(|thrown| engine_error(&thrown))
        })?;
        tx.set_oncomplete(callback(self.handlers.transaction_complete.as_ref()));
        tx.set_onabort(callback(self.handlers.transaction_abort.as_ref()));

        let mut shared = self.shared.borrow_mut();
        let id = TransactionId::new(shared.next_id());
        shared.transactions.push(TransactionEntry {
            id,
            tx,
            store: store.to_string(),
            mode,
        });
        Ok(id)
    }

    fn request(
        &mut self,
        transaction: TransactionId,
        request: StoreRequest,
    ) -> EngineResult<RequestId> {
        let (tx, store_name, mode) = {
            let shared = self.shared.borrow();
            let entry = shared
                .transactions
                .iter()
                .find(|t| t.id == transaction)
                .ok_or_else(|| {
                    EngineError::TransactionInactive(format!("{transaction} has finished"))
                })?;
            (entry.tx.clone(), entry.store.clone(), entry.mode)
        };
        if mode == TransactionMode::ReadOnly && request.is_write() {
            return Err(EngineError::ReadOnly { store: store_name });
        }

        let store = tx
            .object_store(&store_name)
            .map_err(|thrown| engine_error(&thrown))?;
        let kind = RequestKind::of(&request);
        let issued = match &request {
            StoreRequest::Put(value) => store.put(&to_js(value)?),
            StoreRequest::Get(key) => store.get(&JsValue::from_str(key)),
            StoreRequest::GetAllKeys => store.get_all_keys(),
            StoreRequest::Delete(key) => store.delete(&JsValue::from_str(key)),
            StoreRequest::Clear => store.clear(),
        }
        .map_err(|thrown| engine_error(&thrown))?;
        issued.set_onsuccess(callback(self.handlers.request_success.as_ref()));
        issued.set_onerror(callback(self.handlers.request_error.as_ref()));

        let mut shared = self.shared.borrow_mut();
        let id = RequestId::new(shared.next_id());
        shared.requests.push(RequestEntry {
            id,
            transaction,
            request: issued,
            kind,
        });
        Ok(id)
    }

    fn poll_event(&mut self) -> Option<EngineEvent> {
        self.shared.borrow_mut().events.pop_front()
    }
}
