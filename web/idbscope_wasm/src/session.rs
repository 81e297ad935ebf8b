//! JavaScript-facing session.

use crate::engine::BrowserEngine;
use crate::error::WasmResult;
use idbscope_core::{DatabaseIdentity, LifecycleEvent, Record, Session, SessionConfig};
use serde::Serialize;
use std::cell::RefCell;
use std::rc::Rc;
use wasm_bindgen::prelude::*;

struct Inner {
    session: Session<BrowserEngine>,
    listener: Option<js_sys::Function>,
    cursor: u64,
}

fn to_js<T: Serialize>(value: &T) -> WasmResult<JsValue> {
    Ok(value.serialize(&serde_wasm_bindgen::Serializer::json_compatible())?)
}

/// Dispatches queued engine events, then hands new log entries to the
/// listener with no borrow held, so the listener may issue commands.
fn pump(inner: &Rc<RefCell<Inner>>) {
    let (listener, events) = {
        let Ok(mut state) = inner.try_borrow_mut() else {
            return;
        };
        state.session.run_until_idle();
        let events = state.session.event_log().since(state.cursor);
        state.cursor = state.session.event_log().latest_sequence();
        (state.listener.clone(), events)
    };
    let Some(listener) = listener else {
        return;
    };
    for event in events {
        let delivered = to_js(&event)
            .map_err(JsValue::from)
            .and_then(|value| listener.call1(&JsValue::NULL, &value));
        if let Err(err) = delivered {
            web_sys::console::error_2(&"idbscope: event listener failed".into(), &err);
        }
    }
}

/// A session over the browser's IndexedDB.
///
/// Commands return as soon as they are issued; their effects arrive through
/// the callback registered with `onEvent` and are visible in `snapshot`.
#[wasm_bindgen]
pub struct WebSession {
    inner: Rc<RefCell<Inner>>,
}

#[wasm_bindgen]
impl WebSession {
    /// Creates a session that ensures `collections` during every upgrade.
    #[wasm_bindgen(constructor)]
    pub fn new(collections: Vec<String>, key_path: Option<String>) -> WasmResult<WebSession> {
        let engine = BrowserEngine::new()?;
        let config = SessionConfig::new()
            .collections(collections)
            .key_path(key_path.unwrap_or_else(|| "id".to_string()));
        let inner = Rc::new(RefCell::new(Inner {
            session: Session::with_config(engine, config),
            listener: None,
            cursor: 0,
        }));

        let weak = Rc::downgrade(&inner);
        inner
            .borrow()
            .session
            .engine()
            .set_waker(Rc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    pump(&inner);
                }
            }));
        Ok(WebSession { inner })
    }

    /// Registers the function called with every new event log entry.
    #[wasm_bindgen(js_name = onEvent)]
    pub fn on_event(&self, listener: js_sys::Function) {
        self.inner.borrow_mut().listener = Some(listener);
    }

    /// Opens `name` at `version`, closing any open connection first.
    pub fn open(&self, name: String, version: u32) -> WasmResult<()> {
        self.command(|session| {
            session.open(DatabaseIdentity::new(name, u64::from(version))?)?;
            Ok(())
        })
    }

    /// Deletes database `name`.
    pub fn delete(&self, name: String) -> WasmResult<()> {
        self.command(|session| {
            session.delete(&name)?;
            Ok(())
        })
    }

    /// Makes `name` the active collection.
    pub fn select(&self, name: String) -> WasmResult<()> {
        self.command(|session| Ok(session.select_collection(&name)?))
    }

    /// Stores a plain object in the active collection.
    pub fn put(&self, record: JsValue) -> WasmResult<()> {
        let value: serde_json::Value = serde_wasm_bindgen::from_value(record)?;
        self.command(|session| {
            let record = Record::from_value(value, &session.config().key_path)?;
            session.put(record)?;
            Ok(())
        })
    }

    /// Deletes the record with primary key `id`.
    #[wasm_bindgen(js_name = deleteRecord)]
    pub fn delete_record(&self, id: String) -> WasmResult<()> {
        self.command(|session| {
            session.delete_record(&id)?;
            Ok(())
        })
    }

    /// Deletes every record of the active collection.
    pub fn clear(&self) -> WasmResult<()> {
        self.command(|session| {
            session.clear()?;
            Ok(())
        })
    }

    /// Re-reads the active collection.
    pub fn refresh(&self) -> WasmResult<()> {
        self.command(|session| Ok(session.refresh()?))
    }

    /// Empties the event log.
    #[wasm_bindgen(js_name = clearEvents)]
    pub fn clear_events(&self) {
        self.inner.borrow_mut().session.clear_event_log();
    }

    /// Controller state, e.g. `"open"`.
    pub fn state(&self) -> String {
        self.inner.borrow().session.state().to_string()
    }

    /// Collections of the open database.
    pub fn collections(&self) -> Vec<String> {
        self.inner.borrow().session.collections().to_vec()
    }

    /// Every held event log entry.
    pub fn events(&self) -> WasmResult<JsValue> {
        let events: Vec<LifecycleEvent> = self.inner.borrow().session.events();
        to_js(&events)
    }

    /// State, collections, projection and log counters at this instant.
    pub fn snapshot(&self) -> WasmResult<JsValue> {
        to_js(&self.inner.borrow().session.snapshot())
    }
}

impl WebSession {
    /// Runs a command, then delivers whatever it recorded.
    fn command<T>(
        &self,
        f: impl FnOnce(&mut Session<BrowserEngine>) -> WasmResult<T>,
    ) -> WasmResult<T> {
        let result = {
            let mut state = self.inner.borrow_mut();
            f(&mut state.session)
        };
        pump(&self.inner);
        result
    }
}

impl std::fmt::Debug for WebSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_borrow() {
            Ok(state) => f
                .debug_struct("WebSession")
                .field("session", &state.session)
                .finish(),
            Err(_) => f.write_str("WebSession { <busy> }"),
        }
    }
}
