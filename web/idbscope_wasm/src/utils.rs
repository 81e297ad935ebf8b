//! Utility functions for WASM setup.

use wasm_bindgen::JsCast;
use web_sys::{IdbFactory, WorkerGlobalScope};

/// Sets up the panic hook for better error messages.
///
/// This function is called automatically when the WASM module initializes.
pub fn set_panic_hook() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

/// Returns the `indexedDB` factory of the current window or worker.
pub fn idb_factory() -> Option<IdbFactory> {
    if let Some(window) = web_sys::window() {
        return window.indexed_db().ok().flatten();
    }
    js_sys::global()
        .dyn_into::<WorkerGlobalScope>()
        .ok()?
        .indexed_db()
        .ok()
        .flatten()
}
