//! # idbscope WASM
//!
//! WebAssembly bindings for idbscope over the browser's own IndexedDB.
//!
//! This crate provides:
//! - [`BrowserEngine`], the IndexedDB adapter behind the engine trait
//! - [`WebSession`], a JavaScript-friendly session via wasm-bindgen
//! - [`is_supported`], the probe for an `indexedDB` factory
//!
//! ## Usage
//!
//! ```javascript
//! import init, { WebSession, isSupported } from 'idbscope_wasm';
//!
//! async function main() {
//!     await init();
//!     if (!isSupported()) {
//!         return;
//!     }
//!
//!     const session = new WebSession(["line-items"]);
//!     session.onEvent((event) => console.log(event.kind, event.target));
//!     session.open("orders", 1);
//!     // once "success" is logged:
//!     session.put({ id: "a1", qty: 2 });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod convert;
mod engine;
mod error;
mod session;
mod utils;

pub use engine::{BrowserEngine, Waker};
pub use error::*;
pub use session::*;

use wasm_bindgen::prelude::*;

/// Initialize the WASM module.
///
/// This sets up panic hooks for better error messages in the browser console.
#[wasm_bindgen(start)]
pub fn init() {
    utils::set_panic_hook();
}

/// Returns true if an `indexedDB` factory is available.
#[wasm_bindgen(js_name = isSupported)]
pub fn is_supported() -> bool {
    utils::idb_factory().is_some()
}

/// Returns the library version.
#[wasm_bindgen]
pub fn version() -> String {
    idbscope_core::VERSION.to_string()
}
