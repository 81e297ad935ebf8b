//! # idbscope Engine
//!
//! The asynchronous key-value engine capability driven by idbscope, and an
//! in-memory implementation of it.
//!
//! This crate provides the lowest-level abstraction of idbscope. An engine
//! is a browser-style persistent key-value store: named, versioned
//! databases holding object stores, accessed through short-lived
//! transactions, reporting every completion as an event.
//!
//! ## Design Principles
//!
//! - Engines are driven sans-IO: calls return ids, completions are polled
//! - Callbacks are delivered one at a time, in firing order
//! - Engines do not know about sessions, projections or event logs
//! - idbscope core owns all orchestration
//!
//! ## Available Engines
//!
//! - [`InMemoryEngine`] - Deterministic simulation for tests and the CLI
//!
//! ## Example
//!
//! ```rust
//! use idbscope_engine::{Engine, InMemoryEngine};
//!
//! let mut engine = InMemoryEngine::new();
//! engine.open("orders", 1).unwrap();
//! while let Some(event) = engine.poll_event() {
//!     println!("{event:?}");
//! }
//! assert_eq!(engine.database_version("orders"), Some(1));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod engine;
mod error;
mod memory;
mod types;

pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use memory::InMemoryEngine;
pub use types::{
    ConnectionEvent, ConnectionId, DeleteOutcome, EngineEvent, OpenOutcome, RequestId,
    RequestOutput, StoreRequest, TransactionId, TransactionMode, TransactionOutcome,
};
