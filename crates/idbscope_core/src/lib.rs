//! # idbscope Core
//!
//! The session controller that makes an asynchronous, callback-driven
//! key-value engine safe and observable to drive interactively.
//!
//! This crate provides:
//! - [`ConnectionController`]: owns the single live connection and its
//!   open/upgrade/blocked/versionchange/close lifecycle
//! - [`SchemaMigrator`]: creates collections inside upgrade callbacks
//! - [`StoreBrowser`]: lists collections and tracks the active one
//! - [`TransactionCoordinator`]: short-lived transactions and a projection
//!   refreshed only after commits
//! - [`EventLog`]: the ordered, observable record of every callback
//! - [`Session`]: the dispatcher tying them to an [`idbscope_engine::Engine`]
//!
//! ## Invariants
//!
//! - At most one connection handle is live at any time
//! - Every close path records exactly one `close` event
//! - The projection only ever reflects committed engine state
//! - Results of a superseded refresh are discarded
//!
//! ## Example
//!
//! ```rust
//! use idbscope_core::{ConnectionState, DatabaseIdentity, EventKind, Session, SessionConfig};
//! use idbscope_engine::InMemoryEngine;
//!
//! let mut session = Session::with_config(
//!     InMemoryEngine::new(),
//!     SessionConfig::new().collection("line-items"),
//! );
//! session.open(DatabaseIdentity::new("orders", 1).unwrap()).unwrap();
//! session.run_until_idle();
//!
//! assert_eq!(session.state(), ConnectionState::Open);
//! assert_eq!(
//!     session.event_log().kinds(),
//!     vec![EventKind::UpgradeNeeded, EventKind::Success]
//! );
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod browser;
mod config;
mod connection;
mod coordinator;
mod error;
mod event_log;
mod migrator;
mod session;
mod types;

pub use browser::StoreBrowser;
pub use config::SessionConfig;
pub use connection::{ConnectionController, ConnectionState};
pub use coordinator::TransactionCoordinator;
pub use error::{CoreError, CoreResult, ErrorClass};
pub use event_log::{EventKind, EventLog, EventOrigin, LifecycleEvent};
pub use migrator::{MigrationReport, SchemaMigrator};
pub use session::{Session, SessionSnapshot};
pub use types::{CollectionName, ConnectionHandle, DatabaseIdentity, Record};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
