//! # idbscope Testkit
//!
//! Test utilities for idbscope.
//!
//! This crate provides:
//! - [`ScriptedEngine`], an engine whose events are pushed by the test
//! - Session fixtures and sample records
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust
//! use idbscope_testkit::prelude::*;
//!
//! let mut test = TestSession::opened();
//! test.put(line_item("a1", 2));
//! assert_eq!(test.projection(), [line_item("a1", 2)]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod scripted;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::scripted::*;
}

pub use fixtures::*;
pub use generators::*;
pub use scripted::*;
