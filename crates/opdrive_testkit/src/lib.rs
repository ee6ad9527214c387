//! # opdrive testkit
//!
//! Test utilities for the opdrive transaction driver.
//!
//! This crate provides:
//! - A fully wired driver pipeline ([`DriverHarness`])
//! - A scriptable operation that records its hooks ([`TestOperation`])
//! - Inline, manual and rejecting collaborator doubles
//! - Property-based generators of event orders and thread schedules
//! - Stress runs over the threaded pipeline
//!
//! ## Usage
//!
//! ```rust,ignore
//! use opdrive_testkit::prelude::*;
//!
//! #[test]
//! fn leader_commits() {
//!     let harness = DriverHarness::new();
//!     let launched = harness.start_leader(TestOperation::new());
//!     harness.consensus.commit_all();
//!     assert!(launched.reply.wait().is_ok());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod collaborators;
pub mod fixtures;
pub mod generators;
pub mod operations;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::collaborators::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::operations::*;
    pub use crate::stress::*;
}

pub use collaborators::*;
pub use fixtures::*;
pub use generators::*;
pub use operations::*;
pub use stress::*;
