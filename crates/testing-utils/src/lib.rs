//! # Portal Testing Utils
//!
//! Shared testing utilities for the portal worker crates: in-memory
//! implementations of every collaborator port, test data builders and
//! polling helpers for thread-based components.
//!
//! ```toml
//! [dev-dependencies]
//! portal-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
