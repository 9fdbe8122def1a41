//! Findings Store Module
//!
//! Copy-on-commit storage of orphan candidates shared between the
//! reconciliation engine (single writer) and reporting readers.

pub mod findings;

pub use findings::*;
