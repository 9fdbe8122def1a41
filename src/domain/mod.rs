//! Domain Layer
//!
//! Core domain types and port traits shared by the reconciliation core
//! and its adapters.

pub mod ports;

pub use ports::*;
