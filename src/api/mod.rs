//! API Module
//!
//! REST surface over the findings store and the scan scheduler.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
