//! allot-core
//!
//! Pure domain types: service and resource metadata, quota constraints,
//! distribution models, the configuration model, and the clock. Everything
//! here is plain data; database and HTTP concerns live in the other crates.

pub mod clock;
pub mod config;
pub mod constraints;
pub mod error;
pub mod models;
pub mod units;
