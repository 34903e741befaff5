//! allot-store
//!
//! The relational store shared by all collector loops. The [`Store`] trait
//! exposes read operations plus coarse-grained write operations; every write
//! operation is applied atomically, so a loop iteration can be killed at any
//! point without leaving partial state behind.
//!
//! Two implementations: [`PgStore`] runs each write in a PostgreSQL
//! transaction (with the schema in `migrations/`); [`MemStore`] keeps
//! everything under one in-process lock, for tests and development.

pub mod error;
pub mod mem;
pub mod ops;
pub mod pg;
pub mod rows;
pub mod store;

pub use error::StoreError;
pub use mem::MemStore;
pub use pg::PgStore;
pub use store::Store;
