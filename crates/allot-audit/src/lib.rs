//! allot-audit
//!
//! Structured audit events for quota changes. Events are emitted via
//! `tracing` so that any configured log sink picks them up; a dedicated
//! audit-trail transport can subscribe to the `audit.*` fields without
//! this crate knowing about it.

pub mod events;

pub use events::QuotaChangeEvent;
