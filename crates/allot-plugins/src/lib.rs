//! allot-plugins
//!
//! The plugin boundary of the collector: one trait per capability set
//! (discovery, quota, capacity), a registry that wires configured plugin
//! names to instances at startup, and the built-in `static` discovery and
//! `unittest` quota/capacity plugins.
//!
//! Backend-specific plugins (the OpenStack clients) live outside this
//! repository and implement the same traits.

pub mod error;
pub mod interface;
pub mod registry;
pub mod static_discovery;
pub mod unittest;

pub use error::PluginError;
pub use interface::{
    BoxFuture, CapacityPlugin, ClusterRef, DiscoveryPlugin, ProjectRef, QuotaPlugin,
};
pub use registry::{BackendOptions, PluginRegistry};
