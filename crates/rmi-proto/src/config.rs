//! Configuration for a registry (and, therefore, its connections).

use std::time::Duration;

use derive_builder::Builder;

/// Configuration record for one [`Registry`](crate::Registry).
///
/// All knobs have defaults; `RegistryConfig::default()` is a working
/// configuration.  Use [`RegistryConfig::builder`] to override fields.
#[derive(Clone, Debug, Builder)]
#[builder(setter(into))]
#[non_exhaustive]
pub struct RegistryConfig {
    /// Grace period between an object becoming unreferenced and its
    /// scheduled unpublish firing.  Also the budget a stub spends on
    /// reconnection before surfacing a failure.
    #[builder(default = "Duration::from_secs(10)")]
    pub latency: Duration,

    /// Upper bound on how long an unreferenced, unnamed object may linger
    /// before the periodic reaper collects it.
    #[builder(default = "Duration::from_secs(600)")]
    pub lease: Duration,

    /// Capacity of each exposed object's invocation cache.
    #[builder(default = "50")]
    pub invocation_cache_capacity: usize,

    /// When true, every dial opens a fresh connection instead of reusing a
    /// pooled one to the same peer registry.
    #[builder(default)]
    pub multi_connection: bool,

    /// When true, connection-related invocation failures are not surfaced:
    /// primitive return types yield their zero value and reference types
    /// yield null.
    #[builder(default)]
    pub suppress_faults: bool,

    /// Replacement kind name stamped onto surfaced remote errors, if any.
    #[builder(default)]
    pub remote_error_kind: Option<String>,

    /// When true, unpublished service objects found inside argument graphs
    /// are auto-published if one of their interfaces has been exported.
    #[builder(default = "true")]
    pub automatic_referencing: bool,

    /// When true, codebase hints are exchanged with peers and forwarded to
    /// the codebase resolver.
    #[builder(default)]
    pub code_downloading: bool,

    /// Fault simulation: when set, each connection handler disposes itself
    /// after a random lifetime up to this bound.  For tests.
    #[builder(default)]
    pub fault_sim_max_life: Option<Duration>,

    /// Prefix for auto-generated object identifiers.
    #[builder(default = "\"###\".into()")]
    pub auto_id_prefix: String,
}

impl RegistryConfig {
    /// Return a new builder with every field at its default.
    pub fn builder() -> RegistryConfigBuilder {
        RegistryConfigBuilder::default()
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfigBuilder::default()
            .build()
            .expect("default configuration was not buildable")
    }
}
