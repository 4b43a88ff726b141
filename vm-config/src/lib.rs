//! Configuration for the vSphere snapshot tooling.
//!
//! Provides the explicit `VsphereConfig` value (connection, boundary defaults
//! and operation policy) and the loader that assembles it from a YAML file,
//! `VCLI_*` environment variables and caller overrides.

pub mod config;
pub mod loader;

pub use config::{
    mask_password, ConnectionConfig, ConnectionOverrides, DefaultsConfig, OperationPolicy,
    RetryPolicy, Source, VsphereConfig,
};
pub use loader::ConfigLoader;
