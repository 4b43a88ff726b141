//! Shared runtime plumbing for the snapshot tooling crates.

pub mod tracing_init;
