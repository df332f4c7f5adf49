//! Tracing initialization for embedding applications.
//!
//! This crate only instruments with `tracing::{debug,info,warn,error,trace}`
//! calls; it never installs a subscriber on its own (a library imposing a
//! global subscriber would fight whatever the embedding process already set
//! up). `init_tracing` is a convenience for binaries and tests that have
//! nothing else wiring up `tracing-subscriber` yet.

use tracing_subscriber::EnvFilter;

/// Install a `tracing-subscriber` `fmt` subscriber with an `EnvFilter` seeded
/// from `default_level`, overridable via `RUST_LOG`.
///
/// Safe to call more than once; a second call is a no-op (the underlying
/// `try_init` simply reports that a subscriber is already set).
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
