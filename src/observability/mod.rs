//! Structured logging setup.
//!
//! Everything in the crate logs through `tracing` macros; this module installs the
//! global subscriber (pretty, compact or JSON) with an `EnvFilter` built from
//! `RUST_LOG` or the `[observability.logging]` section.

mod tracing_init;

pub use tracing_init::*;
