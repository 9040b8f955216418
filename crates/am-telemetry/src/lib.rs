//! Logging setup shared by agentmux binaries and tests.
//!
//! Wraps `tracing-subscriber` so every entry point configures output the
//! same way: an `EnvFilter` seeded from config (overridable with `RUST_LOG`)
//! and either human-readable or JSON formatting.

pub mod logging;
