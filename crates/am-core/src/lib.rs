//! Shared configuration and domain types for agentmux.
//!
//! - [`config`]: TOML configuration loaded from `~/.agentmux/config.toml`
//! - [`types`]: agent kinds and work keys that identify a terminal session

pub mod config;
pub mod types;
