//! The agentmux daemon: serves terminal sessions over HTTP/WebSocket and
//! runs the background upkeep around them.
//!
//! - orphan sweeps over the session registry
//! - periodic scrollback snapshots (opt-in)
//! - cooperative shutdown

pub mod daemon;
pub mod reaper;
pub mod shutdown;
