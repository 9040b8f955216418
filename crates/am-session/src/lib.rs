//! Session core: the registry of long-lived agent terminals, the PTY
//! process wrapper, and scrollback snapshot/recovery.

pub mod launch;
pub mod pty;
pub mod registry;
pub mod scrollback;
pub mod snapshot_store;
pub mod snapshot_task;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
