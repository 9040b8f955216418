//! Periodic capture of every mirrored session.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::registry::SessionRegistry;
use crate::scrollback::ScrollbackSerializer;

/// Outcome of one capture pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureReport {
    pub saved: usize,
    pub failed: usize,
    /// Sessions destroyed while their snapshot was being written.
    pub discarded: usize,
}

/// Capture and save a snapshot of every session that has a mirror.
///
/// The registry lock is held only to collect the mirrors. Saves run on the
/// blocking pool, one session at a time, yielding between sessions. A
/// failure for one session is logged and the pass continues.
pub async fn capture_all<C: Clone + Send>(
    registry: &Mutex<SessionRegistry<C>>,
    serializer: &Arc<ScrollbackSerializer>,
) -> CaptureReport {
    let mirrors = registry.lock().await.mirrors();
    let mut report = CaptureReport::default();

    for entry in mirrors {
        let session_id = entry.session_id;
        let snapshot = ScrollbackSerializer::capture_shared(session_id, &entry.mirror)
            .labelled(entry.work_key, entry.agent_kind);
        let save = {
            let serializer = serializer.clone();
            tokio::task::spawn_blocking(move || serializer.save_state(&snapshot)).await
        };
        match save {
            Ok(Ok(())) => {
                // A destroy that raced the save must not leave a snapshot behind.
                if registry.lock().await.get(session_id).is_none() {
                    if let Err(e) = serializer.delete_state(session_id) {
                        warn!(%session_id, error = %e, "failed to discard snapshot of destroyed session");
                    }
                    report.discarded += 1;
                } else {
                    report.saved += 1;
                }
            }
            Ok(Err(e)) => {
                warn!(%session_id, error = %e, "failed to save scrollback snapshot");
                report.failed += 1;
            }
            Err(e) => {
                warn!(%session_id, error = %e, "snapshot task panicked");
                report.failed += 1;
            }
        }
        tokio::task::yield_now().await;
    }

    if report.saved + report.failed + report.discarded > 0 {
        info!(
            saved = report.saved,
            failed = report.failed,
            discarded = report.discarded,
            "scrollback capture pass complete"
        );
    } else {
        debug!("scrollback capture pass: no mirrored sessions");
    }
    report
}
