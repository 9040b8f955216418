use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Broadcast-based shutdown coordinator.
///
/// Loops subscribe and `select!` on the receiver next to their work. The
/// flag covers subscribers that arrive after the broadcast went out.
///
/// ```ignore
/// let shutdown = ShutdownSignal::new();
/// let mut rx = shutdown.subscribe();
///
/// tokio::select! {
///     _ = rx.recv() => { /* stop */ }
///     _ = interval.tick() => { /* work */ }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    trigger: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        Self {
            trigger,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Signal every subscriber. Returns false if shutdown was already
    /// triggered.
    pub fn trigger(&self) -> bool {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!("shutdown signal triggered");
            let _ = self.trigger.send(());
            true
        } else {
            debug!("shutdown already triggered");
            false
        }
    }

    /// Resolve once shutdown has been triggered, including before this call.
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        if self.is_triggered() {
            return;
        }
        let _ = rx.recv().await;
    }

    pub fn subscriber_count(&self) -> usize {
        self.trigger.receiver_count()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
