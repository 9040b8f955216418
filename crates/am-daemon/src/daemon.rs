use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use am_bridge::adapter::SharedRegistry;
use am_bridge::http_api::{api_router, ApiState};
use am_core::config::Config;
use am_session::launch::ConfigLaunchResolver;
use am_session::pty::{ProcessSpawner, PtySpawner};
use am_session::registry::SessionRegistry;
use am_session::scrollback::ScrollbackSerializer;
use am_session::snapshot_store::FileSnapshotStore;
use am_session::snapshot_task::capture_all;

use crate::reaper::OrphanReaper;
use crate::shutdown::ShutdownSignal;

/// Background loop periods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonIntervals {
    pub reap_secs: u64,
    /// `None` when snapshots are disabled.
    pub snapshot_secs: Option<u64>,
}

impl DaemonIntervals {
    pub fn from_config(config: &Config) -> Self {
        Self {
            reap_secs: config.sessions.reap_interval_secs.max(1),
            snapshot_secs: config
                .snapshot
                .enabled
                .then_some(config.snapshot.interval_secs.max(1)),
        }
    }
}

/// The agentmux daemon.
///
/// Owns the session registry, serves the HTTP/WebSocket API and runs the
/// orphan sweep and snapshot loops until the `ShutdownSignal` fires.
pub struct Daemon {
    config: Config,
    registry: SharedRegistry,
    scrollback: Option<Arc<ScrollbackSerializer>>,
    api_state: Arc<ApiState>,
    intervals: DaemonIntervals,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Create a daemon whose sessions run in real pseudo-terminals.
    pub fn new(config: Config) -> Self {
        Self::with_spawner(config, Arc::new(PtySpawner))
    }

    pub fn with_spawner(config: Config, spawner: Arc<dyn ProcessSpawner>) -> Self {
        let scrollback = config.snapshot.enabled.then(|| {
            let dir = config.snapshot.resolved_dir();
            info!(dir = %dir.display(), "scrollback snapshots enabled");
            Arc::new(ScrollbackSerializer::new(Arc::new(FileSnapshotStore::new(dir))))
        });

        let mut registry = SessionRegistry::new(spawner);
        if let Some(serializer) = &scrollback {
            registry = registry.with_scrollback(serializer.clone(), true);
            registry.stage_recovery();
        }
        let registry: SharedRegistry = Arc::new(Mutex::new(registry));

        let mut api_state = ApiState::new(
            registry.clone(),
            Arc::new(ConfigLaunchResolver::from_config(&config)),
            config.terminal.clone(),
            config.sessions.orphan_timeout(),
        );
        if let Some(serializer) = &scrollback {
            api_state = api_state.with_scrollback(serializer.clone());
        }

        let intervals = DaemonIntervals::from_config(&config);
        Self {
            config,
            registry,
            scrollback,
            api_state: Arc::new(api_state),
            intervals,
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn api_state(&self) -> Arc<ApiState> {
        self.api_state.clone()
    }

    pub fn intervals(&self) -> &DaemonIntervals {
        &self.intervals
    }

    /// Returns a handle that can trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Bind `daemon.host:daemon.port` and run until shutdown.
    pub async fn run(&self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.daemon.host, self.config.daemon.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        self.run_with_listener(listener).await
    }

    /// Serve on a listener the caller bound (e.g. port 0 in tests) and run
    /// the background loops until shutdown.
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let bind_addr = listener.local_addr().context("listener has no local address")?;
        let router = api_router(self.api_state.clone());
        let api_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!(error = %e, "API server error");
            }
        });
        info!(
            %bind_addr,
            reap_secs = self.intervals.reap_secs,
            snapshot_secs = ?self.intervals.snapshot_secs,
            "agentmux daemon listening"
        );

        Self::run_loops(
            self.registry.clone(),
            self.scrollback.clone(),
            OrphanReaper::from_config(&self.config.sessions),
            self.intervals.clone(),
            self.shutdown.clone(),
        )
        .await;

        self.stop_sessions().await;
        api_handle.abort();
        info!("daemon stopped");
        Ok(())
    }

    async fn run_loops(
        registry: SharedRegistry,
        scrollback: Option<Arc<ScrollbackSerializer>>,
        reaper: OrphanReaper,
        intervals: DaemonIntervals,
        shutdown: ShutdownSignal,
    ) {
        let mut shutdown_rx = shutdown.subscribe();
        if shutdown.is_triggered() {
            return;
        }

        let mut reap_interval = tokio::time::interval(Duration::from_secs(intervals.reap_secs));
        // Disabled snapshots still need an interval for select!; its branch
        // is switched off below.
        let mut snapshot_interval = tokio::time::interval(Duration::from_secs(
            intervals.snapshot_secs.unwrap_or(u64::from(u32::MAX)),
        ));
        reap_interval.tick().await;
        snapshot_interval.tick().await;

        loop {
            tokio::select! {
                _ = reap_interval.tick() => {
                    reaper.sweep(&registry).await;
                }
                _ = snapshot_interval.tick(), if scrollback.is_some() => {
                    if let Some(serializer) = &scrollback {
                        capture_all(&registry, serializer).await;
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received, stopping background loops");
                    break;
                }
            }
        }
    }

    /// Final snapshot pass, then close every viewer and kill every process.
    async fn stop_sessions(&self) {
        if let Some(serializer) = &self.scrollback {
            let report = capture_all(&self.registry, serializer).await;
            if report.failed > 0 {
                warn!(failed = report.failed, "final snapshot pass had failures");
            }
        }

        let mut registry = self.registry.lock().await;
        for summary in registry.list() {
            if let Some(connection) = registry.active_connection(summary.id) {
                connection.close();
            }
        }
        let killed = registry.kill_all();
        info!(killed, "sessions stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_follow_config() {
        let mut config = Config::default();
        assert_eq!(
            DaemonIntervals::from_config(&config),
            DaemonIntervals {
                reap_secs: 300,
                snapshot_secs: None,
            }
        );

        config.snapshot.enabled = true;
        config.snapshot.interval_secs = 5;
        config.sessions.reap_interval_secs = 0;
        assert_eq!(
            DaemonIntervals::from_config(&config),
            DaemonIntervals {
                reap_secs: 1,
                snapshot_secs: Some(5),
            }
        );
    }
}
