//! Orphan sweep over the session registry.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use am_core::config::SessionsConfig;
use am_session::registry::{SessionId, SessionRegistry};

/// Result of one sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Sessions with no viewer for longer than the orphan timeout.
    pub orphans: Vec<SessionId>,
    /// Detached sessions whose process has exited.
    pub dead: Vec<SessionId>,
    pub reaped: usize,
    pub timestamp: DateTime<Utc>,
}

/// Finds abandoned sessions and, when `destroy` is set, destroys them.
#[derive(Debug, Clone)]
pub struct OrphanReaper {
    orphan_timeout: Duration,
    destroy: bool,
}

impl OrphanReaper {
    pub fn new(orphan_timeout: Duration, destroy: bool) -> Self {
        Self {
            orphan_timeout,
            destroy,
        }
    }

    pub fn from_config(config: &SessionsConfig) -> Self {
        Self::new(config.orphan_timeout(), config.reap_orphans)
    }

    pub fn orphan_timeout(&self) -> Duration {
        self.orphan_timeout
    }

    pub async fn sweep<C: Clone>(&self, registry: &Mutex<SessionRegistry<C>>) -> SweepReport {
        self.sweep_at(registry, Utc::now()).await
    }

    /// Sweep as of `now`. Connected sessions are never touched.
    pub async fn sweep_at<C: Clone>(
        &self,
        registry: &Mutex<SessionRegistry<C>>,
        now: DateTime<Utc>,
    ) -> SweepReport {
        let mut registry = registry.lock().await;
        let orphans = registry.orphans_at(self.orphan_timeout, now);
        let dead: Vec<SessionId> = registry
            .list()
            .into_iter()
            .filter(|s| s.spawned && !s.alive && !s.connected)
            .map(|s| s.id)
            .collect();

        let mut reaped = 0;
        if self.destroy {
            let mut targets = orphans.clone();
            targets.extend(dead.iter().filter(|id| !orphans.contains(id)));
            for id in targets {
                if registry.destroy(id) {
                    reaped += 1;
                    warn!(session_id = %id, "abandoned session reaped");
                }
            }
        }

        if orphans.is_empty() && dead.is_empty() {
            debug!("orphan sweep found nothing");
        } else {
            info!(
                orphans = orphans.len(),
                dead = dead.len(),
                reaped,
                "orphan sweep completed"
            );
        }

        SweepReport {
            orphans,
            dead,
            reaped,
            timestamp: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use am_core::types::{AgentKind, WorkKey};
    use am_session::pty::SpawnRequest;
    use am_session::registry::ViewerId;
    use am_session::testing::ScriptedSpawner;
    use std::sync::Arc;

    type Registry = Mutex<SessionRegistry<u32>>;

    fn setup() -> (Registry, Arc<ScriptedSpawner>) {
        let spawner = Arc::new(ScriptedSpawner::new());
        (Mutex::new(SessionRegistry::new(spawner.clone())), spawner)
    }

    fn request() -> SpawnRequest {
        SpawnRequest {
            command: "claude".into(),
            args: vec![],
            cols: 80,
            rows: 24,
        }
    }

    async fn spawned_session(registry: &Registry, key: &str) -> SessionId {
        let mut reg = registry.lock().await;
        let id = reg.create(WorkKey::new(key).unwrap(), AgentKind::Claude, "/tmp");
        reg.spawn_process(id, request()).unwrap();
        id
    }

    fn later() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::hours(2)
    }

    #[tokio::test]
    async fn report_only_by_default() {
        let (registry, spawner) = setup();
        let id = spawned_session(&registry, "feat").await;

        let report = OrphanReaper::new(Duration::from_secs(3600), false)
            .sweep_at(&registry, later())
            .await;
        assert_eq!(report.orphans, vec![id]);
        assert!(report.dead.is_empty());
        assert_eq!(report.reaped, 0);
        assert_eq!(registry.lock().await.len(), 1);
        assert_eq!(spawner.last().unwrap().kill_calls(), 0);
    }

    #[tokio::test]
    async fn destroys_orphans_when_enabled() {
        let (registry, spawner) = setup();
        spawned_session(&registry, "feat").await;

        let report = OrphanReaper::new(Duration::from_secs(3600), true)
            .sweep_at(&registry, later())
            .await;
        assert_eq!(report.reaped, 1);
        assert!(registry.lock().await.is_empty());
        assert_eq!(spawner.last().unwrap().kill_calls(), 1);
    }

    #[tokio::test]
    async fn connected_sessions_are_left_alone() {
        let (registry, _spawner) = setup();
        let id = spawned_session(&registry, "feat").await;
        registry
            .lock()
            .await
            .attach(id, ViewerId::new_v4(), 7)
            .unwrap();

        let report = OrphanReaper::new(Duration::ZERO, true)
            .sweep_at(&registry, later())
            .await;
        assert!(report.orphans.is_empty());
        assert_eq!(report.reaped, 0);
        assert_eq!(registry.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn dead_detached_sessions_are_reported_before_timeout() {
        let (registry, spawner) = setup();
        let id = spawned_session(&registry, "feat").await;
        spawner.last().unwrap().finish(0);

        let reaper = OrphanReaper::new(Duration::from_secs(3600), false);
        let report = reaper.sweep_at(&registry, Utc::now()).await;
        assert!(report.orphans.is_empty());
        assert_eq!(report.dead, vec![id]);

        let report = OrphanReaper::new(Duration::from_secs(3600), true)
            .sweep_at(&registry, Utc::now())
            .await;
        assert_eq!(report.reaped, 1);
        assert!(registry.lock().await.is_empty());
    }

    #[test]
    fn from_config_uses_session_settings() {
        let config = SessionsConfig {
            orphan_timeout_secs: 90,
            reap_interval_secs: 10,
            reap_orphans: true,
        };
        let reaper = OrphanReaper::from_config(&config);
        assert_eq!(reaper.orphan_timeout(), Duration::from_secs(90));
        assert!(reaper.destroy);
    }
}
