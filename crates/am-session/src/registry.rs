//! Session lifecycle registry.
//!
//! A session is the long-lived terminal for one (work key, agent kind) pair.
//! It outlives any single connection: viewers attach and detach, and at most
//! one viewer is active at a time. The process is spawned lazily, exactly
//! once, and only [`SessionRegistry::destroy`] kills it.
//!
//! With scrollback attached, snapshots left by a previous run are staged at
//! startup and handed to the next session created for the same work key and
//! agent kind.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use am_core::types::{AgentKind, WorkKey};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pty::{ListenerId, ProcessSpawner, PtyError, SpawnRequest, TerminalProcess};
use crate::scrollback::{Dimensions, ScrollbackSerializer, SharedTerminal, Snapshot};

pub type SessionId = Uuid;
pub type ViewerId = Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// A session's process is spawned at most once; asking again is a
    /// caller bug.
    #[error("session {0} already has a process")]
    AlreadySpawned(SessionId),

    #[error("failed to spawn process for session {id}: {source}")]
    Spawn {
        id: SessionId,
        #[source]
        source: PtyError,
    },

    #[error("viewer was displaced from session {0} while connecting")]
    Displaced(SessionId),
}

pub type Result<T> = std::result::Result<T, SessionError>;

// ---------------------------------------------------------------------------
// ListenerHandle
// ---------------------------------------------------------------------------

/// An output subscription wired to the active connection. Removing the
/// handle unsubscribes it from the process.
pub struct ListenerHandle {
    id: ListenerId,
    process: Arc<dyn TerminalProcess>,
}

impl ListenerHandle {
    pub fn new(process: Arc<dyn TerminalProcess>, id: ListenerId) -> Self {
        Self { id, process }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn remove(self) -> bool {
        self.process.unsubscribe(self.id)
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle").field("id", &self.id).finish()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ViewerState<C> {
    pub connected: bool,
    pub active_viewer_id: Option<ViewerId>,
    pub active_connection: Option<C>,
    /// `None` while connected.
    pub disconnected_at: Option<DateTime<Utc>>,
}

pub struct Session<C> {
    id: SessionId,
    work_key: WorkKey,
    agent_kind: AgentKind,
    working_directory: PathBuf,
    process: Option<Arc<dyn TerminalProcess>>,
    mirror: Option<SharedTerminal>,
    viewer: ViewerState<C>,
    listener_handles: Vec<ListenerHandle>,
    /// Snapshot from a previous run, not yet shown to a viewer.
    recovered: Option<Snapshot>,
    created_at: DateTime<Utc>,
}

impl<C> Session<C> {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn work_key(&self) -> &WorkKey {
        &self.work_key
    }

    pub fn agent_kind(&self) -> AgentKind {
        self.agent_kind
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn process(&self) -> Option<&Arc<dyn TerminalProcess>> {
        self.process.as_ref()
    }

    pub fn mirror(&self) -> Option<&SharedTerminal> {
        self.mirror.as_ref()
    }

    pub fn viewer(&self) -> &ViewerState<C> {
        &self.viewer
    }

    pub fn listener_count(&self) -> usize {
        self.listener_handles.len()
    }

    pub fn recovered(&self) -> Option<&Snapshot> {
        self.recovered.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Human-readable name sent to viewers in the handshake.
    pub fn display_name(&self) -> String {
        format!("{} [{}]", self.work_key, self.agent_kind)
    }

    fn unwire_listeners(&mut self) -> usize {
        let handles = std::mem::take(&mut self.listener_handles);
        let count = handles.len();
        for handle in handles {
            handle.remove();
        }
        count
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            work_key: self.work_key.clone(),
            agent_kind: self.agent_kind,
            name: self.display_name(),
            working_directory: self.working_directory.display().to_string(),
            connected: self.viewer.connected,
            spawned: self.process.is_some(),
            alive: self.process.as_ref().is_some_and(|p| p.is_alive()),
            pid: self.process.as_ref().and_then(|p| p.pid()),
            created_at: self.created_at,
            disconnected_at: self.viewer.disconnected_at,
        }
    }
}

impl<C> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("work_key", &self.work_key)
            .field("agent_kind", &self.agent_kind)
            .field("spawned", &self.process.is_some())
            .field("connected", &self.viewer.connected)
            .finish()
    }
}

/// Serializable view of a session for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub work_key: WorkKey,
    pub agent_kind: AgentKind,
    pub name: String,
    pub working_directory: String,
    pub connected: bool,
    pub spawned: bool,
    pub alive: bool,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
}

/// A session's mirror with the labels its snapshot is saved under.
#[derive(Clone)]
pub struct MirrorEntry {
    pub session_id: SessionId,
    pub work_key: WorkKey,
    pub agent_kind: AgentKind,
    pub mirror: SharedTerminal,
}

// ---------------------------------------------------------------------------
// SpawnPlan
// ---------------------------------------------------------------------------

/// Everything needed to start a session's process, taken under the registry
/// lock so the spawn itself can run without holding it. Hand the result to
/// [`SessionRegistry::install_process`].
pub struct SpawnPlan {
    session_id: SessionId,
    request: SpawnRequest,
    working_directory: PathBuf,
    mirror: Option<SharedTerminal>,
    spawner: Arc<dyn ProcessSpawner>,
}

impl SpawnPlan {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Start the process. Blocks while the child is forked.
    pub fn spawn(&self) -> Result<Arc<dyn TerminalProcess>> {
        self.spawner
            .spawn(&self.request, &self.working_directory, self.mirror.clone())
            .map_err(|source| SessionError::Spawn {
                id: self.session_id,
                source,
            })
    }
}

impl std::fmt::Debug for SpawnPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnPlan")
            .field("session_id", &self.session_id)
            .field("command", &self.request.command)
            .field("mirrored", &self.mirror.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SessionRegistry
// ---------------------------------------------------------------------------

/// Owns every session, keyed by id. `C` is the connection handle type the
/// transport layer hands in on attach.
pub struct SessionRegistry<C> {
    sessions: HashMap<SessionId, Session<C>>,
    spawner: Arc<dyn ProcessSpawner>,
    scrollback: Option<Arc<ScrollbackSerializer>>,
    mirror_terminals: bool,
    /// Snapshots from a previous run waiting for their pair to come back.
    recovered: HashMap<(WorkKey, AgentKind), Snapshot>,
}

impl<C: Clone> SessionRegistry<C> {
    pub fn new(spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self {
            sessions: HashMap::new(),
            spawner,
            scrollback: None,
            mirror_terminals: false,
            recovered: HashMap::new(),
        }
    }

    /// Attach a scrollback serializer. Destroyed sessions have their
    /// snapshot deleted; with `mirror_terminals` every spawned process also
    /// feeds an off-screen terminal.
    pub fn with_scrollback(mut self, serializer: Arc<ScrollbackSerializer>, mirror_terminals: bool) -> Self {
        self.scrollback = Some(serializer);
        self.mirror_terminals = mirror_terminals;
        self
    }

    pub fn scrollback(&self) -> Option<&Arc<ScrollbackSerializer>> {
        self.scrollback.as_ref()
    }

    /// Load the stored snapshots and keep the newest one per (work key,
    /// agent kind) pair for recovery. Unlabelled and superseded snapshots
    /// are deleted. Returns how many pairs are staged.
    pub fn stage_recovery(&mut self) -> usize {
        let Some(serializer) = self.scrollback.clone() else {
            return 0;
        };
        let mut stale = Vec::new();
        for snapshot in serializer.load_all() {
            if self.sessions.contains_key(&snapshot.session_id) {
                continue;
            }
            let Some((work_key, agent_kind)) = snapshot.label().map(|(k, a)| (k.clone(), a)) else {
                stale.push(snapshot.session_id);
                continue;
            };
            match self.recovered.entry((work_key, agent_kind)) {
                Entry::Occupied(mut entry) => {
                    if snapshot.timestamp > entry.get().timestamp {
                        stale.push(entry.insert(snapshot).session_id);
                    } else {
                        stale.push(snapshot.session_id);
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(snapshot);
                }
            }
        }

        for id in &stale {
            if let Err(e) = serializer.delete_state(*id) {
                warn!(session_id = %id, error = %e, "failed to delete stale snapshot");
            }
        }
        info!(
            staged = self.recovered.len(),
            discarded = stale.len(),
            "scrollback recovery staged"
        );
        self.recovered.len()
    }

    /// Re-key the staged snapshot for the pair to the new session `id`.
    fn claim_recovered(&mut self, id: SessionId, work_key: &WorkKey, agent_kind: AgentKind) -> Option<Snapshot> {
        let previous = self.recovered.remove(&(work_key.clone(), agent_kind))?;
        let serializer = self.scrollback.as_ref()?;
        let previous_id = previous.session_id;
        let snapshot = Snapshot {
            session_id: id,
            ..previous
        };
        match serializer.save_state(&snapshot) {
            Ok(()) => {
                if let Err(e) = serializer.delete_state(previous_id) {
                    warn!(session_id = %previous_id, error = %e, "failed to delete re-keyed snapshot");
                }
            }
            Err(e) => warn!(session_id = %id, error = %e, "failed to re-key recovered snapshot"),
        }
        info!(
            session_id = %id,
            previous_session = %previous_id,
            lines = snapshot.buffer_lines.len(),
            "scrollback recovered"
        );
        Some(snapshot)
    }

    /// Always creates a new session; callers find before creating.
    pub fn create(
        &mut self,
        work_key: WorkKey,
        agent_kind: AgentKind,
        working_directory: impl Into<PathBuf>,
    ) -> SessionId {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let recovered = self.claim_recovered(id, &work_key, agent_kind);
        let session = Session {
            id,
            work_key,
            agent_kind,
            working_directory: working_directory.into(),
            process: None,
            mirror: None,
            viewer: ViewerState {
                connected: false,
                active_viewer_id: None,
                active_connection: None,
                disconnected_at: Some(now),
            },
            listener_handles: Vec::new(),
            recovered,
            created_at: now,
        };
        info!(
            session_id = %id,
            work_key = %session.work_key,
            agent = %agent_kind,
            cwd = %session.working_directory.display(),
            "session created"
        );
        self.sessions.insert(id, session);
        id
    }

    pub fn find(&self, work_key: &WorkKey, agent_kind: AgentKind) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|s| &s.work_key == work_key && s.agent_kind == agent_kind)
            .map(|s| s.id)
    }

    /// Returns the existing session for the pair, or creates one. The flag
    /// is true when a new session was created.
    pub fn find_or_create(
        &mut self,
        work_key: &WorkKey,
        agent_kind: AgentKind,
        working_directory: impl FnOnce() -> PathBuf,
    ) -> (SessionId, bool) {
        match self.find(work_key, agent_kind) {
            Some(id) => (id, false),
            None => (
                self.create(work_key.clone(), agent_kind, working_directory()),
                true,
            ),
        }
    }

    pub fn get(&self, id: SessionId) -> Option<&Session<C>> {
        self.sessions.get(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self.sessions.values().map(Session::summary).collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Bind `connection` as the active viewer. If another connection was
    /// bound it is detached and returned so the caller can notify it.
    pub fn attach(&mut self, id: SessionId, viewer_id: ViewerId, connection: C) -> Result<Option<C>> {
        let session = self.sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;

        let previous = if session.viewer.connected {
            session.viewer.active_connection.take()
        } else {
            None
        };
        if previous.is_some() {
            let unwired = session.unwire_listeners();
            info!(
                session_id = %id,
                previous_viewer = ?session.viewer.active_viewer_id,
                new_viewer = %viewer_id,
                unwired,
                "viewer takeover"
            );
        }

        session.viewer = ViewerState {
            connected: true,
            active_viewer_id: Some(viewer_id),
            active_connection: Some(connection),
            disconnected_at: None,
        };
        debug!(session_id = %id, %viewer_id, "viewer attached");
        Ok(previous)
    }

    /// Mark the session disconnected. The process keeps running.
    pub fn detach(&mut self, id: SessionId) -> Result<()> {
        let session = self.sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;
        session.unwire_listeners();
        session.viewer = ViewerState {
            connected: false,
            active_viewer_id: None,
            active_connection: None,
            disconnected_at: Some(Utc::now()),
        };
        debug!(session_id = %id, "viewer detached");
        Ok(())
    }

    /// Detach only if `viewer_id` is still the active viewer. Returns false
    /// when another viewer has taken over in the meantime.
    pub fn detach_viewer(&mut self, id: SessionId, viewer_id: ViewerId) -> Result<bool> {
        let session = self.sessions.get(&id).ok_or(SessionError::NotFound(id))?;
        if !session.viewer.connected || session.viewer.active_viewer_id != Some(viewer_id) {
            return Ok(false);
        }
        self.detach(id)?;
        Ok(true)
    }

    pub fn is_active_viewer(&self, id: SessionId, viewer_id: ViewerId) -> bool {
        self.sessions
            .get(&id)
            .is_some_and(|s| s.viewer.connected && s.viewer.active_viewer_id == Some(viewer_id))
    }

    pub fn active_connection(&self, id: SessionId) -> Option<&C> {
        self.sessions
            .get(&id)
            .and_then(|s| s.viewer.active_connection.as_ref())
    }

    /// Unregister the current listener handles, then store `handles`.
    pub fn replace_listeners(&mut self, id: SessionId, handles: Vec<ListenerHandle>) -> Result<()> {
        let session = self.sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;
        session.unwire_listeners();
        session.listener_handles = handles;
        Ok(())
    }

    /// Hand out the recovered snapshot once, for replay to the first viewer.
    pub fn take_recovered(&mut self, id: SessionId) -> Option<Snapshot> {
        self.sessions.get_mut(&id).and_then(|s| s.recovered.take())
    }

    /// Spawn the session's process in place. Fails if the session is
    /// unknown or already has a process; a session is never respawned.
    pub fn spawn_process(
        &mut self,
        id: SessionId,
        request: SpawnRequest,
    ) -> Result<Arc<dyn TerminalProcess>> {
        let plan = self.prepare_spawn(id, request)?;
        let process = plan.spawn()?;
        self.install_process(plan, process)
    }

    /// First half of a spawn: check the session and build its mirror.
    pub fn prepare_spawn(&self, id: SessionId, request: SpawnRequest) -> Result<SpawnPlan> {
        let session = self.sessions.get(&id).ok_or(SessionError::NotFound(id))?;
        if session.process.is_some() {
            warn!(session_id = %id, "refusing to spawn a second process");
            return Err(SessionError::AlreadySpawned(id));
        }

        let dimensions = Dimensions {
            cols: request.cols,
            rows: request.rows,
        };
        let mirror = match (&self.scrollback, self.mirror_terminals) {
            (Some(serializer), true) => Some(match &session.recovered {
                Some(snapshot) => serializer.seeded_mirror(dimensions, snapshot),
                None => serializer.new_mirror(dimensions),
            }),
            _ => None,
        };

        Ok(SpawnPlan {
            session_id: id,
            request,
            working_directory: session.working_directory.clone(),
            mirror,
            spawner: self.spawner.clone(),
        })
    }

    /// Second half of a spawn. If the session vanished or another spawn got
    /// there first, `process` is killed and the error says which.
    pub fn install_process(
        &mut self,
        plan: SpawnPlan,
        process: Arc<dyn TerminalProcess>,
    ) -> Result<Arc<dyn TerminalProcess>> {
        let id = plan.session_id;
        let Some(session) = self.sessions.get_mut(&id) else {
            kill_unclaimed(id, process.as_ref(), "session destroyed during spawn");
            return Err(SessionError::NotFound(id));
        };
        if session.process.is_some() {
            kill_unclaimed(id, process.as_ref(), "session already has a process");
            return Err(SessionError::AlreadySpawned(id));
        }

        info!(
            session_id = %id,
            cmd = %plan.request.command,
            pid = ?process.pid(),
            "session process spawned"
        );
        session.process = Some(process.clone());
        session.mirror = plan.mirror;
        Ok(process)
    }

    pub fn process(&self, id: SessionId) -> Result<Option<Arc<dyn TerminalProcess>>> {
        self.sessions
            .get(&id)
            .map(|s| s.process.clone())
            .ok_or(SessionError::NotFound(id))
    }

    /// Kill the process, delete the snapshot and drop the record. Returns
    /// false for an unknown id.
    pub fn destroy(&mut self, id: SessionId) -> bool {
        self.remove(id, true)
    }

    fn remove(&mut self, id: SessionId, delete_snapshot: bool) -> bool {
        let Some(mut session) = self.sessions.remove(&id) else {
            debug!(session_id = %id, "destroy: no such session");
            return false;
        };
        session.unwire_listeners();
        if let Some(process) = session.process.take() {
            if let Err(e) = process.kill() {
                warn!(session_id = %id, error = %e, "failed to kill session process");
            }
        }
        if delete_snapshot {
            if let Some(serializer) = &self.scrollback {
                if let Err(e) = serializer.delete_state(id) {
                    warn!(session_id = %id, error = %e, "failed to delete scrollback snapshot");
                }
            }
        }
        info!(session_id = %id, work_key = %session.work_key, agent = %session.agent_kind, "session destroyed");
        true
    }

    /// Sessions disconnected for longer than `older_than`. Does not destroy.
    pub fn orphans(&self, older_than: Duration) -> Vec<SessionId> {
        self.orphans_at(older_than, Utc::now())
    }

    pub fn orphans_at(&self, older_than: Duration, now: DateTime<Utc>) -> Vec<SessionId> {
        let threshold = chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
        self.sessions
            .values()
            .filter(|s| !s.viewer.connected)
            .filter(|s| {
                s.viewer
                    .disconnected_at
                    .is_some_and(|at| now.signed_duration_since(at) > threshold)
            })
            .map(|s| s.id)
            .collect()
    }

    /// Mirrors of every session that has one, for the snapshot task.
    pub fn mirrors(&self) -> Vec<MirrorEntry> {
        self.sessions
            .values()
            .filter_map(|s| {
                s.mirror.clone().map(|mirror| MirrorEntry {
                    session_id: s.id,
                    work_key: s.work_key.clone(),
                    agent_kind: s.agent_kind,
                    mirror,
                })
            })
            .collect()
    }

    /// Kill every process and drop every session. Snapshots stay on disk;
    /// [`stage_recovery`](Self::stage_recovery) picks them up on the next
    /// start.
    pub fn kill_all(&mut self) -> usize {
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.into_iter().filter(|id| self.remove(*id, false)).count()
    }
}

fn kill_unclaimed(id: SessionId, process: &dyn TerminalProcess, reason: &str) {
    warn!(session_id = %id, pid = ?process.pid(), reason, "killing unclaimed process");
    if let Err(e) = process.kill() {
        warn!(session_id = %id, error = %e, "failed to kill unclaimed process");
    }
}

impl<C> std::fmt::Debug for SessionRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.len())
            .field("mirror_terminals", &self.mirror_terminals)
            .field("recovered", &self.recovered.len())
            .finish()
    }
}
