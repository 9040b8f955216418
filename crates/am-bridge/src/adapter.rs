//! Per-connection transport adapter.
//!
//! Binds one viewer connection to a session: attaches (taking over from a
//! previous viewer if needed), spawns or reuses the process, pumps output
//! through the batcher with backpressure, and dispatches inbound frames.

use std::sync::Arc;
use std::time::Duration;

use am_core::config::TerminalConfig;
use am_core::types::{AgentKind, WorkKey};
use am_session::launch::LaunchResolver;
use am_session::pty::{PtyError, SpawnRequest, TerminalProcess};
use am_session::registry::{ListenerHandle, SessionError, SessionId, SessionRegistry, SpawnPlan};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::batcher::OutputBatcher;
use crate::connection::ViewerConnection;
use crate::flow_control::FlowControl;
use crate::protocol::{ControlMessage, Inbound, ServerMessage};

pub type SharedRegistry = Arc<Mutex<SessionRegistry<ViewerConnection>>>;

/// What a viewer asked to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub work_key: WorkKey,
    pub agent_kind: AgentKind,
    pub cols: u16,
    pub rows: u16,
}

// ---------------------------------------------------------------------------
// Pump settings
// ---------------------------------------------------------------------------

/// Batching and backpressure thresholds for one connection's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpSettings {
    pub batch_threshold: usize,
    pub batch_delay: Duration,
    pub large_chunk: usize,
    pub high_water: usize,
    pub low_water: usize,
    pub backpressure_timeout: Duration,
}

impl From<&TerminalConfig> for PumpSettings {
    fn from(cfg: &TerminalConfig) -> Self {
        Self {
            batch_threshold: cfg.batch_threshold_bytes,
            batch_delay: cfg.batch_delay(),
            large_chunk: cfg.large_chunk_bytes,
            high_water: cfg.high_water_bytes,
            low_water: cfg.low_water_bytes,
            backpressure_timeout: cfg.backpressure_timeout(),
        }
    }
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self::from(&TerminalConfig::default())
    }
}

// ---------------------------------------------------------------------------
// AttachedViewer
// ---------------------------------------------------------------------------

/// A connection bound to a session. Hand it back to
/// [`TransportAdapter::disconnect`] when the socket ends.
pub struct AttachedViewer {
    session_id: SessionId,
    connection: ViewerConnection,
    process: Arc<dyn TerminalProcess>,
    flow: Arc<FlowControl>,
    pump: JoinHandle<()>,
}

impl AttachedViewer {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn connection(&self) -> &ViewerConnection {
        &self.connection
    }

    pub fn flow(&self) -> &Arc<FlowControl> {
        &self.flow
    }

    pub fn process(&self) -> &Arc<dyn TerminalProcess> {
        &self.process
    }
}

impl std::fmt::Debug for AttachedViewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedViewer")
            .field("session_id", &self.session_id)
            .field("viewer_id", &self.connection.id())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TransportAdapter
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct TransportAdapter {
    registry: SharedRegistry,
    resolver: Arc<dyn LaunchResolver>,
    settings: PumpSettings,
}

impl TransportAdapter {
    pub fn new(registry: SharedRegistry, resolver: Arc<dyn LaunchResolver>, settings: PumpSettings) -> Self {
        Self {
            registry,
            resolver,
            settings,
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn settings(&self) -> PumpSettings {
        self.settings
    }

    /// Bind `connection` to the session for the request, creating and
    /// spawning as needed, and start pumping output to it.
    ///
    /// The registry lock is not held while a new process is forked. A viewer
    /// that is taken over during that window gets [`SessionError::Displaced`].
    pub async fn connect(
        &self,
        request: ConnectRequest,
        connection: ViewerConnection,
    ) -> Result<AttachedViewer, SessionError> {
        let (session_id, created, took_over, plan) = {
            let mut registry = self.registry.lock().await;
            let (session_id, created) =
                registry.find_or_create(&request.work_key, request.agent_kind, || {
                    self.resolver
                        .working_directory(&request.work_key, request.agent_kind)
                });

            let previous = registry.attach(session_id, connection.id(), connection.clone())?;
            let took_over = previous.is_some();
            if let Some(previous) = previous {
                // Best effort: the old socket may already be gone.
                previous.send_control(ServerMessage::Takeover);
                previous.close();
                info!(
                    %session_id,
                    old_viewer = %previous.id(),
                    new_viewer = %connection.id(),
                    "viewer displaced by takeover"
                );
            }

            let plan = match registry.process(session_id)? {
                Some(_) => None,
                None => match registry.prepare_spawn(session_id, self.spawn_request(&request)) {
                    Ok(plan) => Some(plan),
                    Err(e) => {
                        let _ = registry.detach_viewer(session_id, connection.id());
                        return Err(e);
                    }
                },
            };
            (session_id, created, took_over, plan)
        };

        let spawned = match plan {
            Some(plan) => Some(spawn_off_lock(plan).await),
            None => None,
        };

        let (name, process, subscription, recovered) = {
            let mut registry = self.registry.lock().await;
            let installed = match spawned {
                Some(Ok((plan, process))) => match registry.install_process(plan, process) {
                    Ok(process) => Some(process),
                    // Another viewer's spawn got there first; use its process.
                    Err(SessionError::AlreadySpawned(_)) => None,
                    Err(e) => return Err(abandon(&mut registry, session_id, &connection, e)),
                },
                Some(Err(e)) => return Err(abandon(&mut registry, session_id, &connection, e)),
                None => None,
            };

            if registry.get(session_id).is_none() {
                return Err(SessionError::NotFound(session_id));
            }
            if !registry.is_active_viewer(session_id, connection.id()) {
                info!(%session_id, viewer_id = %connection.id(), "viewer displaced while its process started");
                return Err(SessionError::Displaced(session_id));
            }

            let process = match installed {
                Some(process) => process,
                None => {
                    let process = registry
                        .process(session_id)?
                        .ok_or(SessionError::NotFound(session_id))?;
                    // A displaced viewer may have left it paused.
                    process.resume();
                    if let Err(e) = process.resize(request.cols, request.rows) {
                        debug!(%session_id, error = %e, "resize on reattach failed");
                    }
                    debug!(%session_id, "reusing running process");
                    process
                }
            };

            let subscription = process.subscribe();
            registry.replace_listeners(
                session_id,
                vec![ListenerHandle::new(process.clone(), subscription.id)],
            )?;

            let name = registry
                .get(session_id)
                .map(|s| s.display_name())
                .unwrap_or_default();
            let recovered = registry.take_recovered(session_id);
            info!(
                %session_id,
                viewer_id = %connection.id(),
                created,
                took_over,
                recovered = recovered.is_some(),
                "viewer attached"
            );
            (name, process, subscription, recovered)
        };

        connection.send_control(ServerMessage::Session {
            id: session_id,
            name,
            takeover: took_over,
        });
        if let Some(snapshot) = recovered {
            debug!(%session_id, lines = snapshot.buffer_lines.len(), "replaying recovered scrollback");
            connection.send_data(snapshot.to_terminal_bytes());
        }

        let flow = Arc::new(FlowControl::new(process.clone()));
        let pump = tokio::spawn(run_output_pump(
            session_id,
            subscription.receiver,
            connection.clone(),
            flow.clone(),
            process.clone(),
            self.settings,
        ));

        Ok(AttachedViewer {
            session_id,
            connection,
            process,
            flow,
            pump,
        })
    }

    fn spawn_request(&self, request: &ConnectRequest) -> SpawnRequest {
        let launch = self.resolver.command(request.agent_kind);
        SpawnRequest {
            command: launch.command,
            args: launch.args,
            cols: request.cols,
            rows: request.rows,
        }
    }

    /// Dispatch one inbound frame from the viewer.
    pub fn handle_inbound(&self, viewer: &AttachedViewer, frame: &[u8]) {
        if viewer.connection.is_closed() {
            // Displaced or closing: input no longer belongs to this viewer.
            return;
        }
        match Inbound::parse(frame) {
            Inbound::Raw(bytes) => {
                if let Err(e) = viewer.process.write(bytes) {
                    debug!(session_id = %viewer.session_id, error = %e, "write to process failed");
                }
            }
            Inbound::Control(ControlMessage::Resize { cols, rows }) => {
                if cols == 0 || rows == 0 {
                    debug!(session_id = %viewer.session_id, cols, rows, "ignoring zero-sized resize");
                    return;
                }
                if let Err(e) = viewer.process.resize(cols, rows) {
                    warn!(session_id = %viewer.session_id, error = %e, "resize failed");
                }
            }
            Inbound::Control(ControlMessage::Pause) => {
                viewer.flow.set_client_paused(true);
            }
            Inbound::Control(ControlMessage::Resume) => {
                viewer.flow.set_client_paused(false);
            }
            Inbound::Ignored => {}
        }
    }

    /// Tear down a viewer. The process keeps running; if this viewer was
    /// still the active one, the process is left resumed.
    pub async fn disconnect(&self, viewer: AttachedViewer) {
        viewer.pump.abort();
        // A pump aborted mid-backpressure must not leave the process paused,
        // even after a takeover.
        let held_pause = viewer.flow.state().server_paused;
        viewer.flow.reset_flags();

        let still_active = {
            let mut registry = self.registry.lock().await;
            match registry.detach_viewer(viewer.session_id, viewer.connection.id()) {
                Ok(active) => active,
                Err(e) => {
                    debug!(session_id = %viewer.session_id, error = %e, "detach after destroy");
                    false
                }
            }
        };
        if still_active || held_pause {
            viewer.process.resume();
        }
        viewer.connection.close();
        info!(
            session_id = %viewer.session_id,
            viewer_id = %viewer.connection.id(),
            still_active,
            held_pause,
            "viewer disconnected"
        );
    }
}

/// Fork on the blocking pool. The plan comes back for installation.
async fn spawn_off_lock(
    plan: SpawnPlan,
) -> Result<(SpawnPlan, Arc<dyn TerminalProcess>), SessionError> {
    let id = plan.session_id();
    let (plan, spawned) = tokio::task::spawn_blocking(move || {
        let spawned = plan.spawn();
        (plan, spawned)
    })
    .await
    .map_err(|e| SessionError::Spawn {
        id,
        source: PtyError::Internal(format!("spawn task failed: {e}")),
    })?;
    Ok((plan, spawned?))
}

/// Undo an attach whose spawn failed and hand the error back.
fn abandon(
    registry: &mut SessionRegistry<ViewerConnection>,
    session_id: SessionId,
    connection: &ViewerConnection,
    err: SessionError,
) -> SessionError {
    let _ = registry.detach_viewer(session_id, connection.id());
    err
}

impl std::fmt::Debug for TransportAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportAdapter")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Output pump
// ---------------------------------------------------------------------------

async fn run_output_pump(
    session_id: SessionId,
    output: flume::Receiver<Vec<u8>>,
    connection: ViewerConnection,
    flow: Arc<FlowControl>,
    process: Arc<dyn TerminalProcess>,
    settings: PumpSettings,
) {
    let mut batcher = OutputBatcher::new(settings.batch_threshold);
    let flush_timer = tokio::time::sleep(settings.batch_delay);
    tokio::pin!(flush_timer);
    let mut timer_armed = false;
    // Pty reads come back a few KiB at a time, so "large" is measured over
    // back-to-back chunks with no gap longer than the batch delay.
    let mut burst = 0usize;
    let mut last_chunk_at = Instant::now();

    loop {
        tokio::select! {
            chunk = output.recv_async() => {
                let Ok(chunk) = chunk else {
                    break;
                };
                if connection.is_closed() {
                    debug!(%session_id, "viewer closed, stopping output pump");
                    return;
                }
                let now = Instant::now();
                if now.duration_since(last_chunk_at) > settings.batch_delay {
                    burst = 0;
                }
                last_chunk_at = now;
                burst += chunk.len();

                let was_empty = batcher.is_empty();
                let ready = batcher.push(chunk);
                if ready.is_empty() {
                    if was_empty {
                        flush_timer.as_mut().reset(Instant::now() + settings.batch_delay);
                        timer_armed = true;
                    }
                    continue;
                }
                timer_armed = false;
                for frame in ready {
                    if !connection.send_data(frame) {
                        debug!(%session_id, "viewer writer gone, stopping output pump");
                        return;
                    }
                }
                if burst >= settings.large_chunk && connection.backlog() > settings.high_water {
                    burst = 0;
                    if !apply_backpressure(session_id, &connection, &flow, &settings).await {
                        return;
                    }
                }
            }
            () = &mut flush_timer, if timer_armed => {
                timer_armed = false;
                if let Some(batch) = batcher.flush() {
                    if !connection.send_data(batch) {
                        return;
                    }
                }
            }
        }
    }

    // The stream ends either because the process exited or because this
    // viewer's listener was unwired (takeover, detach).
    if let Some(batch) = batcher.flush() {
        connection.send_data(batch);
    }
    if process.exit_code().is_some() || !process.is_alive() {
        let code = process.exit_code();
        info!(%session_id, ?code, "process exited, closing viewer");
        connection.send_control(ServerMessage::Exit { code });
        connection.close();
    } else {
        debug!(%session_id, "output listener unwired");
    }
}

/// Pause the process until the viewer drains below low water or the timeout
/// passes. Returns false when the viewer was closed instead; the pump stops
/// then and leaves the process to whoever owns it now.
async fn apply_backpressure(
    session_id: SessionId,
    connection: &ViewerConnection,
    flow: &FlowControl,
    settings: &PumpSettings,
) -> bool {
    if connection.is_closed() {
        return false;
    }
    let backlog = connection.backlog();
    flow.set_server_paused(true);
    if connection.is_closed() {
        // Taken over between the check and the pause.
        flow.set_server_paused(false);
        return false;
    }
    connection.send_control(ServerMessage::Status { paused: true });
    debug!(%session_id, backlog, "backpressure: output paused");

    let drained = tokio::select! {
        drained = tokio::time::timeout(
            settings.backpressure_timeout,
            connection.wait_for_drain(settings.low_water),
        ) => drained.is_ok(),
        () = connection.closed() => {
            // A takeover resumes the process for the new viewer.
            flow.reset_flags();
            debug!(%session_id, "viewer closed during backpressure");
            return false;
        }
    };
    if !drained {
        warn!(
            %session_id,
            backlog = connection.backlog(),
            timeout_secs = settings.backpressure_timeout.as_secs(),
            "backpressure drain timed out, forcing resume"
        );
    }

    flow.set_server_paused(false);
    connection.send_control(ServerMessage::Status { paused: false });
    debug!(%session_id, backlog = connection.backlog(), "backpressure: output resumed");
    true
}
