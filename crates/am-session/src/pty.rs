use std::io::{Read as IoRead, Write as IoWrite};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::scrollback::SharedTerminal;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("pty spawn failed: {0}")]
    SpawnFailed(String),

    #[error("pty I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pty internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// Recover the guard from a poisoned mutex; a panicked holder must not wedge
/// every other session.
pub(crate) fn lock_or_recover<'a, T: ?Sized>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|e| {
        warn!("{what} lock was poisoned, recovering");
        e.into_inner()
    })
}

// ---------------------------------------------------------------------------
// SpawnRequest
// ---------------------------------------------------------------------------

/// Command line and initial size for a session's process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub command: String,
    pub args: Vec<String>,
    pub cols: u16,
    pub rows: u16,
}

// ---------------------------------------------------------------------------
// Output fan-out
// ---------------------------------------------------------------------------

/// Identifies one subscription to a process's output stream.
pub type ListenerId = u64;

/// A live subscription to process output. The receiver disconnects when the
/// subscription is removed or the process exits.
#[derive(Debug)]
pub struct OutputSubscription {
    pub id: ListenerId,
    pub receiver: flume::Receiver<Vec<u8>>,
}

#[derive(Default)]
struct HubState {
    next_id: ListenerId,
    listeners: Vec<(ListenerId, flume::Sender<Vec<u8>>)>,
    closed: bool,
}

/// Fans each output chunk out to every current subscriber.
#[derive(Default)]
pub struct OutputHub {
    state: Mutex<HubState>,
}

impl OutputHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new listener. After [`close`](Self::close) the returned
    /// receiver is already disconnected.
    pub fn subscribe(&self) -> OutputSubscription {
        let (tx, rx) = flume::unbounded();
        let mut state = lock_or_recover(&self.state, "output hub");
        state.next_id += 1;
        let id = state.next_id;
        if !state.closed {
            state.listeners.push((id, tx));
        }
        OutputSubscription { id, receiver: rx }
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut state = lock_or_recover(&self.state, "output hub");
        let before = state.listeners.len();
        state.listeners.retain(|(lid, _)| *lid != id);
        state.listeners.len() != before
    }

    pub fn publish(&self, chunk: &[u8]) {
        let mut state = lock_or_recover(&self.state, "output hub");
        state
            .listeners
            .retain(|(_, tx)| tx.send(chunk.to_vec()).is_ok());
    }

    /// Drop every listener; later subscribers get a closed stream.
    pub fn close(&self) {
        let mut state = lock_or_recover(&self.state, "output hub");
        state.closed = true;
        state.listeners.clear();
    }

    pub fn listener_count(&self) -> usize {
        lock_or_recover(&self.state, "output hub").listeners.len()
    }
}

// ---------------------------------------------------------------------------
// Pause gate
// ---------------------------------------------------------------------------

#[derive(Default)]
struct GateState {
    paused: bool,
    closed: bool,
}

/// Blocks the reader thread while output is paused. Leaving bytes unread
/// in the kernel buffer is what throttles the child.
#[derive(Default)]
struct PauseGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl PauseGate {
    fn set_paused(&self, paused: bool) {
        let mut state = lock_or_recover(&self.state, "pause gate");
        state.paused = paused;
        self.cond.notify_all();
    }

    fn is_paused(&self) -> bool {
        lock_or_recover(&self.state, "pause gate").paused
    }

    fn close(&self) {
        let mut state = lock_or_recover(&self.state, "pause gate");
        state.closed = true;
        self.cond.notify_all();
    }

    /// Returns false once the gate is closed.
    fn wait_until_open(&self) -> bool {
        let mut state = lock_or_recover(&self.state, "pause gate");
        while state.paused && !state.closed {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        !state.closed
    }
}

// ---------------------------------------------------------------------------
// TerminalProcess / ProcessSpawner
// ---------------------------------------------------------------------------

/// One child process attached to a terminal. The registry and transport
/// adapter only talk to processes through this trait.
pub trait TerminalProcess: Send + Sync {
    fn write(&self, data: &[u8]) -> Result<()>;
    fn resize(&self, cols: u16, rows: u16) -> Result<()>;
    /// Stop delivering output. Idempotent.
    fn pause(&self);
    /// Resume delivering output. Idempotent.
    fn resume(&self);
    fn is_paused(&self) -> bool;
    fn kill(&self) -> Result<()>;
    fn is_alive(&self) -> bool;
    /// Exit code once the process has exited and its output is drained.
    fn exit_code(&self) -> Option<u32>;
    fn pid(&self) -> Option<u32>;
    fn subscribe(&self) -> OutputSubscription;
    fn unsubscribe(&self, id: ListenerId) -> bool;
}

impl std::fmt::Debug for dyn TerminalProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalProcess")
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

/// Creates processes for sessions.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(
        &self,
        request: &SpawnRequest,
        working_directory: &Path,
        mirror: Option<SharedTerminal>,
    ) -> Result<Arc<dyn TerminalProcess>>;
}

/// Spawns real pseudo-terminal children via `portable-pty`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtySpawner;

impl ProcessSpawner for PtySpawner {
    fn spawn(
        &self,
        request: &SpawnRequest,
        working_directory: &Path,
        mirror: Option<SharedTerminal>,
    ) -> Result<Arc<dyn TerminalProcess>> {
        let process = PtyProcess::spawn(request, working_directory, mirror)?;
        Ok(Arc::new(process))
    }
}

// ---------------------------------------------------------------------------
// PtyProcess
// ---------------------------------------------------------------------------

/// Size of the reader thread's buffer.
pub const READ_BUFFER_BYTES: usize = 64 * 1024;

/// A child process running on its own pseudo-terminal.
///
/// A reader thread pulls output in reads of up to [`READ_BUFFER_BYTES`],
/// feeds the optional mirror terminal and publishes to subscribers. A writer
/// thread drains input. Most kernels hand back at most a few KiB per pty
/// read, so one published chunk is usually much smaller than the buffer.
pub struct PtyProcess {
    pid: Option<u32>,
    writer: flume::Sender<Vec<u8>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    hub: Arc<OutputHub>,
    gate: Arc<PauseGate>,
    mirror: Option<SharedTerminal>,
    exit_code: Arc<Mutex<Option<u32>>>,
}

impl PtyProcess {
    pub fn spawn(
        request: &SpawnRequest,
        working_directory: &Path,
        mirror: Option<SharedTerminal>,
    ) -> Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let mut command = CommandBuilder::new(&request.command);
        command.args(&request.args);
        command.cwd(working_directory);
        command.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        // Only the child keeps the slave open, so EOF arrives when it exits.
        drop(pair.slave);

        let pid = child.process_id();
        info!(
            cmd = %request.command,
            args = ?request.args,
            cwd = %working_directory.display(),
            pid = ?pid,
            "spawned PTY process"
        );

        let child = Arc::new(Mutex::new(child));
        let hub = Arc::new(OutputHub::new());
        let gate = Arc::new(PauseGate::default());
        let exit_code = Arc::new(Mutex::new(None));

        // -- output reader thread --
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        {
            let hub = hub.clone();
            let gate = gate.clone();
            let mirror = mirror.clone();
            let child = child.clone();
            let exit_code = exit_code.clone();
            std::thread::Builder::new()
                .name("pty-reader".into())
                .spawn(move || {
                    let mut buf = vec![0u8; READ_BUFFER_BYTES];
                    while gate.wait_until_open() {
                        match reader.read(&mut buf) {
                            Ok(0) => break,
                            Ok(n) => {
                                if let Some(mirror) = &mirror {
                                    lock_or_recover(mirror, "mirror terminal").write(&buf[..n]);
                                }
                                hub.publish(&buf[..n]);
                            }
                            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                            Err(e) => {
                                // EIO is the normal end-of-stream on Linux once the child exits.
                                debug!("pty reader finished: {e}");
                                break;
                            }
                        }
                    }
                    let status = lock_or_recover(&child, "child").wait();
                    match status {
                        Ok(status) => {
                            debug!(code = status.exit_code(), "PTY child exited");
                            *lock_or_recover(&exit_code, "exit code") = Some(status.exit_code());
                        }
                        Err(e) => debug!("failed to reap PTY child: {e}"),
                    }
                    hub.close();
                })
                .map_err(PtyError::Io)?;
        }

        // -- input writer thread --
        let (write_tx, write_rx) = flume::unbounded::<Vec<u8>>();
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        std::thread::Builder::new()
            .name("pty-writer".into())
            .spawn(move || {
                while let Ok(data) = write_rx.recv() {
                    if writer.write_all(&data).is_err() {
                        break;
                    }
                    let _ = writer.flush();
                }
            })
            .map_err(PtyError::Io)?;

        Ok(Self {
            pid,
            writer: write_tx,
            master: Mutex::new(pair.master),
            child,
            hub,
            gate,
            mirror,
            exit_code,
        })
    }
}

impl TerminalProcess for PtyProcess {
    fn write(&self, data: &[u8]) -> Result<()> {
        self.writer
            .send(data.to_vec())
            .map_err(|e| PtyError::Internal(format!("writer channel closed: {e}")))
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        lock_or_recover(&self.master, "master")
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Internal(format!("resize failed: {e}")))?;
        if let Some(mirror) = &self.mirror {
            lock_or_recover(mirror, "mirror terminal").resize(cols, rows);
        }
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    fn pause(&self) {
        self.gate.set_paused(true);
    }

    fn resume(&self) {
        self.gate.set_paused(false);
    }

    fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    fn kill(&self) -> Result<()> {
        let result = if lock_or_recover(&self.exit_code, "exit code").is_some() {
            Ok(())
        } else {
            let mut child = lock_or_recover(&self.child, "child");
            match child.try_wait() {
                Ok(None) => child
                    .kill()
                    .map(|()| info!(pid = ?self.pid, "killed PTY process"))
                    .map_err(|e| PtyError::Internal(e.to_string())),
                _ => Ok(()),
            }
        };
        // Release a reader parked on a paused gate.
        self.gate.close();
        result
    }

    fn is_alive(&self) -> bool {
        if lock_or_recover(&self.exit_code, "exit code").is_some() {
            return false;
        }
        // The reader thread holds this lock while reaping an exited child.
        match self.child.try_lock() {
            Ok(mut child) => matches!(child.try_wait(), Ok(None)),
            Err(std::sync::TryLockError::WouldBlock) => false,
            Err(std::sync::TryLockError::Poisoned(e)) => {
                matches!(e.into_inner().try_wait(), Ok(None))
            }
        }
    }

    fn exit_code(&self) -> Option<u32> {
        *lock_or_recover(&self.exit_code, "exit code")
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn subscribe(&self) -> OutputSubscription {
        self.hub.subscribe()
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.hub.unsubscribe(id)
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        let _ = self.kill();
    }
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("pid", &self.pid)
            .field("paused", &self.gate.is_paused())
            .field("listeners", &self.hub.listener_count())
            .finish()
    }
}

/// Returns the user's default shell, falling back to `/bin/sh`.
pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}
