//! In-memory process doubles for exercising the registry and the transport
//! adapter without real PTYs.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::pty::{
    lock_or_recover, ListenerId, OutputHub, OutputSubscription, ProcessSpawner, PtyError, Result,
    SpawnRequest, TerminalProcess,
};
use crate::scrollback::SharedTerminal;

/// A process whose output is driven by the test.
#[derive(Default)]
pub struct ScriptedProcess {
    hub: OutputHub,
    paused: AtomicBool,
    pause_calls: AtomicUsize,
    resume_calls: AtomicUsize,
    kill_calls: AtomicUsize,
    written: Mutex<Vec<u8>>,
    resizes: Mutex<Vec<(u16, u16)>>,
    exit_code: Mutex<Option<u32>>,
    mirror: Option<SharedTerminal>,
}

impl ScriptedProcess {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_mirror(mirror: Option<SharedTerminal>) -> Self {
        Self {
            mirror,
            ..Self::default()
        }
    }

    /// Deliver `chunk` to the mirror and every subscriber.
    pub fn emit(&self, chunk: &[u8]) {
        if let Some(mirror) = &self.mirror {
            lock_or_recover(mirror, "mirror terminal").write(chunk);
        }
        self.hub.publish(chunk);
    }

    /// Exit with `code`: subscribers see their stream end.
    pub fn finish(&self, code: u32) {
        *lock_or_recover(&self.exit_code, "exit code") = Some(code);
        self.hub.close();
    }

    pub fn written(&self) -> Vec<u8> {
        lock_or_recover(&self.written, "written").clone()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        lock_or_recover(&self.resizes, "resizes").clone()
    }

    pub fn pause_calls(&self) -> usize {
        self.pause_calls.load(Ordering::SeqCst)
    }

    pub fn resume_calls(&self) -> usize {
        self.resume_calls.load(Ordering::SeqCst)
    }

    pub fn kill_calls(&self) -> usize {
        self.kill_calls.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.hub.listener_count()
    }
}

impl TerminalProcess for ScriptedProcess {
    fn write(&self, data: &[u8]) -> Result<()> {
        if self.exit_code().is_some() {
            return Err(PtyError::Internal("process has exited".into()));
        }
        lock_or_recover(&self.written, "written").extend_from_slice(data);
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        lock_or_recover(&self.resizes, "resizes").push((cols, rows));
        if let Some(mirror) = &self.mirror {
            lock_or_recover(mirror, "mirror terminal").resize(cols, rows);
        }
        Ok(())
    }

    fn pause(&self) {
        self.pause_calls.fetch_add(1, Ordering::SeqCst);
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn kill(&self) -> Result<()> {
        self.kill_calls.fetch_add(1, Ordering::SeqCst);
        let mut code = lock_or_recover(&self.exit_code, "exit code");
        if code.is_none() {
            *code = Some(137);
            self.hub.close();
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.exit_code().is_none()
    }

    fn exit_code(&self) -> Option<u32> {
        *lock_or_recover(&self.exit_code, "exit code")
    }

    fn pid(&self) -> Option<u32> {
        None
    }

    fn subscribe(&self) -> OutputSubscription {
        self.hub.subscribe()
    }

    fn unsubscribe(&self, id: ListenerId) -> bool {
        self.hub.unsubscribe(id)
    }
}

/// Records every spawn and hands out [`ScriptedProcess`]es.
#[derive(Default)]
pub struct ScriptedSpawner {
    spawned: Mutex<Vec<(SpawnRequest, PathBuf, Arc<ScriptedProcess>)>>,
    fail: AtomicBool,
}

impl ScriptedSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later spawn fail.
    pub fn fail_spawns(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn spawn_count(&self) -> usize {
        lock_or_recover(&self.spawned, "spawned").len()
    }

    pub fn last(&self) -> Option<Arc<ScriptedProcess>> {
        lock_or_recover(&self.spawned, "spawned")
            .last()
            .map(|(_, _, p)| p.clone())
    }

    pub fn requests(&self) -> Vec<(SpawnRequest, PathBuf)> {
        lock_or_recover(&self.spawned, "spawned")
            .iter()
            .map(|(r, d, _)| (r.clone(), d.clone()))
            .collect()
    }
}

impl ProcessSpawner for ScriptedSpawner {
    fn spawn(
        &self,
        request: &SpawnRequest,
        working_directory: &Path,
        mirror: Option<SharedTerminal>,
    ) -> Result<Arc<dyn TerminalProcess>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PtyError::SpawnFailed(format!("{}: not found", request.command)));
        }
        let process = Arc::new(ScriptedProcess::with_mirror(mirror));
        lock_or_recover(&self.spawned, "spawned").push((
            request.clone(),
            working_directory.to_path_buf(),
            process.clone(),
        ));
        Ok(process)
    }
}
