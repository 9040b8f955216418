//! Scrollback capture and recovery.
//!
//! A session may keep a *mirror*: an off-screen terminal emulator fed the
//! same bytes as the viewer. The serializer captures the mirror's visible
//! buffer into a [`Snapshot`], persists it through a [`SnapshotStore`], and
//! can rebuild a terminal from a stored snapshot later.

use std::sync::{Arc, Mutex};

use am_core::types::{AgentKind, WorkKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::pty::lock_or_recover;
use crate::snapshot_store::{SnapshotError, SnapshotStore};

/// Scrollback kept by the vt100 mirror beyond the visible screen.
const MIRROR_SCROLLBACK_LINES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub cols: u16,
    pub rows: u16,
}

impl Dimensions {
    pub fn is_valid(&self) -> bool {
        self.cols > 0 && self.rows > 0
    }
}

/// A persisted capture of a session's visible buffer.
///
/// Session ids do not survive a restart, so a snapshot also records the
/// (work key, agent kind) pair it belongs to. Recovery matches on that pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub session_id: Uuid,
    pub buffer_lines: Vec<String>,
    pub dimensions: Dimensions,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_key: Option<WorkKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_kind: Option<AgentKind>,
}

impl Snapshot {
    pub fn labelled(mut self, work_key: WorkKey, agent_kind: AgentKind) -> Self {
        self.work_key = Some(work_key);
        self.agent_kind = Some(agent_kind);
        self
    }

    /// The (work key, agent kind) pair, if the snapshot was labelled.
    pub fn label(&self) -> Option<(&WorkKey, AgentKind)> {
        Some((self.work_key.as_ref()?, self.agent_kind?))
    }

    /// The captured lines as terminal output, one CRLF-terminated line each.
    pub fn to_terminal_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for line in &self.buffer_lines {
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out
    }
}

/// Write `lines` into `terminal` so they occupy its first rows. The last
/// line gets no trailing newline, so a full screen does not scroll.
pub fn replay_lines(terminal: &mut dyn OffscreenTerminal, lines: &[String]) {
    let last = lines.len().saturating_sub(1);
    for (i, line) in lines.iter().enumerate() {
        if i == last {
            terminal.write(line.as_bytes());
        } else {
            terminal.write(format!("{line}\r\n").as_bytes());
        }
    }
}

// ---------------------------------------------------------------------------
// Off-screen terminal
// ---------------------------------------------------------------------------

/// Headless terminal emulator used for mirrors and restores.
pub trait OffscreenTerminal: Send {
    fn write(&mut self, data: &[u8]);
    fn resize(&mut self, cols: u16, rows: u16);
    fn dimensions(&self) -> Dimensions;
    /// Visible rows as plain text, trailing blank rows removed.
    fn buffer_lines(&self) -> Vec<String>;
}

pub type SharedTerminal = Arc<Mutex<Box<dyn OffscreenTerminal>>>;

/// Builds an empty off-screen terminal of the given size.
pub type TerminalFactory = Arc<dyn Fn(Dimensions) -> Box<dyn OffscreenTerminal> + Send + Sync>;

pub struct Vt100Terminal {
    parser: vt100::Parser,
}

impl Vt100Terminal {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            parser: vt100::Parser::new(rows, cols, MIRROR_SCROLLBACK_LINES),
        }
    }

    pub fn screen(&self) -> &vt100::Screen {
        self.parser.screen()
    }
}

impl OffscreenTerminal for Vt100Terminal {
    fn write(&mut self, data: &[u8]) {
        self.parser.process(data);
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        if cols > 0 && rows > 0 {
            self.parser.set_size(rows, cols);
        }
    }

    fn dimensions(&self) -> Dimensions {
        let (rows, cols) = self.parser.screen().size();
        Dimensions { cols, rows }
    }

    fn buffer_lines(&self) -> Vec<String> {
        let screen = self.parser.screen();
        let (_, cols) = screen.size();
        let mut lines: Vec<String> = screen
            .rows(0, cols)
            .map(|row| row.trim_end().to_string())
            .collect();
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        lines
    }
}

impl std::fmt::Debug for Vt100Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vt100Terminal")
            .field("dimensions", &self.dimensions())
            .finish()
    }
}

pub fn vt100_factory() -> TerminalFactory {
    Arc::new(|dims: Dimensions| Box::new(Vt100Terminal::new(dims.cols, dims.rows)) as Box<dyn OffscreenTerminal>)
}

// ---------------------------------------------------------------------------
// Serializer
// ---------------------------------------------------------------------------

/// A terminal rebuilt from a snapshot, with its capture helper.
pub struct RestoredTerminal {
    pub session_id: Uuid,
    pub terminal: Box<dyn OffscreenTerminal>,
}

impl RestoredTerminal {
    pub fn capture(&self) -> Snapshot {
        ScrollbackSerializer::capture_state(self.session_id, self.terminal.as_ref())
    }
}

impl std::fmt::Debug for RestoredTerminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoredTerminal")
            .field("session_id", &self.session_id)
            .field("dimensions", &self.terminal.dimensions())
            .finish()
    }
}

pub struct ScrollbackSerializer {
    store: Arc<dyn SnapshotStore>,
    factory: TerminalFactory,
}

impl ScrollbackSerializer {
    /// Serializer backed by vt100 terminals.
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self::with_factory(store, vt100_factory())
    }

    pub fn with_factory(store: Arc<dyn SnapshotStore>, factory: TerminalFactory) -> Self {
        Self { store, factory }
    }

    /// A fresh mirror terminal for a newly spawned process.
    pub fn new_mirror(&self, dimensions: Dimensions) -> SharedTerminal {
        Arc::new(Mutex::new((self.factory)(dimensions)))
    }

    /// Capture the visible buffer of `terminal`. Pure: no I/O.
    pub fn capture_state(session_id: Uuid, terminal: &dyn OffscreenTerminal) -> Snapshot {
        Snapshot {
            session_id,
            buffer_lines: terminal.buffer_lines(),
            dimensions: terminal.dimensions(),
            timestamp: Utc::now(),
            work_key: None,
            agent_kind: None,
        }
    }

    /// Capture from a shared mirror, holding its lock only for the copy.
    pub fn capture_shared(session_id: Uuid, terminal: &SharedTerminal) -> Snapshot {
        let guard = lock_or_recover(terminal, "mirror terminal");
        Self::capture_state(session_id, guard.as_ref())
    }

    pub fn save_state(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        self.store.save(snapshot)
    }

    pub fn load_state(&self, session_id: Uuid) -> Result<Option<Snapshot>, SnapshotError> {
        self.store.load(session_id)
    }

    pub fn delete_state(&self, session_id: Uuid) -> Result<(), SnapshotError> {
        self.store.delete(session_id)
    }

    /// Every stored snapshot. A store that cannot be listed yields nothing.
    pub fn load_all(&self) -> Vec<Snapshot> {
        match self.store.list() {
            Ok(snapshots) => snapshots,
            Err(e) => {
                warn!(error = %e, "failed to list scrollback snapshots");
                Vec::new()
            }
        }
    }

    /// A mirror that starts out showing `snapshot`'s lines.
    pub fn seeded_mirror(&self, dimensions: Dimensions, snapshot: &Snapshot) -> SharedTerminal {
        let mut terminal = (self.factory)(dimensions);
        replay_lines(terminal.as_mut(), &snapshot.buffer_lines);
        Arc::new(Mutex::new(terminal))
    }

    /// Rebuild a terminal from the stored snapshot for `session_id`.
    ///
    /// Returns `None` when there is no snapshot, or when it cannot be loaded
    /// or replayed; the failure is logged and recovery is simply skipped.
    pub fn restore_terminal(&self, session_id: Uuid) -> Option<RestoredTerminal> {
        match self.try_restore(session_id) {
            Ok(restored) => restored,
            Err(e) => {
                warn!(%session_id, error = %e, "failed to restore scrollback snapshot");
                None
            }
        }
    }

    fn try_restore(&self, session_id: Uuid) -> Result<Option<RestoredTerminal>, SnapshotError> {
        let Some(snapshot) = self.store.load(session_id)? else {
            return Ok(None);
        };
        if !snapshot.dimensions.is_valid() {
            return Err(SnapshotError::Invalid(format!(
                "dimensions {}x{}",
                snapshot.dimensions.cols, snapshot.dimensions.rows
            )));
        }

        let mut terminal = (self.factory)(snapshot.dimensions);
        replay_lines(terminal.as_mut(), &snapshot.buffer_lines);
        debug!(
            %session_id,
            lines = snapshot.buffer_lines.len(),
            "scrollback snapshot restored"
        );
        Ok(Some(RestoredTerminal {
            session_id,
            terminal,
        }))
    }
}

impl std::fmt::Debug for ScrollbackSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScrollbackSerializer").finish_non_exhaustive()
    }
}
