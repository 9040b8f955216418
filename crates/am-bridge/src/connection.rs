use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// One item queued for a viewer's socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Data(Vec<u8>),
    Control(ServerMessage),
    Close,
}

/// Handle to one viewer connection. Cheap to clone; this is what the
/// registry stores as the session's active connection.
///
/// Data queued through [`send_data`](Self::send_data) counts toward the
/// backlog until the socket writer reports it written with
/// [`mark_sent`](Self::mark_sent).
#[derive(Debug, Clone)]
pub struct ViewerConnection {
    id: Uuid,
    tx: flume::Sender<Outbound>,
    backlog: Arc<watch::Sender<usize>>,
    closed: Arc<watch::Sender<bool>>,
}

impl ViewerConnection {
    /// A new connection and the receiving end its socket writer drains.
    pub fn new() -> (Self, flume::Receiver<Outbound>) {
        let (tx, rx) = flume::unbounded();
        let (backlog, _) = watch::channel(0usize);
        let (closed, _) = watch::channel(false);
        let conn = Self {
            id: Uuid::new_v4(),
            tx,
            backlog: Arc::new(backlog),
            closed: Arc::new(closed),
        };
        (conn, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue output bytes. Returns false once the writer is gone.
    pub fn send_data(&self, data: Vec<u8>) -> bool {
        let len = data.len();
        self.backlog.send_modify(|b| *b += len);
        if self.tx.send(Outbound::Data(data)).is_err() {
            self.backlog.send_modify(|b| *b = b.saturating_sub(len));
            return false;
        }
        true
    }

    pub fn send_control(&self, msg: ServerMessage) -> bool {
        self.tx.send(Outbound::Control(msg)).is_ok()
    }

    /// Ask the writer to close the socket after what is already queued.
    /// Idempotent.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            let _ = self.tx.send(Outbound::Close);
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.tx.is_disconnected()
    }

    /// Resolves once [`close`](Self::close) is called or the writer stops.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Called by the writer after `bytes` of data reached the socket.
    pub fn mark_sent(&self, bytes: usize) {
        self.backlog.send_modify(|b| *b = b.saturating_sub(bytes));
    }

    /// Called by the writer when it stops; nothing queued will ever drain.
    pub fn writer_finished(&self) {
        self.closed.send_replace(true);
        self.backlog.send_replace(0);
    }

    /// Bytes queued but not yet written to the socket.
    pub fn backlog(&self) -> usize {
        *self.backlog.borrow()
    }

    /// Resolves once the backlog is at or below `low_water`.
    pub async fn wait_for_drain(&self, low_water: usize) {
        let mut rx = self.backlog.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|b| *b <= low_water).await;
    }
}
