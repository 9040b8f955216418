use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::adapter::ConnectRequest;
use crate::api_error::ApiError;
use crate::connection::{Outbound, ViewerConnection};
use crate::http_api::{ApiState, SessionKeyQuery};

/// Ping interval used to detect half-open TCP connections.
const WS_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct TerminalQuery {
    pub work_key: String,
    pub agent: String,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

/// GET /ws/terminal?work_key=..&agent=..&cols=..&rows=..: attach a viewer.
pub async fn terminal_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
    Query(query): Query<TerminalQuery>,
) -> Result<Response, ApiError> {
    let (work_key, agent_kind) = SessionKeyQuery {
        work_key: query.work_key,
        agent: query.agent,
    }
    .parse()?;
    let request = ConnectRequest {
        work_key,
        agent_kind,
        cols: query.cols.filter(|c| *c > 0).unwrap_or(state.terminal.default_cols),
        rows: query.rows.filter(|r| *r > 0).unwrap_or(state.terminal.default_rows),
    };
    Ok(ws
        .on_upgrade(move |socket| handle_terminal_ws(socket, state, request))
        .into_response())
}

async fn handle_terminal_ws(socket: WebSocket, state: Arc<ApiState>, request: ConnectRequest) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (connection, outbound) = ViewerConnection::new();
    let mut writer = tokio::spawn(write_outbound(ws_sender, outbound, connection.clone()));

    let work_key = request.work_key.clone();
    let viewer = match state.adapter.connect(request, connection.clone()).await {
        Ok(viewer) => viewer,
        Err(e) => {
            warn!(%work_key, error = %e, "terminal connect failed");
            connection.close();
            let _ = writer.await;
            return;
        }
    };

    let mut writer_done = false;
    loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    state.adapter.handle_inbound(&viewer, text.as_str().as_bytes());
                }
                Some(Ok(Message::Binary(data))) => {
                    state.adapter.handle_inbound(&viewer, &data);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session_id = %viewer.session_id(), error = %e, "websocket read error");
                    break;
                }
            },
            _ = &mut writer => {
                writer_done = true;
                break;
            }
        }
    }

    state.adapter.disconnect(viewer).await;
    if !writer_done {
        // Let the writer deliver the close frame, but don't wait on a dead peer.
        if tokio::time::timeout(Duration::from_secs(1), &mut writer).await.is_err() {
            writer.abort();
        }
    }
}

/// Drains a connection's outbound queue into the socket. Data goes out as
/// binary frames, notices as JSON text frames.
async fn write_outbound(
    mut sink: SplitSink<WebSocket, Message>,
    outbound: flume::Receiver<Outbound>,
    connection: ViewerConnection,
) {
    let mut heartbeat = tokio::time::interval(WS_HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            item = outbound.recv_async() => {
                let Ok(item) = item else { break };
                match item {
                    Outbound::Data(data) => {
                        let len = data.len();
                        if sink.send(Message::Binary(data.into())).await.is_err() {
                            break;
                        }
                        connection.mark_sent(len);
                    }
                    Outbound::Control(msg) => {
                        if sink.send(Message::Text(msg.to_json().into())).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    debug!("heartbeat ping failed, connection lost");
                    break;
                }
            }
        }
    }

    connection.writer_finished();
    info!(viewer_id = %connection.id(), "terminal websocket writer stopped");
}
