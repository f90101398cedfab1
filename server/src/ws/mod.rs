//! WebSocket bridge for primary session clients.
//!
//! ## Connection lifecycle
//!
//! 1. `POST /connect/...` has already run the connector handshake and parked
//!    the bridge side of the session bus on the registry entry.
//! 2. `GET /connect/{session_id}` upgrades, binds this socket as the primary
//!    client (a session accepts exactly one primary bind, ever), and drives
//!    the session until either side ends it.
//! 3. Errors after the upgrade are written to the socket as one localized
//!    text frame before it closes.
//!
//! ## Frame conventions (text frames only)
//!
//! | Direction | SSH | Graphical |
//! |---|---|---|
//! | client → gateway | `'1'`+data, `'9'` heartbeat, `'w'`+`"w,h[,dpi]"` | opaque Guacamole instructions |
//! | gateway → client | coalesced terminal output every ≤100 ms; empty keep-alive each 1 s; red banner on admin close | coalesced instructions every ≤100 ms; `disconnect` instruction on admin close |

pub mod monitor;

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use bytes::BytesMut;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant};
use tracing::{error, warn};

use crate::errors::{ApiError, ErrorKind};
use crate::session::channels::{BridgeRx, GuacdBridgeRx, SessionBus, SshBridgeRx};
use crate::session::Session;
use crate::state::AppState;
use crate::upstream::guacd;

/// Output coalescing window: the visible granularity of ordering at the
/// WebSocket.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(100);
/// SSH keep-alive period; doubles as the liveness probe.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
/// Red banner shown to the primary client (and SSH monitors) on admin close.
pub const CLOSED_BY_ADMIN_BANNER: &str = "\r\n \x1b[31m closed by admin";

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    pub w: Option<String>,
    pub h: Option<String>,
    pub dpi: Option<String>,
    pub lang: Option<String>,
}

/// Ordered language preferences: explicit `lang` query first, then
/// `Accept-Language` entries.
pub fn lang_prefs(lang: Option<&str>, headers: &HeaderMap) -> Vec<String> {
    let mut prefs: Vec<String> = lang
        .filter(|l| !l.is_empty())
        .map(ToString::to_string)
        .into_iter()
        .collect();
    if let Some(accept) = headers.get("accept-language").and_then(|v| v.to_str().ok()) {
        for entry in accept.split(',') {
            let tag = entry.split(';').next().unwrap_or("").trim();
            if !tag.is_empty() {
                prefs.push(tag.to_string());
            }
        }
    }
    prefs
}

/// `GET /connect/{session_id}` — bind the primary WebSocket client.
pub async fn ws_connect(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let langs = lang_prefs(query.lang.as_deref(), &headers);
    // Echo the requested subprotocol so browser clients negotiate cleanly.
    let ws = match headers
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
    {
        Some(proto) => ws.protocols([proto.to_string()]),
        None => ws,
    };
    ws.on_upgrade(move |socket| handle_primary(socket, state, session_id, query, langs))
}

/// Write one localized error frame and close. Used for failures after the
/// upgrade, when HTTP statuses can no longer reach the client.
async fn send_error(socket: &mut WebSocket, state: &AppState, langs: &[String], err: &ApiError) {
    let prefs: Vec<&str> = langs.iter().map(String::as_str).collect();
    let text = err.localized(&state.catalog, &prefs);
    let _ = socket.send(Message::Text(text.into())).await;
    let _ = socket.close().await;
}

async fn handle_primary(
    mut socket: WebSocket,
    state: AppState,
    session_id: String,
    query: ConnectQuery,
    langs: Vec<String>,
) {
    let session = match state.registry.load_for_bridge(&session_id) {
        Ok(session) => session,
        Err(e) => {
            warn!(session_id, "primary bind rejected: {e}");
            send_error(&mut socket, &state, &langs, &e).await;
            return;
        }
    };
    session.mark_connected();

    let bridge = session.bridge.lock().await.take();
    let bus = session.bus.lock().await.clone();
    let (Some(bridge), Some(bus)) = (bridge, bus) else {
        let e = ApiError::new(ErrorKind::LoadSession, "session bus is not wired");
        error!(session_id, "{e}");
        send_error(&mut socket, &state, &langs, &e).await;
        return;
    };

    let (mut sink, stream) = socket.split();
    let mut reader = tokio::spawn(read_client_frames(stream, bus.input.clone()));

    let result = match bridge {
        BridgeRx::Ssh(mut rx) => {
            // Seed the connector with the client's initial geometry; the
            // resizer validates, malformed input is simply ignored there.
            let initial = format!(
                "{},{},{}",
                query.w.as_deref().unwrap_or(""),
                query.h.as_deref().unwrap_or(""),
                query.dpi.as_deref().unwrap_or(""),
            );
            let _ = bus.window.send(initial);
            drive_ssh(&mut sink, &session, &bus, &mut rx, &mut reader).await
        }
        BridgeRx::Guacd(mut rx) => drive_guacd(&mut sink, &bus, &mut rx, &mut reader).await,
    };

    reader.abort();
    bus.close_away();
    if let Err(e) = result {
        warn!(session_id, "session loop ended: {e}");
        let prefs: Vec<&str> = langs.iter().map(String::as_str).collect();
        let text = e.localized(&state.catalog, &prefs);
        let _ = sink.send(Message::Text(text.into())).await;
    }
    let _ = sink.close().await;
}

/// Pump client text frames onto the bus. Zero-length frames are dropped; the
/// task ends when the client goes away.
async fn read_client_frames(mut stream: SplitStream<WebSocket>, input: mpsc::Sender<Vec<u8>>) {
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => {
                if text.is_empty() {
                    warn!("websocket msg length is zero");
                    continue;
                }
                if input.send(text.as_bytes().to_vec()).await.is_err() {
                    return;
                }
            }
            Message::Close(_) => return,
            _ => {}
        }
    }
}

/// Route one client frame by its discriminator byte. The stdin and window
/// legs are unbounded, so the driver never blocks here.
fn dispatch_client_frame(bus: &SessionBus, frame: &[u8]) {
    let Some((&discriminator, payload)) = frame.split_first() else {
        return;
    };
    match discriminator {
        b'1' => {
            let _ = bus.stdin.send(payload.to_vec());
        }
        // Client heartbeat, nothing to do.
        b'9' => {}
        b'w' => {
            let _ = bus
                .window
                .send(String::from_utf8_lossy(payload).into_owned());
        }
        _ => {}
    }
}

/// Drain `buf` as one text frame to the client and, for SSH sessions, to
/// every monitor.
async fn flush_output(
    sink: Option<&mut SplitSink<WebSocket, Message>>,
    session: Option<&Arc<Session>>,
    buf: &mut BytesMut,
) {
    if buf.is_empty() {
        return;
    }
    let msg = Message::Text(String::from_utf8_lossy(buf).into_owned().into());
    if let Some(sink) = sink {
        let _ = sink.send(msg.clone()).await;
    }
    if let Some(session) = session {
        session.fan_out(&msg);
    }
    buf.clear();
}

/// A tick source that fires after its first full period, not immediately.
fn ticker(period: Duration) -> tokio::time::Interval {
    interval_at(Instant::now() + period, period)
}

/// SSH driver: the single consumer of the session's output path and the
/// dispatcher for client input.
async fn drive_ssh(
    sink: &mut SplitSink<WebSocket, Message>,
    session: &Arc<Session>,
    bus: &SessionBus,
    rx: &mut SshBridgeRx,
    reader: &mut JoinHandle<()>,
) -> Result<(), ApiError> {
    let mut buf = BytesMut::new();
    let mut flush_tick = ticker(FLUSH_INTERVAL);
    let mut keepalive_tick = ticker(KEEPALIVE_INTERVAL);

    loop {
        tokio::select! {
            _ = &mut *reader => {
                // Client went away.
                flush_output(Some(&mut *sink), Some(session), &mut buf).await;
                return Ok(());
            }
            _ = bus.away.cancelled() => {
                flush_output(Some(&mut *sink), Some(session), &mut buf).await;
                return Ok(());
            }
            Some(closer) = rx.close.recv() => {
                let banner = Message::Text(CLOSED_BY_ADMIN_BANNER.into());
                let _ = sink.send(banner.clone()).await;
                session.fan_out(&banner);
                warn!(closer, "session closed by admin");
                return Ok(());
            }
            Some(err) = rx.err.recv() => {
                error!("server disconnected: {err}");
                return Err(err);
            }
            Some(frame) = rx.input.recv() => {
                dispatch_client_frame(bus, &frame);
            }
            Some(chunk) = rx.output.recv() => {
                buf.extend_from_slice(&chunk);
            }
            _ = flush_tick.tick() => {
                flush_output(Some(&mut *sink), Some(session), &mut buf).await;
            }
            _ = keepalive_tick.tick() => {
                let keepalive = Message::Text("".into());
                let _ = sink.send(keepalive.clone()).await;
                session.fan_out(&keepalive);
            }
        }
    }
}

/// Graphical driver. Client frames go straight to the connector (which
/// filters), so only the output path runs here; no keep-alive in this mode.
async fn drive_guacd(
    sink: &mut SplitSink<WebSocket, Message>,
    bus: &SessionBus,
    rx: &mut GuacdBridgeRx,
    reader: &mut JoinHandle<()>,
) -> Result<(), ApiError> {
    let mut buf = BytesMut::new();
    let mut flush_tick = ticker(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            _ = &mut *reader => {
                flush_output(Some(&mut *sink), None, &mut buf).await;
                return Ok(());
            }
            _ = bus.away.cancelled() => {
                flush_output(Some(&mut *sink), None, &mut buf).await;
                return Ok(());
            }
            Some(closer) = rx.close.recv() => {
                let disconnect = guacd::Instruction::new("disconnect", &["closed by admin"]);
                let text = String::from_utf8_lossy(&disconnect.encode()).into_owned();
                let _ = sink.send(Message::Text(text.into())).await;
                warn!(closer, "session closed by admin");
                return Ok(());
            }
            Some(err) = rx.err.recv() => {
                error!("disconnected: {err}");
                return Err(err);
            }
            Some(chunk) = rx.output.recv() => {
                buf.extend_from_slice(&chunk);
            }
            _ = flush_tick.tick() => {
                flush_output(Some(&mut *sink), None, &mut buf).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn lang_prefs_put_query_before_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "accept-language",
            HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"),
        );
        let prefs = lang_prefs(Some("ja"), &headers);
        assert_eq!(prefs, vec!["ja", "zh-CN", "zh", "en"]);
    }

    #[test]
    fn lang_prefs_tolerate_missing_sources() {
        assert!(lang_prefs(None, &HeaderMap::new()).is_empty());
        assert!(lang_prefs(Some(""), &HeaderMap::new()).is_empty());
    }

    #[tokio::test]
    async fn dispatch_routes_by_discriminator() {
        let (bus, mut rx) = crate::session::channels::session_bus();
        dispatch_client_frame(&bus, b"1ls\n");
        assert_eq!(rx.stdin.recv().await.unwrap(), b"ls\n".to_vec());

        dispatch_client_frame(&bus, b"w120,40,96");
        assert_eq!(rx.window.recv().await.unwrap(), "120,40,96");

        // Heartbeats and unknown discriminators are swallowed.
        dispatch_client_frame(&bus, b"9");
        dispatch_client_frame(&bus, b"zzz");
        assert!(rx.stdin.try_recv().is_err());
        assert!(rx.window.try_recv().is_err());
    }

    #[tokio::test]
    async fn stdin_leg_never_blocks_the_driver() {
        // The driver must stay responsive even when the connector is not
        // draining; an unbounded leg absorbs the burst.
        let (bus, mut rx) = crate::session::channels::session_bus();
        for i in 0..1000u32 {
            dispatch_client_frame(&bus, format!("1line {i}\n").as_bytes());
        }
        let first = rx.stdin.recv().await.unwrap();
        assert_eq!(first, b"line 0\n".to_vec());
    }
}
