//! Read-only monitor attachment for administrators.
//!
//! A monitor is an extra sink on a live session's output path. What backs it
//! depends on the target:
//!
//! - **web / graphical** — a private guacd tunnel joins the broker connection
//!   id, so the observer gets its own instruction stream.
//! - **web / ssh** — nothing to set up: the primary driver already fans
//!   output and keep-alives to every registered monitor.
//! - **client / ssh** — the first monitor installs a bus on the session and
//!   starts an SSH connector in monitor mode; later monitors share it, and
//!   the last one to leave shuts it down.
//!
//! The monitor's own read loop exists solely to detect its disconnect.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use bytes::BytesMut;
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::auth::Identity;
use crate::errors::ApiError;
use crate::session::channels::{handshake_slot, session_bus, BusRx, SessionBus};
use crate::session::{HandshakeReq, MonitorHandle, Session, SessionType, SshAction};
use crate::state::AppState;
use crate::upstream::{guacd, ssh};
use crate::util::geometry_or_default;
use crate::ws::{lang_prefs, ticker, ConnectQuery, CLOSED_BY_ADMIN_BANNER, FLUSH_INTERVAL};

/// `GET /connect/monitor/{session_id}` — attach a read-only observer.
pub async fn ws_monitor(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = Identity::from_headers(&headers);
    let langs = lang_prefs(query.lang.as_deref(), &headers);
    ws.on_upgrade(move |socket| handle_monitor(socket, state, session_id, query, identity, langs))
}

/// Forward funneled frames to the observer socket. Ends when the last sender
/// goes away or a close frame comes through; either way the socket closes.
async fn funnel(mut rx: mpsc::Receiver<Message>, mut sink: SplitSink<WebSocket, Message>) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if sink.send(msg).await.is_err() || closing {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Registry load with a store fallback: client-originated sessions exist only
/// in durable storage until someone watches them, so the first monitor
/// materializes the registry entry.
async fn load_monitor_target(
    state: &AppState,
    session_id: &str,
) -> Result<Arc<Session>, ApiError> {
    if let Some(session) = state.registry.load(session_id) {
        return Ok(session);
    }
    match state.db.find_online_session(session_id).await? {
        Some(record) if record.session_type == SessionType::Client => {
            let session = Arc::new(Session::from_record(record));
            state.registry.store(session_id, Arc::clone(&session));
            Ok(session)
        }
        _ => Err(ApiError::invalid_session_id(session_id)),
    }
}

async fn handle_monitor(
    mut socket: WebSocket,
    state: AppState,
    session_id: String,
    query: ConnectQuery,
    identity: Option<Identity>,
    langs: Vec<String>,
) {
    let identity = match identity.filter(Identity::is_admin) {
        Some(identity) => identity,
        None => {
            let e = ApiError::no_perm("monitor session");
            super::send_error(&mut socket, &state, &langs, &e).await;
            return;
        }
    };

    let session = match load_monitor_target(&state, &session_id).await {
        Ok(session) => session,
        Err(e) => {
            warn!(session_id, "monitor attach rejected: {e}");
            super::send_error(&mut socket, &state, &langs, &e).await;
            return;
        }
    };

    let key = format!(
        "{}-{}-{}",
        identity.uid,
        session_id,
        Utc::now().timestamp_subsec_nanos()
    );
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel::<Message>(64);
    let funnel_task = tokio::spawn(funnel(rx, sink));

    let session_type = session.session_type().await;
    let is_ssh = session.is_ssh().await;

    // Bus owned by this observer alone (graphical joins); client/ssh monitors
    // share the bus installed on the session instead.
    let mut own_bus: Option<SessionBus> = None;

    match (session_type, is_ssh) {
        (SessionType::Web, false) => {
            match attach_guacd_monitor(&state, &session, &query, tx.clone()).await {
                Ok(bus) => own_bus = Some(bus),
                Err(e) => {
                    warn!(session_id, "guacd monitor failed: {e}");
                    send_error_via(&tx, &state, &langs, &e).await;
                    return;
                }
            }
        }
        (SessionType::Web, true) => {
            // The primary SSH driver fans out to the monitors map.
        }
        (SessionType::Client, _) => {
            // Client sessions are character sessions by construction.
            if !session.has_monitors() {
                if let Err(e) =
                    attach_client_ssh_monitor(&state, &session, &identity, &langs, &session_id)
                        .await
                {
                    warn!(session_id, "client monitor failed: {e}");
                    send_error_via(&tx, &state, &langs, &e).await;
                    return;
                }
            }
        }
    }

    session.monitors.insert(
        key.clone(),
        MonitorHandle {
            tx: tx.clone(),
            lang: langs.first().cloned(),
        },
    );
    debug!(session_id, key, "monitor attached");

    // Nothing arrives from a monitor; the read loop is the disconnect probe.
    while let Some(Ok(msg)) = stream.next().await {
        if matches!(msg, Message::Close(_)) {
            break;
        }
    }

    session.monitors.remove(&key);
    debug!(session_id, key, "monitor detached");
    if let Some(bus) = own_bus {
        bus.close_away();
    } else if session_type == SessionType::Client && !session.has_monitors() {
        // Last observer gone: shut the shared monitor connector down.
        if let Some(bus) = session.bus.lock().await.take() {
            bus.close_away();
        }
    }
    drop(tx);
    let _ = funnel_task.await;
}

/// Deliver a localized error through the funnel (the sink half is already
/// owned by the funnel task).
async fn send_error_via(
    tx: &mpsc::Sender<Message>,
    state: &AppState,
    langs: &[String],
    err: &ApiError,
) {
    let prefs: Vec<&str> = langs.iter().map(String::as_str).collect();
    let _ = tx
        .send(Message::Text(err.localized(&state.catalog, &prefs).into()))
        .await;
}

/// Join the broker connection behind a WEB graphical session and drive its
/// output into this observer's funnel.
async fn attach_guacd_monitor(
    state: &AppState,
    session: &Arc<Session>,
    query: &ConnectQuery,
    tx: mpsc::Sender<Message>,
) -> Result<SessionBus, ApiError> {
    let connection_id = session.record.read().await.connection_id.clone();
    let geometry = geometry_or_default(
        query.w.as_deref(),
        query.h.as_deref(),
        query.dpi.as_deref(),
        (1024, 768, 96),
    );
    let (bus, rx) = session_bus();
    let BusRx {
        input,
        output,
        close,
        err,
        ..
    } = rx;
    let (hs_tx, hs_rx) = handshake_slot();
    tokio::spawn(guacd::run_monitor(
        state.clone(),
        connection_id,
        geometry,
        bus.clone(),
        input,
        hs_tx,
    ));
    match hs_rx.await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(ApiError::connect_server("connector vanished")),
    }
    tokio::spawn(drive_guacd_monitor(tx, bus.clone(), output, close, err));
    Ok(bus)
}

/// Observer-side driver for a joined graphical session: coalesce output on
/// the flush tick, surface admin close as a `disconnect` instruction.
async fn drive_guacd_monitor(
    tx: mpsc::Sender<Message>,
    bus: SessionBus,
    mut output: mpsc::Receiver<Vec<u8>>,
    mut close: mpsc::Receiver<String>,
    mut err: mpsc::Receiver<ApiError>,
) {
    let mut buf = BytesMut::new();
    let mut flush_tick = ticker(FLUSH_INTERVAL);
    loop {
        tokio::select! {
            _ = bus.away.cancelled() => return,
            Some(closer) = close.recv() => {
                let disconnect = guacd::Instruction::new("disconnect", &["closed by admin"]);
                let text = String::from_utf8_lossy(&disconnect.encode()).into_owned();
                let _ = tx.send(Message::Text(text.into())).await;
                warn!(closer, "monitored session closed by admin");
                return;
            }
            Some(e) = err.recv() => {
                warn!("monitored session disconnected: {e}");
                return;
            }
            Some(chunk) = output.recv() => {
                buf.extend_from_slice(&chunk);
            }
            _ = flush_tick.tick() => {
                if !buf.is_empty() {
                    let text = String::from_utf8_lossy(&buf).into_owned();
                    if tx.send(Message::Text(text.into())).await.is_err() {
                        return;
                    }
                    buf.clear();
                }
            }
        }
    }
}

/// First monitor on a client-originated SSH session: install a shared bus and
/// run the relay connector in monitor mode.
async fn attach_client_ssh_monitor(
    state: &AppState,
    session: &Arc<Session>,
    identity: &Identity,
    langs: &[String],
    session_id: &str,
) -> Result<(), ApiError> {
    let record = session.record.read().await.clone();
    let req = HandshakeReq {
        uid: identity.uid,
        user_name: identity.user_name.clone(),
        cookie: String::new(),
        accept_language: langs.join(","),
        client_ip: record.client_ip.clone(),
        asset_id: record.asset_id,
        account_id: record.account_id,
        protocol: record.protocol.clone(),
        action: SshAction::Monitor,
        session_id: session_id.to_string(),
    };

    let (bus, rx) = session_bus();
    let (hs_tx, hs_rx) = handshake_slot();
    *session.bus.lock().await = Some(bus.clone());
    tokio::spawn(ssh::run(
        state.clone(),
        req,
        (80, 24),
        bus.clone(),
        ssh::SshPumpRx {
            stdin: rx.stdin,
            window: rx.window,
        },
        hs_tx,
    ));
    let outcome = match hs_rx.await {
        Ok(Ok(resp)) if resp.code == 0 => Ok(()),
        Ok(Ok(resp)) => Err(ApiError::connect_server(resp.message)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ApiError::connect_server("connector vanished")),
    };
    if outcome.is_err() {
        *session.bus.lock().await = None;
        return outcome;
    }

    tokio::spawn(drive_shared_ssh_monitor(
        Arc::clone(session),
        bus,
        rx.output,
        rx.close,
        rx.err,
    ));
    Ok(())
}

/// Shared driver for client-session monitors: fans coalesced output to every
/// registered observer. Lives until the connector, an admin close, or the
/// last detach ends it.
async fn drive_shared_ssh_monitor(
    session: Arc<Session>,
    bus: SessionBus,
    mut output: mpsc::Receiver<Vec<u8>>,
    mut close: mpsc::Receiver<String>,
    mut err: mpsc::Receiver<ApiError>,
) {
    let mut buf = BytesMut::new();
    let mut flush_tick = ticker(FLUSH_INTERVAL);
    loop {
        tokio::select! {
            _ = bus.away.cancelled() => return,
            Some(closer) = close.recv() => {
                session.fan_out(&Message::Text(CLOSED_BY_ADMIN_BANNER.into()));
                warn!(closer, "monitored session closed by admin");
                return;
            }
            Some(e) = err.recv() => {
                warn!("monitored ssh session failed: {e}");
                return;
            }
            Some(chunk) = output.recv() => {
                buf.extend_from_slice(&chunk);
            }
            _ = flush_tick.tick() => {
                if !buf.is_empty() {
                    session.fan_out(&Message::Text(
                        String::from_utf8_lossy(&buf).into_owned().into(),
                    ));
                    buf.clear();
                }
            }
        }
    }
}
