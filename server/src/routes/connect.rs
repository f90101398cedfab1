//! Session control plane: create and terminate sessions.
//!
//! - `POST /connect/{asset_id}/{account_id}/{protocol}` — run the connector
//!   handshake, wire the bus onto the registered session, return its record.
//!   The WebSocket bind happens in a separate `GET /connect/{session_id}`.
//! - `POST /connect/close/{session_id}` — admin-only termination through the
//!   relay's CLOSE action.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::auth::Identity;
use crate::errors::{ApiError, ErrorKind};
use crate::session::channels::{handshake_slot, session_bus, BridgeRx, BusRx, GuacdBridgeRx, SshBridgeRx};
use crate::session::registry::offline_session;
use crate::session::{HandshakeReq, ServerResp, SessionRecord, SshAction};
use crate::state::AppState;
use crate::upstream::{guacd, ssh};
use crate::util::geometry_or_default;
use crate::ws::ConnectQuery;

/// Success envelope shared by the control-plane endpoints.
fn ok_body(data: Value) -> Json<Value> {
    Json(json!({"code": 0, "message": "ok", "data": data}))
}

/// Original client address: first `X-Forwarded-For` hop when present, else
/// the socket peer.
fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| addr.ip().to_string())
}

fn new_handshake_req(
    identity: &Identity,
    headers: &HeaderMap,
    client_ip: String,
    asset_id: i64,
    account_id: i64,
    protocol: String,
    action: SshAction,
    session_id: String,
) -> HandshakeReq {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };
    HandshakeReq {
        uid: identity.uid,
        user_name: identity.user_name.clone(),
        cookie: header("cookie"),
        accept_language: header("accept-language"),
        client_ip,
        asset_id,
        account_id,
        protocol,
        action,
        session_id,
    }
}

/// `POST /connect/{asset_id}/{account_id}/{protocol}` — establish a session.
///
/// On success the session is ONLINE in the registry with its bus wired, and
/// the response carries the record (including the `session_id` the client
/// passes to the WebSocket bind).
pub async fn connect(
    State(state): State<AppState>,
    identity: Identity,
    Path((asset_id, account_id, protocol)): Path<(i64, i64, String)>,
    Query(query): Query<ConnectQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let ip = client_ip(&headers, addr);
    let (bus, rx) = session_bus();
    let (hs_tx, hs_rx) = handshake_slot();
    let BusRx {
        input,
        output,
        window,
        close,
        err,
        stdin,
    } = rx;

    let bridge = match protocol.split(':').next().unwrap_or("") {
        "ssh" => {
            let req = new_handshake_req(
                &identity,
                &headers,
                ip,
                asset_id,
                account_id,
                protocol.clone(),
                SshAction::New,
                String::new(),
            );
            let (w, h, _) = geometry_or_default(
                query.w.as_deref(),
                query.h.as_deref(),
                query.dpi.as_deref(),
                (80, 24, 0),
            );
            tokio::spawn(ssh::run(
                state.clone(),
                req,
                (w, h),
                bus.clone(),
                ssh::SshPumpRx { stdin, window },
                hs_tx,
            ));
            BridgeRx::Ssh(SshBridgeRx {
                input,
                output,
                close,
                err,
            })
        }
        "rdp" | "vnc" => {
            let geometry = geometry_or_default(
                query.w.as_deref(),
                query.h.as_deref(),
                query.dpi.as_deref(),
                (1024, 768, 96),
            );
            tokio::spawn(guacd::run_session(
                state.clone(),
                identity.clone(),
                ip,
                asset_id,
                account_id,
                protocol.clone(),
                geometry,
                bus.clone(),
                input,
                hs_tx,
            ));
            BridgeRx::Guacd(GuacdBridgeRx { output, close, err })
        }
        other => {
            error!("wrong protocol {other}");
            return Err(ApiError::new(
                ErrorKind::InvalidArgument,
                format!("wrong protocol {protocol}"),
            ));
        }
    };

    let resp = await_handshake(hs_rx).await.map_err(|e| {
        error!("failed to connect: {e}");
        e
    })?;
    if resp.code != 0 {
        error!(code = resp.code, "failed to connect: {}", resp.message);
        return Err(ApiError::connect_server(resp.message));
    }

    let session = state.registry.load(&resp.session_id).ok_or_else(|| {
        ApiError::new(ErrorKind::LoadSession, "cannot find session in registry")
    })?;
    *session.bus.lock().await = Some(bus);
    *session.bridge.lock().await = Some(bridge);

    let record: SessionRecord = session.record.read().await.clone();
    Ok(ok_body(serde_json::to_value(record).unwrap_or(Value::Null)))
}

async fn await_handshake(
    hs_rx: crate::session::channels::HandshakeRx,
) -> Result<ServerResp, ApiError> {
    match hs_rx.await {
        Ok(Ok(resp)) => Ok(resp),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ApiError::connect_server("connector vanished")),
    }
}

/// `POST /connect/close/{session_id}` — admin-only session termination.
///
/// A session already gone (or OFFLINE) is success. Whatever the relay says,
/// the local registry entry and its monitors are unwound.
pub async fn close_session(
    State(state): State<AppState>,
    identity: Identity,
    Path(session_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    if !identity.is_admin() {
        return Err(ApiError::no_perm("close session"));
    }

    let Some(record) = state.db.find_online_session(&session_id).await? else {
        return Ok(ok_body(Value::Null));
    };
    info!(
        session_id,
        session_type = ?record.session_type,
        "closing session"
    );

    let result = request_close(&state, &identity, &headers, addr, &record).await;
    offline_session(
        &state.registry,
        &state.catalog,
        &session_id,
        Some(&identity.user_name),
    )
    .await;

    result.map(|()| ok_body(Value::Null))
}

/// Ask the relay to terminate the target via a CLOSE-action handshake.
async fn request_close(
    state: &AppState,
    identity: &Identity,
    headers: &HeaderMap,
    addr: SocketAddr,
    record: &SessionRecord,
) -> Result<(), ApiError> {
    let req = new_handshake_req(
        identity,
        headers,
        client_ip(headers, addr),
        record.asset_id,
        record.account_id,
        record.protocol.clone(),
        SshAction::Close,
        record.session_id.clone(),
    );
    let (bus, rx) = session_bus();
    let (hs_tx, hs_rx) = handshake_slot();
    tokio::spawn(ssh::run(
        state.clone(),
        req,
        (80, 24),
        bus,
        ssh::SshPumpRx {
            stdin: rx.stdin,
            window: rx.window,
        },
        hs_tx,
    ));
    let resp = await_handshake(hs_rx).await?;
    if resp.code != 0 {
        return Err(ApiError::new(ErrorKind::BadRequest, resp.message));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let addr: SocketAddr = "10.1.2.3:9999".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, addr), "10.1.2.3");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.2"),
        );
        assert_eq!(client_ip(&headers, addr), "203.0.113.7");
    }

    #[test]
    fn ok_body_has_zero_code() {
        let Json(body) = ok_body(Value::Null);
        assert_eq!(body["code"], 0);
        assert_eq!(body["message"], "ok");
    }
}
