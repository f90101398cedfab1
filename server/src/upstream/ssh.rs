//! SSH relay connector.
//!
//! Character sessions do not go to the target asset directly: the gateway
//! dials one configured relay, asks for an `xterm` PTY with echo off, starts
//! the remote shell, and performs a one-line JSON handshake terminated by
//! `\r`. The relay authenticates the request and splices the real asset
//! behind the same byte stream, so after the handshake the channel carries
//! plain terminal traffic.

use std::sync::Arc;

use chrono::Utc;
use async_trait::async_trait;
use russh::client::{self, Handler};
use russh::keys::{HashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect, Pty};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::RelayConfig;
use crate::errors::ApiError;
use crate::session::channels::{HandshakeTx, SessionBus};
use crate::session::registry::offline_session;
use crate::session::{
    HandshakeReq, ServerResp, Session, SessionRecord, SessionStatus, SessionType, SshAction,
};
use crate::state::AppState;
use crate::util::{parse_window, Utf8Carry};

/// Receiver ends the SSH connector consumes: the stdin pipe and resize
/// messages.
pub struct SshPumpRx {
    pub stdin: mpsc::UnboundedReceiver<Vec<u8>>,
    pub window: mpsc::UnboundedReceiver<String>,
}

/// Host key policy: verify against the pinned fingerprint when one is
/// configured, otherwise accept and leave an audit trail.
struct RelayVerifier {
    pinned: Option<String>,
}

#[async_trait]
impl Handler for RelayVerifier {
    type Error = russh::Error;

    async fn check_server_key(&mut self, key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();
        match self.pinned.as_deref() {
            Some(expected) if expected == fingerprint => Ok(true),
            Some(expected) => {
                warn!(%fingerprint, %expected, "relay host key mismatch, refusing");
                Ok(false)
            }
            None => {
                warn!(%fingerprint, "relay host key not pinned, accepting");
                Ok(true)
            }
        }
    }
}

/// The handshake request as written to the relay: one JSON line plus `\r`.
fn encode_request(req: &HandshakeReq) -> Result<Vec<u8>, ApiError> {
    let mut payload = serde_json::to_vec(req)
        .map_err(|e| ApiError::connect_server(format!("marshal handshake: {e}")))?;
    payload.push(b'\r');
    Ok(payload)
}

async fn dial(
    relay: &RelayConfig,
    size: (u32, u32),
) -> Result<(client::Handle<RelayVerifier>, russh::Channel<client::Msg>), ApiError> {
    let config = Arc::new(client::Config::default());
    let verifier = RelayVerifier {
        pinned: relay.host_key_fingerprint.clone(),
    };
    let mut handle = client::connect(config, (relay.host.as_str(), relay.port), verifier)
        .await
        .map_err(|e| ApiError::connect_server(format!("relay dial failed: {e}")))?;

    let auth = handle
        .authenticate_password(relay.account.as_str(), relay.password.as_str())
        .await
        .map_err(|e| ApiError::connect_server(format!("relay auth failed: {e}")))?;
    if !auth {
        return Err(ApiError::connect_server("relay rejected credentials"));
    }

    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| ApiError::connect_server(format!("relay session open failed: {e}")))?;
    let modes = [
        (Pty::ECHO, 0),
        (Pty::TTY_OP_ISPEED, 14400),
        (Pty::TTY_OP_OSPEED, 14400),
    ];
    channel
        .request_pty(false, "xterm", size.0, size.1, 0, 0, &modes)
        .await
        .map_err(|e| ApiError::connect_server(format!("relay pty request failed: {e}")))?;
    channel
        .request_shell(false)
        .await
        .map_err(|e| ApiError::connect_server(format!("relay shell start failed: {e}")))?;
    Ok((handle, channel))
}

/// Write the request line, read the reply up to the first `\r`. Whatever
/// follows the `\r` already belongs to the terminal stream and is returned
/// for the pump to emit.
async fn exchange(
    channel: &mut russh::Channel<client::Msg>,
    req: &HandshakeReq,
) -> Result<(ServerResp, Vec<u8>), ApiError> {
    let payload = encode_request(req)?;
    channel
        .data(&payload[..])
        .await
        .map_err(|e| ApiError::connect_server(format!("handshake write failed: {e}")))?;

    let mut buf: Vec<u8> = Vec::new();
    let line_end = loop {
        if let Some(i) = buf.iter().position(|&b| b == b'\r') {
            break i;
        }
        match channel.wait().await {
            Some(ChannelMsg::Data { data })
            | Some(ChannelMsg::ExtendedData { data, .. }) => buf.extend_from_slice(&data),
            Some(ChannelMsg::Eof | ChannelMsg::Close | ChannelMsg::ExitStatus { .. }) | None => {
                return Err(ApiError::connect_server("relay closed during handshake"))
            }
            Some(_) => {}
        }
    };
    let resp: ServerResp = serde_json::from_slice(&buf[..line_end])
        .map_err(|e| ApiError::connect_server(format!("bad handshake reply: {e}")))?;
    Ok((resp, buf[line_end + 1..].to_vec()))
}

/// Create the live session for a relay-accepted NEW handshake and make it
/// loadable before the handshake resolves.
async fn register_session(
    state: &AppState,
    req: &HandshakeReq,
    resp: &ServerResp,
) -> Arc<Session> {
    // Descriptors are cosmetic; a missing row must not kill a session the
    // relay accepted.
    let asset_info = state
        .db
        .asset(req.asset_id)
        .await
        .map(|a| a.info())
        .unwrap_or_default();
    let account_info = state
        .db
        .account(req.account_id)
        .await
        .map(|a| a.info())
        .unwrap_or_default();

    let record = SessionRecord {
        session_id: resp.session_id.clone(),
        session_type: SessionType::Web,
        protocol: req.protocol.clone(),
        uid: if resp.uid != 0 { resp.uid } else { req.uid },
        user_name: if resp.user_name.is_empty() {
            req.user_name.clone()
        } else {
            resp.user_name.clone()
        },
        asset_id: req.asset_id,
        asset_info,
        account_id: req.account_id,
        account_info,
        gateway_id: 0,
        gateway_info: String::new(),
        client_ip: req.client_ip.clone(),
        status: SessionStatus::Online,
        connection_id: String::new(),
        created_at: Utc::now(),
        closed_at: None,
    };
    let session = Arc::new(Session::from_record(record));
    if let Err(e) = state.db.upsert_session(&*session.record.read().await).await {
        warn!(session_id = %resp.session_id, "session upsert failed: {e}");
    }
    state
        .registry
        .store(&resp.session_id, Arc::clone(&session));
    session
}

/// Relay connector. Dials, shakes hands, resolves `handshake`, then (for NEW
/// and MONITOR) pumps bytes until the relay, the bridge, or an admin close
/// ends the session. CLOSE is handshake-only: the relay terminates the
/// target.
pub async fn run(
    state: AppState,
    req: HandshakeReq,
    size: (u32, u32),
    bus: SessionBus,
    rx: SshPumpRx,
    handshake_tx: HandshakeTx,
) {
    let (handle, mut channel) = match dial(&state.config.relay, size).await {
        Ok(v) => v,
        Err(e) => {
            let _ = handshake_tx.send(Err(e));
            return;
        }
    };
    let (resp, leftover) = match exchange(&mut channel, &req).await {
        Ok(v) => v,
        Err(e) => {
            let _ = handshake_tx.send(Err(e));
            return;
        }
    };

    let accepted = resp.code == 0;
    let session = if accepted && req.action == SshAction::New {
        Some(register_session(&state, &req, &resp).await)
    } else {
        None
    };
    let session_id = resp.session_id.clone();
    let _ = handshake_tx.send(Ok(resp));

    if !accepted || req.action == SshAction::Close {
        let _ = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
        return;
    }

    if let Some(e) = pump(channel, &bus, rx, leftover).await {
        warn!(session_id, "ssh pump stopped: {e}");
        let _ = bus.err.try_send(e);
    }

    if let Some(session) = session {
        {
            let mut record = session.record.write().await;
            record.status = SessionStatus::Offline;
            record.closed_at = Some(Utc::now());
            if let Err(e) = state.db.upsert_session(&record).await {
                warn!(session_id, "offline upsert failed: {e}");
            }
        }
        offline_session(&state.registry, &state.catalog, &session_id, None).await;
    }
    bus.close_away();
    let _ = handle
        .disconnect(Disconnect::ByApplication, "", "en")
        .await;
    debug!(session_id, "ssh session ended");
}

/// One resolved wakeup of the pump loop. The select produces an event and
/// drops its borrows before the channel is touched again, so upstream reads
/// and writes never alias.
enum PumpEvent {
    Upstream(Option<ChannelMsg>),
    Stdin(Option<Vec<u8>>),
    Window(Option<String>),
    Away,
}

/// Post-handshake pump. Returns the fatal error, if any; a clean remote exit
/// returns `None`.
async fn pump(
    mut channel: russh::Channel<client::Msg>,
    bus: &SessionBus,
    rx: SshPumpRx,
    leftover: Vec<u8>,
) -> Option<ApiError> {
    let SshPumpRx {
        mut stdin,
        mut window,
    } = rx;
    let mut carry = Utf8Carry::new();

    if !leftover.is_empty() {
        if let Some(text) = carry.push(&leftover) {
            if !bus.send_output(text.into_bytes()).await {
                return None;
            }
        }
    }

    loop {
        let event = tokio::select! {
            _ = bus.away.cancelled() => PumpEvent::Away,
            msg = channel.wait() => PumpEvent::Upstream(msg),
            data = stdin.recv() => PumpEvent::Stdin(data),
            win = window.recv() => PumpEvent::Window(win),
        };
        match event {
            PumpEvent::Away => return None,
            PumpEvent::Upstream(msg) => match msg {
                Some(ChannelMsg::Data { data })
                | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if let Some(text) = carry.push(&data) {
                        if !bus.send_output(text.into_bytes()).await {
                            return None;
                        }
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!(exit_status, "relay shell exited");
                    return None;
                }
                Some(ChannelMsg::Eof | ChannelMsg::Close) | None => {
                    return Some(ApiError::connect_server("server disconnected"));
                }
                Some(_) => {}
            },
            PumpEvent::Stdin(Some(data)) => {
                if let Err(e) = channel.data(&data[..]).await {
                    return Some(ApiError::connect_server(format!("stdin write failed: {e}")));
                }
            }
            PumpEvent::Window(Some(win)) => {
                if let Some((w, h)) = parse_window(&win) {
                    // The SSH message orders columns before rows.
                    if let Err(e) = channel.window_change(w, h, 0, 0).await {
                        warn!("reset window size failed: {e}");
                    }
                }
            }
            // A dropped sender means the session is being torn down.
            PumpEvent::Stdin(None) | PumpEvent::Window(None) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_is_json_plus_carriage_return() {
        let req = HandshakeReq {
            uid: 916,
            user_name: "ruiji.wei".into(),
            cookie: String::new(),
            accept_language: "en".into(),
            client_ip: "127.0.0.1".into(),
            asset_id: 1,
            account_id: 1,
            protocol: "ssh".into(),
            action: SshAction::New,
            session_id: String::new(),
        };
        let payload = encode_request(&req).unwrap();
        assert_eq!(*payload.last().unwrap(), b'\r');
        let parsed: HandshakeReq = serde_json::from_slice(&payload[..payload.len() - 1]).unwrap();
        assert_eq!(parsed.uid, 916);
        assert_eq!(parsed.action, SshAction::New);
        // Exactly one line: the relay frames on the terminating \r.
        assert_eq!(payload.iter().filter(|&&b| b == b'\r').count(), 1);
    }
}
