//! Session model: the persisted record, the live in-process session, and the
//! wire types exchanged with the upstream relay.
//!
//! A [`SessionRecord`] is what the store and the control-plane JSON see. A
//! [`Session`] is the live object in the registry: the record plus runtime
//! state — the one-shot `connected` attach flag, the monitor fan-out map, and
//! the bus handles connecting the WebSocket bridge to the connector.

pub mod channels;
pub mod registry;

use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use channels::{BridgeRx, SessionBus};

/// Who created the session: this gateway's web flow, or a client that went
/// straight to the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[repr(i32)]
#[serde(into = "i32", from = "i32")]
pub enum SessionType {
    Web = 1,
    Client = 2,
}

impl From<SessionType> for i32 {
    fn from(t: SessionType) -> i32 {
        t as i32
    }
}

impl From<i32> for SessionType {
    fn from(v: i32) -> Self {
        if v == 2 {
            Self::Client
        } else {
            Self::Web
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[repr(i32)]
#[serde(into = "i32", from = "i32")]
pub enum SessionStatus {
    Online = 1,
    Offline = 2,
}

impl From<SessionStatus> for i32 {
    fn from(s: SessionStatus) -> i32 {
        s as i32
    }
}

impl From<i32> for SessionStatus {
    fn from(v: i32) -> Self {
        if v == 1 {
            Self::Online
        } else {
            Self::Offline
        }
    }
}

/// Handshake action requested from the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i32", from = "i32")]
pub enum SshAction {
    New = 1,
    Monitor = 2,
    Close = 3,
}

impl From<SshAction> for i32 {
    fn from(a: SshAction) -> i32 {
        a as i32
    }
}

impl From<i32> for SshAction {
    fn from(v: i32) -> Self {
        match v {
            2 => Self::Monitor,
            3 => Self::Close,
            _ => Self::New,
        }
    }
}

/// The persisted/serialized part of a session.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionRecord {
    pub session_id: String,
    pub session_type: SessionType,
    /// `ssh`, `rdp:<port>` or `vnc:<port>`.
    pub protocol: String,
    pub uid: i64,
    pub user_name: String,
    pub asset_id: i64,
    /// Human-readable `name(ip)`.
    pub asset_info: String,
    pub account_id: i64,
    /// Human-readable `name(login)`.
    pub account_info: String,
    pub gateway_id: i64,
    /// `host:port`, empty when the asset has no gateway hop.
    pub gateway_info: String,
    pub client_ip: String,
    pub status: SessionStatus,
    /// Upstream-assigned id used to rejoin graphical sessions for monitoring.
    pub connection_id: String,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn is_ssh(&self) -> bool {
        self.protocol.starts_with("ssh")
    }
}

/// A read-only attachment to a live session. `tx` funnels frames to the
/// observer's WebSocket; `lang` is the preference captured at attach time,
/// used to localize the farewell when the session ends.
#[derive(Debug)]
pub struct MonitorHandle {
    pub tx: mpsc::Sender<Message>,
    pub lang: Option<String>,
}

/// A live session held by the registry.
#[derive(Debug)]
pub struct Session {
    pub record: tokio::sync::RwLock<SessionRecord>,
    /// Flips false→true exactly once, on the first primary WebSocket bind.
    pub connected: AtomicBool,
    /// Observer key → monitor funnel.
    pub monitors: DashMap<String, MonitorHandle>,
    /// Sender-side bus handle; `None` for client-originated sessions until a
    /// monitor attaches.
    pub bus: Mutex<Option<SessionBus>>,
    /// Receiver side parked for the one-time primary WebSocket attach.
    pub bridge: Mutex<Option<BridgeRx>>,
}

impl Session {
    pub fn from_record(record: SessionRecord) -> Self {
        Self {
            record: tokio::sync::RwLock::new(record),
            connected: AtomicBool::new(false),
            monitors: DashMap::new(),
            bus: Mutex::new(None),
            bridge: Mutex::new(None),
        }
    }

    /// First-attach gate: true exactly once.
    pub fn mark_connected(&self) -> bool {
        self.connected
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn is_ssh(&self) -> bool {
        self.record.read().await.is_ssh()
    }

    pub async fn session_type(&self) -> SessionType {
        self.record.read().await.session_type
    }

    pub fn has_monitors(&self) -> bool {
        !self.monitors.is_empty()
    }

    /// Best-effort delivery of one frame to every monitor. A saturated or
    /// gone observer is skipped, never waited on.
    pub fn fan_out(&self, msg: &Message) {
        for entry in self.monitors.iter() {
            let _ = entry.value().tx.try_send(msg.clone());
        }
    }
}

/// Handshake request sent to the relay as one JSON line terminated by `\r`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeReq {
    pub uid: i64,
    pub user_name: String,
    pub cookie: String,
    pub accept_language: String,
    pub client_ip: String,
    pub asset_id: i64,
    pub account_id: i64,
    pub protocol: String,
    pub action: SshAction,
    /// Empty for `New`; the target session for `Monitor`/`Close`.
    #[serde(default)]
    pub session_id: String,
}

/// Relay reply: one JSON line terminated by `\r`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerResp {
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub uid: i64,
    #[serde(default)]
    pub user_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(protocol: &str) -> SessionRecord {
        SessionRecord {
            session_id: "s-1".into(),
            session_type: SessionType::Web,
            protocol: protocol.into(),
            uid: 916,
            user_name: "ruiji.wei".into(),
            asset_id: 1,
            asset_info: "host-1(10.0.0.1)".into(),
            account_id: 1,
            account_info: "root(root)".into(),
            gateway_id: 0,
            gateway_info: String::new(),
            client_ip: "127.0.0.1".into(),
            status: SessionStatus::Online,
            connection_id: String::new(),
            created_at: Utc::now(),
            closed_at: None,
        }
    }

    #[test]
    fn protocol_discriminates_ssh() {
        assert!(record("ssh").is_ssh());
        assert!(!record("rdp:13389").is_ssh());
        assert!(!record("vnc:5901").is_ssh());
    }

    #[test]
    fn mark_connected_flips_exactly_once() {
        let session = Session::from_record(record("ssh"));
        assert!(!session.is_connected());
        assert!(session.mark_connected());
        assert!(!session.mark_connected());
        assert!(session.is_connected());
    }

    #[test]
    fn enums_round_trip_through_json_as_integers() {
        let json = serde_json::to_string(&SessionStatus::Online).unwrap();
        assert_eq!(json, "1");
        let back: SessionStatus = serde_json::from_str("2").unwrap();
        assert_eq!(back, SessionStatus::Offline);
        assert_eq!(serde_json::to_string(&SshAction::Close).unwrap(), "3");
    }

    #[test]
    fn handshake_req_serializes_action_numerically() {
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
        let value: serde_json::Value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["action"], 1);
        assert_eq!(value["asset_id"], 1);
    }
}
