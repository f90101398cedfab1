//! Process-wide registry of live sessions.
//!
//! A session is either ONLINE with an entry here, or OFFLINE with none. The
//! registry is owned by [`crate::state::AppState`] and handed to handlers, so
//! tests get isolated instances instead of a package-level singleton.

use std::sync::Arc;

use axum::extract::ws::Message;
use dashmap::DashMap;
use tracing::debug;

use crate::errors::ApiError;
use crate::i18n::{Catalog, MSG_SESSION_END};
use crate::session::Session;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, session_id: &str, session: Arc<Session>) {
        self.sessions.insert(session_id.to_string(), session);
    }

    pub fn load(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|e| Arc::clone(e.value()))
    }

    /// Loader used by the primary WebSocket bind: the session must exist and
    /// must not already be attached.
    pub fn load_for_bridge(&self, session_id: &str) -> Result<Arc<Session>, ApiError> {
        let session = self
            .load(session_id)
            .ok_or_else(|| ApiError::invalid_session_id(session_id))?;
        if session.is_connected() {
            return Err(ApiError::invalid_session_id(session_id));
        }
        Ok(session)
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(session_id).map(|(_, s)| s)
    }

    /// Ids of every live session (shutdown sweep).
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Tear down the observable side of a session: hand the closer name to the
/// driver (bounded), say goodbye to every monitor in its own language, and
/// drop the registry entry.
///
/// Safe to call for sessions that are already gone.
pub async fn offline_session(
    registry: &SessionRegistry,
    catalog: &Catalog,
    session_id: &str,
    closer: Option<&str>,
) {
    debug!(session_id, ?closer, "offline session");
    let Some(session) = registry.load(session_id) else {
        registry.remove(session_id);
        return;
    };

    if let Some(closer) = closer.filter(|c| !c.is_empty()) {
        let bus = session.bus.lock().await.clone();
        if let Some(bus) = bus {
            // A driver that never took the closer (none bound, or wedged) is
            // unwound directly; a live one says goodbye first and cancels on
            // its own way out.
            if !bus.send_close(closer).await {
                bus.close_away();
            }
        }
    }

    let keys: Vec<String> = session.monitors.iter().map(|e| e.key().clone()).collect();
    for key in keys {
        if let Some((_, handle)) = session.monitors.remove(&key) {
            let prefs: Vec<&str> = handle.lang.as_deref().into_iter().collect();
            let farewell =
                catalog.localize(&prefs, MSG_SESSION_END, &[("session_id", session_id)]);
            let _ = handle.tx.try_send(Message::Text(farewell.into()));
            // The funnel forwards the close frame and shuts the socket; the
            // observer's read loop then sees the disconnect and detaches.
            let _ = handle.tx.try_send(Message::Close(None));
        }
    }

    registry.remove(session_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MonitorHandle, SessionRecord, SessionStatus, SessionType};
    use chrono::Utc;
    use tokio::sync::mpsc;

    fn live_session(id: &str) -> Arc<Session> {
        Arc::new(Session::from_record(SessionRecord {
            session_id: id.into(),
            session_type: SessionType::Web,
            protocol: "ssh".into(),
            uid: 916,
            user_name: "ruiji.wei".into(),
            asset_id: 1,
            asset_info: String::new(),
            account_id: 1,
            account_info: String::new(),
            gateway_id: 0,
            gateway_info: String::new(),
            client_ip: "127.0.0.1".into(),
            status: SessionStatus::Online,
            connection_id: String::new(),
            created_at: Utc::now(),
            closed_at: None,
        }))
    }

    #[test]
    fn load_for_bridge_rejects_unknown_and_rebinds() {
        let registry = SessionRegistry::new();
        assert!(registry.load_for_bridge("nope").is_err());

        let session = live_session("s-1");
        registry.store("s-1", Arc::clone(&session));
        assert!(registry.load_for_bridge("s-1").is_ok());

        assert!(session.mark_connected());
        let err = registry.load_for_bridge("s-1").unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::InvalidSessionId);
    }

    #[tokio::test]
    async fn offline_session_farewells_monitors_and_clears_entry() {
        let registry = SessionRegistry::new();
        let catalog = Catalog::builtin("en");
        let session = live_session("s-2");
        let (tx, mut rx) = mpsc::channel(4);
        session
            .monitors
            .insert("916-s-2-1".into(), MonitorHandle { tx, lang: None });
        registry.store("s-2", Arc::clone(&session));

        offline_session(&registry, &catalog, "s-2", None).await;

        assert!(registry.is_empty());
        assert!(session.monitors.is_empty());
        match rx.recv().await.unwrap() {
            Message::Text(text) => assert_eq!(text.as_str(), "session s-2 ended"),
            other => panic!("unexpected frame: {other:?}"),
        }
        // The farewell is followed by a close so the funnel shuts the socket.
        assert!(matches!(rx.recv().await.unwrap(), Message::Close(_)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn offline_session_tolerates_missing_sessions() {
        let registry = SessionRegistry::new();
        let catalog = Catalog::builtin("en");
        offline_session(&registry, &catalog, "ghost", Some("admin")).await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn offline_session_hands_the_closer_to_the_driver() {
        let registry = SessionRegistry::new();
        let catalog = Catalog::builtin("en");
        let session = live_session("s-3");
        let (bus, mut rx) = crate::session::channels::session_bus();
        *session.bus.lock().await = Some(bus);
        registry.store("s-3", Arc::clone(&session));

        offline_session(&registry, &catalog, "s-3", Some("admin")).await;
        assert_eq!(rx.close.recv().await.as_deref(), Some("admin"));
        assert!(registry.is_empty());
    }
}
