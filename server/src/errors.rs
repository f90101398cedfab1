//! Gateway error surface.
//!
//! Every failure the control plane can report is an [`ApiError`] with a
//! semantic [`ErrorKind`]. The kind decides the HTTP status for REST
//! responses and the catalog key for the localized text frame written to an
//! already-upgraded WebSocket before it closes.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::i18n::Catalog;

/// Semantic error categories of the session engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or unusable request input.
    InvalidArgument,
    /// The session id does not name a bindable live session.
    InvalidSessionId,
    /// Registry lookup raced or returned an inconsistent entry.
    LoadSession,
    /// The upstream (relay or guacd) refused or dropped the connection.
    ConnectServer,
    /// Caller lacks the required role.
    NoPerm,
    /// The upstream accepted the request but reported a failure.
    BadRequest,
}

impl ErrorKind {
    /// Wire code reported in JSON bodies. `0` is reserved for success.
    pub fn code(self) -> i32 {
        match self {
            Self::InvalidArgument => 4001,
            Self::InvalidSessionId => 4002,
            Self::BadRequest => 4003,
            Self::NoPerm => 4030,
            Self::LoadSession => 5001,
            Self::ConnectServer => 5002,
        }
    }

    pub fn status(self) -> StatusCode {
        match self {
            Self::InvalidArgument | Self::InvalidSessionId | Self::BadRequest => {
                StatusCode::BAD_REQUEST
            }
            Self::NoPerm => StatusCode::FORBIDDEN,
            Self::LoadSession | Self::ConnectServer => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Catalog key for the localized message delivered over a WebSocket.
    pub fn catalog_key(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid-argument",
            Self::InvalidSessionId => "invalid-session-id",
            Self::LoadSession => "load-session",
            Self::ConnectServer => "connect-server",
            Self::NoPerm => "no-perm",
            Self::BadRequest => "bad-request",
        }
    }
}

/// A typed gateway failure carrying operator-facing detail.
#[derive(Debug, Clone, Error)]
#[error("{detail}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn invalid_session_id(session_id: &str) -> Self {
        Self::new(
            ErrorKind::InvalidSessionId,
            format!("no bindable session {session_id}"),
        )
    }

    pub fn connect_server(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectServer, detail)
    }

    pub fn no_perm(perm: &str) -> Self {
        Self::new(ErrorKind::NoPerm, format!("missing permission: {perm}"))
    }

    /// Message for delivery on a WebSocket, localized for `langs` (ordered
    /// preference list, most specific first).
    pub fn localized(&self, catalog: &Catalog, langs: &[&str]) -> String {
        catalog.localize(langs, self.kind.catalog_key(), &[("detail", &self.detail)])
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "code": self.kind.code(),
            "message": self.detail,
            "data": serde_json::Value::Null,
        }));
        (self.kind.status(), body).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => {
                Self::new(ErrorKind::InvalidArgument, "record not found")
            }
            other => Self::new(ErrorKind::ConnectServer, other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_statuses() {
        assert_eq!(ErrorKind::InvalidArgument.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::InvalidSessionId.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::BadRequest.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::NoPerm.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ErrorKind::LoadSession.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ErrorKind::ConnectServer.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn codes_are_distinct() {
        let kinds = [
            ErrorKind::InvalidArgument,
            ErrorKind::InvalidSessionId,
            ErrorKind::LoadSession,
            ErrorKind::ConnectServer,
            ErrorKind::NoPerm,
            ErrorKind::BadRequest,
        ];
        let mut codes: Vec<i32> = kinds.iter().map(|k| k.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn display_carries_detail() {
        let err = ApiError::connect_server("relay dial refused");
        assert_eq!(err.to_string(), "relay dial refused");
    }
}
