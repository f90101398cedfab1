//! Caller identity, as asserted by the fronting auth layer.
//!
//! The gateway does not authenticate users itself; it sits behind an
//! authenticating proxy that injects the caller's identity into every
//! request: `x-auth-uid`, `x-auth-user`, and `x-auth-roles` (comma
//! separated). Requests missing the identity headers are rejected before any
//! session machinery runs.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;

use crate::errors::{ApiError, ErrorKind};

pub const UID_HEADER: &str = "x-auth-uid";
pub const USER_HEADER: &str = "x-auth-user";
pub const ROLES_HEADER: &str = "x-auth-roles";

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct Identity {
    pub uid: i64,
    pub user_name: String,
    pub roles: Vec<String>,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == "admin")
    }

    /// Parse the identity headers; `None` when they are absent or malformed.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let uid = headers.get(UID_HEADER)?.to_str().ok()?.trim().parse().ok()?;
        let user_name = headers.get(USER_HEADER)?.to_str().ok()?.trim().to_string();
        if user_name.is_empty() {
            return None;
        }
        let roles = headers
            .get(ROLES_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            uid,
            user_name,
            roles,
        })
    }
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Identity::from_headers(&parts.headers)
            .ok_or_else(|| ApiError::new(ErrorKind::NoPerm, "missing identity headers"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(uid: &str, user: &str, roles: Option<&str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(UID_HEADER, HeaderValue::from_str(uid).unwrap());
        h.insert(USER_HEADER, HeaderValue::from_str(user).unwrap());
        if let Some(roles) = roles {
            h.insert(ROLES_HEADER, HeaderValue::from_str(roles).unwrap());
        }
        h
    }

    #[test]
    fn parses_identity_and_roles() {
        let id = Identity::from_headers(&headers("916", "ruiji.wei", Some("admin, ops"))).unwrap();
        assert_eq!(id.uid, 916);
        assert_eq!(id.user_name, "ruiji.wei");
        assert!(id.is_admin());
    }

    #[test]
    fn missing_roles_is_not_admin() {
        let id = Identity::from_headers(&headers("7", "bob", None)).unwrap();
        assert!(!id.is_admin());
    }

    #[test]
    fn rejects_missing_or_bad_uid() {
        assert!(Identity::from_headers(&HeaderMap::new()).is_none());
        assert!(Identity::from_headers(&headers("abc", "bob", None)).is_none());
    }
}
