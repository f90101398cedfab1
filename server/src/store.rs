//! Relational store access.
//!
//! The engine touches the database in exactly four ways: asset/account/gateway
//! point lookups when a graphical tunnel is built, session upsert on create
//! and on close, and the ONLINE point lookup backing admin close and the
//! monitor loader's fallback. Everything else about persistence lives outside
//! this crate.

use serde::{Deserialize, Serialize};
use sqlx::mysql::MySqlPool;
use sqlx::types::Json;

use crate::access::AccessAuth;
use crate::errors::{ApiError, ErrorKind};
use crate::session::{SessionRecord, SessionStatus};

/// A registered connection target.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Asset {
    pub id: i64,
    pub name: String,
    pub ip: String,
    pub gateway_id: i64,
    pub access_auth: Json<AccessAuth>,
}

impl Asset {
    /// `name(ip)` descriptor stored on session records.
    pub fn info(&self) -> String {
        format!("{}({})", self.name, self.ip)
    }
}

/// A credential pair bound to an asset.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub account: String,
    pub password: String,
}

impl Account {
    pub fn info(&self) -> String {
        format!("{}({})", self.name, self.account)
    }
}

/// An SSH bastion hop some assets sit behind.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Gateway {
    pub id: i64,
    pub host: String,
    pub port: i32,
    pub account: String,
    pub password: String,
}

impl Gateway {
    pub fn info(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Pooled store handle. Cloneable; all clones share the pool.
#[derive(Clone)]
pub struct Db {
    pool: MySqlPool,
}

impl Db {
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let pool = MySqlPool::connect(url).await?;
        Ok(Self { pool })
    }

    pub async fn asset(&self, id: i64) -> Result<Asset, ApiError> {
        sqlx::query_as::<_, Asset>(
            "SELECT id, name, ip, gateway_id, access_auth FROM asset WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ApiError::new(ErrorKind::ConnectServer, format!("asset {id} not found")))
    }

    pub async fn account(&self, id: i64) -> Result<Account, ApiError> {
        sqlx::query_as::<_, Account>(
            "SELECT id, name, account, password FROM account WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ApiError::new(ErrorKind::ConnectServer, format!("account {id} not found")))
    }

    pub async fn gateway(&self, id: i64) -> Result<Gateway, ApiError> {
        sqlx::query_as::<_, Gateway>(
            "SELECT id, host, port, account, password FROM gateway WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ApiError::new(ErrorKind::ConnectServer, format!("gateway {id} not found")))
    }

    /// Insert the session on create, refresh status/closed_at on later calls.
    pub async fn upsert_session(&self, record: &SessionRecord) -> Result<(), ApiError> {
        sqlx::query(
            "INSERT INTO session \
             (session_id, session_type, protocol, uid, user_name, asset_id, asset_info, \
              account_id, account_info, gateway_id, gateway_info, client_ip, status, \
              connection_id, created_at, closed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE status = VALUES(status), closed_at = VALUES(closed_at)",
        )
        .bind(&record.session_id)
        .bind(record.session_type)
        .bind(&record.protocol)
        .bind(record.uid)
        .bind(&record.user_name)
        .bind(record.asset_id)
        .bind(&record.asset_info)
        .bind(record.account_id)
        .bind(&record.account_info)
        .bind(record.gateway_id)
        .bind(&record.gateway_info)
        .bind(&record.client_ip)
        .bind(record.status)
        .bind(&record.connection_id)
        .bind(record.created_at)
        .bind(record.closed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Point lookup used by admin close and the monitor loader's fallback.
    pub async fn find_online_session(
        &self,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, ApiError> {
        let record = sqlx::query_as::<_, SessionRecord>(
            "SELECT session_id, session_type, protocol, uid, user_name, asset_id, asset_info, \
             account_id, account_info, gateway_id, gateway_info, client_ip, status, \
             connection_id, created_at, closed_at \
             FROM session WHERE session_id = ? AND status = ?",
        )
        .bind(session_id)
        .bind(SessionStatus::Online)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }
}
