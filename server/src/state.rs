//! Shared application state passed to every handler via Axum's `State`
//! extractor.

use std::sync::Arc;

use crate::config::Config;
use crate::i18n::Catalog;
use crate::session::registry::SessionRegistry;
use crate::store::Db;

/// Shared application state for the gateway.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Relational store handle.
    pub db: Db,
    /// Live session registry.
    pub registry: Arc<SessionRegistry>,
    /// Localized message catalogs.
    pub catalog: Arc<Catalog>,
}
