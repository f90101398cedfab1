#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]

//! termgate library — the session connection and multiplexing engine behind
//! the gateway binary.
//!
//! - `access` — per-asset access-time schedule evaluation
//! - `auth` — caller identity asserted by the fronting auth layer
//! - `config` — TOML + env-var configuration
//! - `errors` — typed error surface (HTTP statuses, catalog keys)
//! - `i18n` — localized message catalogs
//! - `routes` — control-plane HTTP handlers
//! - `session` — session model, per-session bus, live registry
//! - `store` — relational store access
//! - `upstream` — SSH relay and guacd connectors
//! - `ws` — WebSocket bridge and monitor attachment

pub mod access;
pub mod auth;
pub mod config;
pub mod errors;
pub mod i18n;
pub mod routes;
pub mod session;
pub mod state;
pub mod store;
pub mod upstream;
pub mod util;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use auth::Identity;
pub use config::Config;
pub use errors::{ApiError, ErrorKind};
pub use session::registry::SessionRegistry;
pub use state::AppState;
