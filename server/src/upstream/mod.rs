//! Upstream connectors.
//!
//! A connector owns one back-end connection for the lifetime of a session and
//! speaks to the rest of the gateway only through the session bus and the
//! handshake slot:
//!
//! - [`ssh`] — character sessions through the configured SSH relay
//! - [`guacd`] — graphical (RDP/VNC) sessions through the Guacamole daemon
//!
//! Connectors never hand errors to HTTP handlers directly. The connection
//! attempt resolves the handshake oneshot; anything fatal after that goes out
//! on the bus's `err` queue, and teardown cancels `away` so both sides of a
//! session always converge.

pub mod guacd;
pub mod ssh;
