//! Craftgate - an on-demand gateway for panel-managed game servers
//!
//! This library provides a reverse proxy that:
//! - Discovers servers from the control panel and reads policy flags from their names
//! - Binds a stable public port per server and forwards players once the backend is live
//! - Answers server-list pings and refuses logins locally while a backend is offline
//! - Starts a server when a player tries to join and stops it after it sat empty
//! - Remaps backend ports behind a fixed offset and patches their property files
//! - Relays the voice chat UDP channel per client address
//! - Follows panel push events to pick up new and removed servers

pub mod config;
pub mod discovery;
pub mod error;
pub mod forward;
pub mod gateway;
pub mod handshake;
pub mod lifecycle;
pub mod panel;
pub mod players;
pub mod protocol;
pub mod registry;
pub mod remap;
pub mod server;
pub mod voice;

pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
