//! linguagate - Self-hosted machine translation gateway.
//!
//! Features:
//! - Model catalog, download with checksum verification, load and drain-aware unload
//! - Direct or two-hop pivot routing with per-request deadlines
//! - Per-key and per-address quotas on requests and characters
//! - API keys backed by SQLite
//! - LibreTranslate-style HTTP API with health probing

pub mod api;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod error;
pub mod gateway;
pub mod http;
pub mod inference;
pub mod language;
pub mod limiter;
pub mod logger;
pub mod registry;
pub mod router;

#[cfg(test)]
pub(crate) mod testing;
