//! # quietproxy
//!
//! Local filtering HTTP proxy. Requests to hosts on a blocklist are refused,
//! everything else is forwarded with a `DNT: 1` privacy header, and
//! completed visits are appended to a durable history unless private mode
//! is on.
//!
//! ## Architecture
//!
//! ```text
//! client ──> ProxyServer ──> RequestInterceptor ──> BlocklistIndex
//!                 │                  │
//!                 │          Block: 403 refusal
//!                 │
//!                 └── Allow: forward upstream, relay response
//!                              └──> HistoryStore (unless private mode)
//! ```
//!
//! [`api::ProxyControl`] is the administrative interface for the toggles,
//! the history and blocklist reloads.

pub mod api;
pub mod config;
pub mod filter;
pub mod logging;
pub mod models;
pub mod proxy;
pub mod stats;
pub mod storage;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
