//! Filtering HTTP proxy
//!
//! Wire parsing, upstream connections and the server loop that ties them
//! to the interceptor and the history store.

pub mod http;
pub mod server;
pub mod upstream;

pub use server::{ProxyServer, ServerSettings, BLOCKED_BY_HEADER};
pub use upstream::{TcpConnector, UpstreamConnector, UpstreamError, UpstreamStream};
