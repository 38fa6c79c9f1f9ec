//! Administrative surface of the proxy
//!
//! [`ProxyControl`] changes shared state, [`start_proxy`] wires everything
//! together and the admin endpoint exposes the control over loopback HTTP.

pub mod admin_http;
pub mod control;
pub mod runtime;

pub use control::{ProxyControl, ProxyStatus};
pub use runtime::{start_proxy, start_proxy_with, ServerHandle};
