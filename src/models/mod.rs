//! Data models shared by the proxy, the history store and the admin API

pub mod request;
pub mod visit;

pub use request::*;
pub use visit::*;
