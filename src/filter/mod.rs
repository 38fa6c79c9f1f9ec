//! Request filtering
//!
//! The blocklist index and the per-request decision engine built on it.

pub mod blocklist;
pub mod interceptor;

pub use blocklist::{normalize_host, BlocklistIndex, BlocklistStats, LoadError};
pub use interceptor::{
    BlockingState, InterceptDecision, RequestInterceptor, Verdict, PRIVACY_HEADER,
};
