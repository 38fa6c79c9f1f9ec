use super::blocklist::BlocklistIndex;
use crate::stats::ProxyStats;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Header sent with every forwarded request and every response
pub const PRIVACY_HEADER: (&str, &str) = ("DNT", "1");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    Allow,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptDecision {
    pub verdict: Verdict,
    /// Headers to inject, regardless of the verdict
    pub headers: Vec<(&'static str, &'static str)>,
}

impl InterceptDecision {
    fn new(verdict: Verdict) -> Self {
        Self {
            verdict,
            headers: vec![PRIVACY_HEADER],
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.verdict == Verdict::Block
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockingState {
    pub active: bool,
}

/// Per-request allow/block decisions.
///
/// Holds the blocking toggle; the blocklist itself is shared with whoever
/// reloads it.
#[derive(Debug)]
pub struct RequestInterceptor {
    blocklist: Arc<BlocklistIndex>,
    active: AtomicBool,
    stats: Arc<ProxyStats>,
}

impl RequestInterceptor {
    pub fn new(blocklist: Arc<BlocklistIndex>, active: bool, stats: Arc<ProxyStats>) -> Self {
        Self {
            blocklist,
            active: AtomicBool::new(active),
            stats,
        }
    }

    pub fn evaluate(&self, host: &str) -> InterceptDecision {
        self.evaluate_with(host, self.blocking_state())
    }

    /// Decide against an explicit state snapshot.
    pub fn evaluate_with(&self, host: &str, state: BlockingState) -> InterceptDecision {
        if !state.active || !self.blocklist.matches(host) {
            return InterceptDecision::new(Verdict::Allow);
        }
        self.stats.record_blocked();
        tracing::info!(
            target: "quietproxy::blocked",
            host = %host,
            reason = "blocklist",
            "Blocked request"
        );
        InterceptDecision::new(Verdict::Block)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn blocking_state(&self) -> BlockingState {
        BlockingState {
            active: self.active.load(Ordering::Acquire),
        }
    }

    pub fn blocklist(&self) -> &Arc<BlocklistIndex> {
        &self.blocklist
    }
}
