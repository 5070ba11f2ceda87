//! Per-shipment refresh rate limiting.
//!
//! The decision is a pure function of the inputs so the engine, the
//! scheduler and the email validation path all enforce the same gate.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Default spacing between carrier calls for one shipment
pub const REFRESH_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub should_block: bool,
    /// Time until the gate opens again; zero when not blocked
    pub remaining: Duration,
    pub reason: &'static str,
}

impl RateLimitDecision {
    fn pass(reason: &'static str) -> Self {
        Self {
            should_block: false,
            remaining: Duration::ZERO,
            reason,
        }
    }
}

/// Decide whether a refresh may reach the carrier.
///
/// The window boundary is inclusive: a refresh exactly `window` after the
/// previous one passes.
pub fn check_refresh_rate_limit(
    disabled: bool,
    window: Duration,
    last_manual_refresh: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    force: bool,
) -> RateLimitDecision {
    if force {
        return RateLimitDecision::pass("forced_refresh");
    }
    let Some(last) = last_manual_refresh else {
        return RateLimitDecision::pass("no_previous_refresh");
    };
    if disabled {
        return RateLimitDecision::pass("rate_limit_disabled");
    }

    let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
    if elapsed < window {
        RateLimitDecision {
            should_block: true,
            remaining: window - elapsed,
            reason: "rate_limit_active",
        }
    } else {
        RateLimitDecision::pass("rate_limit_passed")
    }
}
