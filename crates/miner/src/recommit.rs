//! Adaptive resubmit-interval control.
//!
//! The worker periodically resubmits its sealing work to pull in newly
//! arrived transactions. Build feedback adapts the interval: too-frequent
//! commits grow it toward a target derived from how full the last block
//! was; idle rounds shrink it back toward the user-set minimum. All
//! arithmetic is in nanoseconds to avoid drift.

use std::time::Duration;

/// Minimal interval for recreating the mining block.
pub const MIN_RECOMMIT_INTERVAL: Duration = Duration::from_secs(1);

/// Maximum interval for recreating the mining block.
pub const MAX_RECOMMIT_INTERVAL: Duration = Duration::from_secs(15);

/// Impact a single adjustment has on the interval.
pub const INTERVAL_ADJUST_RATIO: f64 = 0.1;

/// Bias applied toward the limit being approached, in nanoseconds.
pub const INTERVAL_ADJUST_BIAS: f64 = 200_000_000.0;

/// A resubmit-interval adjustment reported by a build.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalAdjust {
    /// Gas-fill ratio of the interrupted build, floor 0.1.
    pub ratio: f64,

    /// Whether the interval should grow.
    pub inc: bool,
}

/// Clamp a user-supplied interval into the supported range.
pub fn sanitize_recommit(interval: Duration) -> Duration {
    interval.clamp(MIN_RECOMMIT_INTERVAL, MAX_RECOMMIT_INTERVAL)
}

/// Recalculate the interval from feedback.
///
/// Growing: `next = (1-α)·prev + α·(target+β)`, capped at the maximum.
/// Shrinking: `next = (1-α)·prev + α·(target-β)`, floored at the
/// user-specified minimum.
pub fn recalc_recommit(
    current: Duration,
    min_recommit: Duration,
    target_ns: f64,
    inc: bool,
) -> Duration {
    let prev = current.as_nanos() as f64;
    let next = if inc {
        let next = prev * (1.0 - INTERVAL_ADJUST_RATIO)
            + INTERVAL_ADJUST_RATIO * (target_ns + INTERVAL_ADJUST_BIAS);
        next.min(MAX_RECOMMIT_INTERVAL.as_nanos() as f64)
    } else {
        let next = prev * (1.0 - INTERVAL_ADJUST_RATIO)
            + INTERVAL_ADJUST_RATIO * (target_ns - INTERVAL_ADJUST_BIAS);
        next.max(min_recommit.as_nanos() as f64)
    };
    Duration::from_nanos(next as u64)
}
