//! Capacity scheduling with a shared token bucket
//!
//! The governor is shared by every worker of a fetch or load run so the
//! configured capacity is a soft average across all of them; the burst equals
//! the refill rate, which absorbs worker scheduling jitter. A capacity of
//! zero or below means no governor at all and callers skip the wait entirely.

use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Token bucket granting `capacity` units per second with a burst of the
/// same size.
pub struct RateGovernor {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    clock: DefaultClock,
    burst: NonZeroU32,
}

impl RateGovernor {
    /// Build a governor for `capacity` units per second. Returns `None` when
    /// the capacity rounds down to zero, meaning unlimited.
    pub fn per_second(capacity: f64) -> Option<Self> {
        if capacity <= 0.0 {
            return None;
        }
        let units = NonZeroU32::new(capacity as u32)?;
        let quota = Quota::per_second(units).allow_burst(units);
        Some(Self {
            limiter: RateLimiter::direct(quota),
            clock: DefaultClock::default(),
            burst: units,
        })
    }

    /// Attempt to take `units` tokens. Returns `None` when the caller may
    /// proceed immediately, or the duration to sleep before trying again.
    ///
    /// Requests larger than the burst are clamped to the burst so a single
    /// oversized response cannot wedge the bucket.
    pub fn take(&self, units: u32) -> Option<Duration> {
        let Some(wanted) = NonZeroU32::new(units.min(self.burst.get())) else {
            return None;
        };
        match self.limiter.check_n(wanted) {
            Ok(Ok(())) => None,
            Ok(Err(not_until)) => Some(not_until.wait_time_from(self.clock.now())),
            // unreachable after the clamp; treat as an immediate grant
            Err(_) => None,
        }
    }

    /// Sleep until `units` tokens are available, or until `stop` fires.
    /// Returns `true` when the wait was interrupted by the stop signal.
    pub async fn wait_for(&self, units: u32, stop: &CancellationToken) -> bool {
        loop {
            match self.take(units) {
                None => return false,
                Some(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop.cancelled() => return true,
                    }
                }
            }
        }
    }
}
