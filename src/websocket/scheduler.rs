//! Exponential backoff with optional jitter, and the reconnect timer that goes with it.

use super::endpoints::ReconnectPolicy;
use super::timers::{TimerKind, Timers};
use crate::error::{RealtimeError, Result};
use crate::types::ConnectionId;
use log::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Lower bound of the jitter factor; the upper bound is 1.0.
pub const JITTER_FLOOR: f64 = 0.5;

/// A reconnect the scheduler agreed to make.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPlan {
    /// 1-based number of this attempt.
    pub attempt: u32,
    pub delay: Duration,
}

/// `min(initial * multiplier^attempts, max)`, before jitter.
pub fn base_delay(policy: &ReconnectPolicy, attempts: u32) -> Duration {
    let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
    let raw = policy.initial_delay.as_secs_f64() * policy.backoff_multiplier.powi(exponent);
    let capped = raw.min(policy.max_delay.as_secs_f64());
    if capped.is_finite() && capped >= 0.0 {
        Duration::from_secs_f64(capped)
    } else {
        policy.max_delay
    }
}

/// Scales the base delay by `factor`, clamped to `[JITTER_FLOOR, 1.0]`.
pub fn jittered_delay(policy: &ReconnectPolicy, attempts: u32, factor: f64) -> Duration {
    base_delay(policy, attempts).mul_f64(factor.clamp(JITTER_FLOOR, 1.0))
}

pub struct ReconnectScheduler {
    rng: StdRng,
}

impl ReconnectScheduler {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Delay for the attempt after `attempts` failures, or an error once the ceiling is hit.
    pub fn plan(
        &mut self,
        id: &ConnectionId,
        attempts: u32,
        policy: &ReconnectPolicy,
    ) -> Result<ReconnectPlan> {
        if policy.exhausted(attempts) {
            return Err(RealtimeError::ReconnectExhausted {
                connection_id: id.to_string(),
                attempts,
            });
        }
        let delay = if policy.jitter {
            let factor = self.rng.gen_range(JITTER_FLOOR..=1.0);
            jittered_delay(policy, attempts, factor)
        } else {
            base_delay(policy, attempts)
        };
        Ok(ReconnectPlan {
            attempt: attempts.saturating_add(1),
            delay,
        })
    }

    pub fn arm(&self, timers: &mut Timers, id: &ConnectionId, plan: &ReconnectPlan) {
        info!(
            "[Scheduler] Reconnecting {} (attempt {}) in {:?}",
            id, plan.attempt, plan.delay
        );
        timers.schedule_once(id, TimerKind::Reconnect, plan.delay);
    }

    pub fn cancel(&self, timers: &mut Timers, id: &ConnectionId) {
        if timers.cancel(id, TimerKind::Reconnect) {
            debug!("[Scheduler] Cancelled pending reconnect for {}", id);
        }
    }

    pub fn is_pending(&self, timers: &Timers, id: &ConnectionId) -> bool {
        timers.is_armed(id, TimerKind::Reconnect)
    }
}

impl Default for ReconnectScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SharedChannel;

    fn id() -> ConnectionId {
        ConnectionId::shared(SharedChannel::Events)
    }

    fn no_jitter() -> ReconnectPolicy {
        ReconnectPolicy {
            jitter: false,
            ..ReconnectPolicy::default()
        }
    }

    #[test]
    fn test_base_delay_grows_then_caps() {
        let policy = no_jitter();
        assert_eq!(base_delay(&policy, 0), Duration::from_millis(2_000));
        assert_eq!(base_delay(&policy, 1), Duration::from_millis(3_000));
        assert_eq!(base_delay(&policy, 2), Duration::from_millis(4_500));
        assert_eq!(base_delay(&policy, 50), Duration::from_millis(20_000));
        assert_eq!(base_delay(&policy, u32::MAX), Duration::from_millis(20_000));
    }

    #[test]
    fn test_backoff_is_monotonic_without_jitter() {
        let mut scheduler = ReconnectScheduler::with_seed(7);
        for policy in [no_jitter(), ReconnectPolicy::terminal()] {
            let limit = policy.max_attempts.unwrap_or(30);
            let mut previous = Duration::ZERO;
            for attempts in 0..limit {
                let plan = scheduler.plan(&id(), attempts, &policy).expect("below ceiling");
                assert!(plan.delay >= previous);
                assert!(plan.delay <= policy.max_delay);
                previous = plan.delay;
            }
        }
    }

    #[test]
    fn test_jitter_stays_within_half_to_full_base() {
        let mut scheduler = ReconnectScheduler::with_seed(42);
        let policy = ReconnectPolicy::metrics();
        for attempts in 0..12 {
            let base = base_delay(&policy, attempts);
            for _ in 0..200 {
                let plan = scheduler.plan(&id(), attempts, &policy).unwrap();
                assert!(plan.delay >= base.mul_f64(JITTER_FLOOR));
                assert!(plan.delay <= base);
            }
        }
    }

    #[test]
    fn test_ceiling_refuses_to_plan() {
        let mut scheduler = ReconnectScheduler::new();
        let policy = ReconnectPolicy::terminal();
        let plan = scheduler.plan(&id(), 4, &policy).expect("fifth attempt allowed");
        assert_eq!(plan.attempt, 5);

        let refused = scheduler.plan(&id(), 5, &policy);
        assert!(matches!(
            refused,
            Err(RealtimeError::ReconnectExhausted { attempts: 5, .. })
        ));
    }

    #[test]
    fn test_unlimited_policy_never_exhausts() {
        let mut scheduler = ReconnectScheduler::new();
        let plan = scheduler
            .plan(&id(), 10_000, &ReconnectPolicy::metrics())
            .expect("metrics retries forever");
        assert!(plan.delay <= Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_factor_is_clamped() {
        let policy = no_jitter();
        assert_eq!(jittered_delay(&policy, 0, 0.1), Duration::from_millis(1_000));
        assert_eq!(jittered_delay(&policy, 0, 3.0), Duration::from_millis(2_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_and_cancel() {
        let scheduler = ReconnectScheduler::new();
        let (mut timers, _rx) = Timers::new();
        let plan = ReconnectPlan {
            attempt: 1,
            delay: Duration::from_secs(1),
        };
        scheduler.arm(&mut timers, &id(), &plan);
        assert!(scheduler.is_pending(&timers, &id()));
        scheduler.cancel(&mut timers, &id());
        assert!(!scheduler.is_pending(&timers, &id()));
    }
}
