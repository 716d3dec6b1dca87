//! Jittered requeue horizons
//!
//! Converts a lease TTL, rotation TTL or fixed refresh interval into a concrete
//! "requeue after" duration. Jitter keeps tasks with identical TTLs from all
//! contacting the credential source at the same instant.

use chrono::{DateTime, TimeDelta, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Fraction of the base duration used as the jitter bound.
pub const JITTER_FRACTION: f64 = 0.1;

/// Fraction of the rotation TTL used as the jitter bound for static credentials.
pub const STATIC_JITTER_FRACTION: f64 = 0.05;

/// Highest renewal percentage honoured; anything above is clamped.
pub const MAX_RENEWAL_PERCENT: i32 = 90;

/// Extra delay past a rotation boundary so the next read lands after it.
const ROTATION_GRACE: Duration = Duration::from_secs(1);

/// How a relative horizon's boundary is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HorizonMode {
    /// Lease renewal: the boundary is the start of the renewal window,
    /// a point the engine must not cross without acting.
    Renewal { percent: i32 },
    /// Static credential rotation: the boundary is a future rotation the
    /// engine has to wait for.
    Rotation,
}

/// Computes jittered horizons from an injectable random source
pub struct HorizonCalculator {
    rng: Mutex<StdRng>,
}

impl HorizonCalculator {
    /// Create a calculator seeded from the operating system
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Create a deterministic calculator
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Uniform draw from `[0, max]`
    pub fn jitter(&self, max: Duration) -> Duration {
        let bound = duration_nanos(max);
        if bound == 0 {
            return Duration::ZERO;
        }
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        Duration::from_nanos(rng.random_range(0..=bound))
    }

    /// `base` reduced by up to 10% of itself.
    ///
    /// Never exceeds `base` and averages around `0.95 * base`.
    pub fn horizon(&self, base: Duration) -> Duration {
        base.saturating_sub(self.jitter(max_jitter(base, JITTER_FRACTION)))
    }

    /// Start of the renewal window plus up to 10% of the lease duration.
    ///
    /// The jitter is additive so the renewal window is never entered early.
    /// Callers substitute a minimum lease duration before calling when the
    /// source reports zero.
    pub fn dynamic_horizon(&self, lease_duration: Duration, renewal_percent: i32) -> Duration {
        renewal_start(lease_duration, renewal_percent)
            .saturating_add(self.jitter(max_jitter(lease_duration, JITTER_FRACTION)))
    }

    /// Delay until just after the next static credential rotation
    pub fn static_horizon(&self, ttl: Duration) -> Duration {
        ttl.saturating_add(self.jitter(max_jitter(ttl, STATIC_JITTER_FRACTION)))
            .saturating_add(ROTATION_GRACE)
    }

    /// Delay from now until the window boundary, and whether that boundary
    /// has already passed.
    pub fn relative_horizon(
        &self,
        last_event: DateTime<Utc>,
        duration: Duration,
        mode: HorizonMode,
    ) -> (Duration, bool) {
        self.relative_horizon_at(Utc::now(), last_event, duration, mode)
    }

    /// Same as [`HorizonCalculator::relative_horizon`] with an explicit clock.
    pub fn relative_horizon_at(
        &self,
        now: DateTime<Utc>,
        last_event: DateTime<Utc>,
        duration: Duration,
        mode: HorizonMode,
    ) -> (Duration, bool) {
        let (boundary, jittered) = match mode {
            HorizonMode::Renewal { percent } => (
                renewal_start(duration, percent),
                self.dynamic_horizon(duration, percent),
            ),
            HorizonMode::Rotation => (duration, self.static_horizon(duration)),
        };

        let in_window = now >= offset(last_event, boundary);
        let horizon = (offset(last_event, jittered) - now)
            .to_std()
            .unwrap_or(Duration::ZERO);
        (horizon, in_window)
    }
}

impl Default for HorizonCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Clamp a renewal percentage into `[0, 90]`
pub fn clamp_renewal_percent(percent: i32) -> i32 {
    percent.clamp(0, MAX_RENEWAL_PERCENT)
}

/// `duration * percent / 100` with the percentage clamped
pub fn renewal_start(duration: Duration, percent: i32) -> Duration {
    let percent = clamp_renewal_percent(percent) as u128;
    nanos_to_duration(duration.as_nanos() * percent / 100)
}

/// Jitter bound for `base`.
///
/// Falls back to zero for fractions outside `[0, 1]` instead of failing.
pub fn max_jitter(base: Duration, fraction: f64) -> Duration {
    if !(0.0..=1.0).contains(&fraction) {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(base.as_secs_f64() * fraction)
        .map(|d| d.min(base))
        .unwrap_or(Duration::ZERO)
}

fn offset(ts: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|delta| ts.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn duration_nanos(d: Duration) -> u64 {
    d.as_nanos().min(u128::from(u64::MAX)) as u64
}

fn nanos_to_duration(nanos: u128) -> Duration {
    Duration::from_nanos(nanos.min(u128::from(u64::MAX)) as u64)
}
