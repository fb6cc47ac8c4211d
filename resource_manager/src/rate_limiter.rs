// Token-bucket admission control for one request lane.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Limits applied to a single logical lane (an RPC method, the price API, wallet starts)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Requests allowed per refresh interval. `None` disables the reservoir.
    pub reservoir_max: Option<u32>,
    /// Interval after which the reservoir is reset to `reservoir_max`
    pub refresh_interval: Duration,
    /// Maximum number of permits held at the same time
    pub max_concurrent: usize,
    /// Minimum time between two admissions
    pub min_spacing: Duration,
}

impl RateLimiterConfig {
    /// Concurrency cap and spacing only, no reservoir
    pub fn concurrency_only(max_concurrent: usize, min_spacing: Duration) -> Self {
        Self {
            reservoir_max: None,
            refresh_interval: Duration::ZERO,
            max_concurrent,
            min_spacing,
        }
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            reservoir_max: Some(100),
            refresh_interval: Duration::from_millis(10_000),
            max_concurrent: 100,
            min_spacing: Duration::ZERO,
        }
    }
}

#[derive(Debug)]
struct LimiterState {
    reservoir: Option<u32>,
    last_refill_at: Instant,
    last_admitted_at: Option<Instant>,
    in_flight: usize,
}

/// Point-in-time view of a limiter, for logging and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterSnapshot {
    pub reservoir: Option<u32>,
    pub in_flight: usize,
}

enum Admission {
    Admitted,
    /// Blocked by the reservoir or spacing; re-check after the delay or on release
    RetryIn(Duration),
    /// Blocked only by the concurrency cap
    WaitForRelease,
}

/// Reservoir + concurrency + spacing limiter.
///
/// `acquire` suspends until admission; the returned [`RatePermit`] releases its
/// concurrency slot when dropped. The reservoir only grows back at refill
/// boundaries, regardless of how the guarded call ended.
pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    state: Mutex<LimiterState>,
    released: Notify,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Self {
        let mut config = config;
        if config.max_concurrent == 0 {
            warn!("Rate limiter configured with max_concurrent=0, using 1");
            config.max_concurrent = 1;
        }

        Self {
            name: name.into(),
            state: Mutex::new(LimiterState {
                reservoir: config.reservoir_max,
                last_refill_at: Instant::now(),
                last_admitted_at: None,
                in_flight: 0,
            }),
            config,
            released: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Wait until a request may be sent
    pub async fn acquire(&self) -> RatePermit<'_> {
        loop {
            // Registered before the state check so a release in between is not missed
            let released = self.released.notified();

            match self.try_admit(Instant::now()) {
                Admission::Admitted => return RatePermit { limiter: self },
                Admission::RetryIn(delay) => {
                    debug!("[{}] rate limited, re-checking in {}ms", self.name, delay.as_millis());
                    tokio::select! {
                        _ = released => {}
                        _ = sleep(delay) => {}
                    }
                }
                Admission::WaitForRelease => {
                    debug!("[{}] all {} slots busy, waiting for release", self.name, self.config.max_concurrent);
                    released.await;
                }
            }
        }
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let state = self.lock_state();
        RateLimiterSnapshot {
            reservoir: state.reservoir,
            in_flight: state.in_flight,
        }
    }

    fn try_admit(&self, now: Instant) -> Admission {
        let mut state = self.lock_state();

        if let Some(max) = self.config.reservoir_max {
            if now >= state.last_refill_at + self.config.refresh_interval {
                state.reservoir = Some(max);
                state.last_refill_at = now;
            }
        }

        let mut wait: Option<Duration> = None;

        if state.reservoir == Some(0) {
            let next_refill = state.last_refill_at + self.config.refresh_interval;
            wait = Some(next_refill.saturating_duration_since(now));
        }

        if let Some(last) = state.last_admitted_at {
            let next_slot = last + self.config.min_spacing;
            if now < next_slot {
                let until_slot = next_slot - now;
                wait = Some(wait.map_or(until_slot, |w| w.min(until_slot)));
            }
        }

        if let Some(delay) = wait {
            return Admission::RetryIn(delay);
        }

        if state.in_flight >= self.config.max_concurrent {
            return Admission::WaitForRelease;
        }

        if let Some(remaining) = state.reservoir.as_mut() {
            *remaining -= 1;
        }
        state.in_flight += 1;
        state.last_admitted_at = Some(now);

        Admission::Admitted
    }

    fn release(&self) {
        {
            let mut state = self.lock_state();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.released.notify_waiters();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        // Poisoning ignored: the state is plain counters
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Admission granted by [`RateLimiter::acquire`]; dropping it releases the slot
#[must_use = "dropping the permit releases the slot immediately"]
pub struct RatePermit<'a> {
    limiter: &'a RateLimiter,
}

impl RatePermit<'_> {
    /// Explicit release, same as dropping the permit
    pub fn release(self) {}
}

impl Drop for RatePermit<'_> {
    fn drop(&mut self) {
        self.limiter.release();
    }
}
