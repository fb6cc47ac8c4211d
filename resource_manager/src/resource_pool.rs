use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Identity used for the "no proxy" egress path
pub const DIRECT_EGRESS: &str = "direct";

/// Consecutive failures after which a resource is quarantined
pub const MAX_FAILURES: u32 = 3;

/// Highest exponent used for the failure cooldown (base * 2^16)
const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Resource pool '{0}' has no resources")]
    Empty(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    Proxy,
    ApiKey,
}

/// One interchangeable credential or egress path handed out by a [`ResourcePool`]
#[derive(Clone)]
pub struct Resource {
    index: usize,
    kind: ResourceKind,
    identity: Arc<str>,
}

impl Resource {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn is_direct(&self) -> bool {
        self.kind == ResourceKind::Proxy && &*self.identity == DIRECT_EGRESS
    }

    /// Log-safe label: API keys are cut to their first 8 characters,
    /// proxy credentials are stripped from the URL.
    pub fn label(&self) -> String {
        match self.kind {
            ResourceKind::ApiKey => {
                let prefix: String = self.identity.chars().take(8).collect();
                format!("{}...", prefix)
            }
            ResourceKind::Proxy => match self.identity.rsplit_once('@') {
                Some((scheme_and_auth, host)) => {
                    let scheme = scheme_and_auth.split("://").next().unwrap_or("http");
                    format!("{}://***@{}", scheme, host)
                }
                None => self.identity.to_string(),
            },
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("kind", &self.kind)
            .field("label", &self.label())
            .finish()
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Cooldown policy of a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Failure k puts the resource on cooldown for `base_cooldown * 2^k`
    pub base_cooldown: Duration,
    /// Short cooldown after a success to spread load
    pub success_cooldown: Duration,
    /// Failures after which the resource is quarantined
    pub max_failures: u32,
    /// Lower bound on how often a waiting caller re-checks the pool
    pub check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            base_cooldown: Duration::from_millis(3000),
            success_cooldown: Duration::from_millis(3000),
            max_failures: MAX_FAILURES,
            check_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug)]
struct ResourceState {
    resource: Resource,
    last_used: Option<Instant>,
    failure_count: u32,
    cooldown_until: Instant,
}

impl ResourceState {
    fn is_eligible(&self, now: Instant, max_failures: u32) -> bool {
        now >= self.cooldown_until && self.failure_count < max_failures
    }
}

/// Read-only view of one resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub label: String,
    pub failure_count: u32,
    pub cooling_down_for: Option<Duration>,
    pub ever_used: bool,
}

/// Rotating pool of proxies or API keys.
///
/// Selection is least-recently-used among eligible resources, ties broken by
/// fewer failures and then pool order. Failures back off per resource, so one
/// throttled proxy does not slow down the healthy ones.
pub struct ResourcePool {
    name: String,
    config: PoolConfig,
    states: Mutex<Vec<ResourceState>>,
}

impl ResourcePool {
    pub fn new<I, S>(
        name: impl Into<String>,
        kind: ResourceKind,
        identities: I,
        config: PoolConfig,
    ) -> Result<Self, PoolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let name = name.into();
        let now = Instant::now();

        let states: Vec<ResourceState> = identities
            .into_iter()
            .map(|identity| identity.as_ref().trim().to_string())
            .filter(|identity| !identity.is_empty())
            .enumerate()
            .map(|(index, identity)| ResourceState {
                resource: Resource {
                    index,
                    kind,
                    identity: Arc::from(identity),
                },
                last_used: None,
                failure_count: 0,
                cooldown_until: now,
            })
            .collect();

        if states.is_empty() {
            return Err(PoolError::Empty(name));
        }

        info!("Resource pool '{}' initialized with {} {:?} resources", name, states.len(), kind);

        Ok(Self {
            name,
            config,
            states: Mutex::new(states),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.lock_states().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for an eligible resource and mark it used
    pub async fn acquire(&self) -> Resource {
        loop {
            match self.try_select(Instant::now()) {
                Ok(resource) => {
                    debug!("[{}] selected {}", self.name, resource);
                    return resource;
                }
                Err(until_next) => {
                    let wait = until_next.max(self.config.check_interval);
                    debug!("[{}] no eligible resource, waiting {}ms", self.name, wait.as_millis());
                    sleep(wait).await;
                }
            }
        }
    }

    /// Increment the failure count and put the resource on exponential cooldown.
    /// A provider `retry-after` hint raises the cooldown to at least that long.
    ///
    /// The count stops at `max_failures`, so late failures from leases handed
    /// out before the quarantine cannot push the cooldown any further.
    pub fn report_failure(&self, resource: &Resource, retry_after: Option<Duration>) {
        let now = Instant::now();
        let mut states = self.lock_states();
        let Some(state) = Self::state_for(&mut states, resource) else {
            warn!("[{}] failure reported for unknown resource {}", self.name, resource);
            return;
        };

        state.failure_count = state
            .failure_count
            .saturating_add(1)
            .min(self.config.max_failures);
        let cooldown = self
            .cooldown_for(state.failure_count)
            .max(retry_after.unwrap_or_default());
        state.cooldown_until = state.cooldown_until.max(now + cooldown);

        if state.failure_count >= self.config.max_failures {
            warn!(
                "[{}] {} quarantined after {} failures (cooldown {}ms)",
                self.name,
                resource,
                state.failure_count,
                cooldown.as_millis()
            );
        } else {
            debug!(
                "[{}] {} failure #{} (cooldown {}ms)",
                self.name,
                resource,
                state.failure_count,
                cooldown.as_millis()
            );
        }
    }

    /// Reset failures; the resource still rests for the success cooldown
    pub fn report_success(&self, resource: &Resource) {
        let now = Instant::now();
        let mut states = self.lock_states();
        let Some(state) = Self::state_for(&mut states, resource) else {
            warn!("[{}] success reported for unknown resource {}", self.name, resource);
            return;
        };

        state.failure_count = 0;
        state.cooldown_until = now + self.config.success_cooldown;
    }

    /// Cooldown applied after the k-th consecutive failure
    pub fn cooldown_for(&self, failures: u32) -> Duration {
        let factor = 2u32.pow(failures.min(MAX_BACKOFF_EXPONENT));
        self.config.base_cooldown.saturating_mul(factor)
    }

    pub fn snapshot(&self) -> Vec<ResourceSnapshot> {
        let now = Instant::now();
        self.lock_states()
            .iter()
            .map(|state| ResourceSnapshot {
                label: state.resource.label(),
                failure_count: state.failure_count,
                cooling_down_for: (state.cooldown_until > now).then(|| state.cooldown_until - now),
                ever_used: state.last_used.is_some(),
            })
            .collect()
    }

    /// Pick the best eligible resource, or report how long until one may free up
    fn try_select(&self, now: Instant) -> Result<Resource, Duration> {
        let max_failures = self.config.max_failures;
        let mut states = self.lock_states();

        // Quarantined resources whose cooldown ran out get one more chance
        for state in states.iter_mut() {
            if state.failure_count >= max_failures && now >= state.cooldown_until {
                state.failure_count = max_failures.saturating_sub(1);
                info!("[{}] {} back on probation", self.name, state.resource);
            }
        }

        let selected = states
            .iter_mut()
            .filter(|state| state.is_eligible(now, max_failures))
            .min_by(|a, b| {
                a.last_used
                    .cmp(&b.last_used)
                    .then(a.failure_count.cmp(&b.failure_count))
            });

        if let Some(state) = selected {
            state.last_used = Some(now);
            return Ok(state.resource.clone());
        }

        let until_next = states
            .iter()
            .map(|state| state.cooldown_until.saturating_duration_since(now))
            .min()
            .unwrap_or(self.config.check_interval);

        Err(until_next)
    }

    fn state_for<'a>(
        states: &'a mut [ResourceState],
        resource: &Resource,
    ) -> Option<&'a mut ResourceState> {
        states
            .get_mut(resource.index)
            .filter(|state| Arc::ptr_eq(&state.resource.identity, &resource.identity))
    }

    fn lock_states(&self) -> std::sync::MutexGuard<'_, Vec<ResourceState>> {
        self.states.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
