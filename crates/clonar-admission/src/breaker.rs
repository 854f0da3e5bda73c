//! Per-dependency circuit breakers.
//!
//! Closed → (N consecutive failures) → Open for `cooldown` → HalfOpen, which
//! lets exactly one trial call through. A successful trial closes the breaker
//! and resets the cooldown; a failed trial re-opens it with the cooldown
//! doubled (capped, with jitter).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use clonar_settings::BreakerSettings;

#[derive(Clone, Debug)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub max_cooldown: Duration,
    pub jitter_factor: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::from(&BreakerSettings::default())
    }
}

impl From<&BreakerSettings> for BreakerConfig {
    fn from(s: &BreakerSettings) -> Self {
        Self {
            failure_threshold: s.failure_threshold.max(1),
            cooldown: Duration::from_millis(s.cooldown_ms),
            max_cooldown: Duration::from_millis(s.max_cooldown_ms.max(s.cooldown_ms)),
            jitter_factor: s.jitter_factor.clamp(0.0, 1.0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen { trial_in_flight: bool },
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    cooldown: Duration,
}

impl Breaker {
    fn new(cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            cooldown,
        }
    }

    /// Promote Open → HalfOpen once the cooldown has elapsed.
    fn refresh(&mut self, now: Instant) {
        if let CircuitState::Open { since } = self.state {
            if now.saturating_duration_since(since) >= self.cooldown {
                self.state = CircuitState::HalfOpen {
                    trial_in_flight: false,
                };
            }
        }
    }

    fn status(&self) -> BreakerStatus {
        match self.state {
            CircuitState::Closed => BreakerStatus::Closed,
            CircuitState::Open { .. } => BreakerStatus::Open,
            CircuitState::HalfOpen { .. } => BreakerStatus::HalfOpen,
        }
    }
}

/// Outcome of asking a breaker for permission to call its dependency.
#[derive(Debug)]
pub enum BreakerCheck {
    /// The call may proceed. Report the result through the guard.
    Allowed(BreakerCall),
    /// The breaker is open (or a half-open trial is already running).
    Open { retry_after: Duration },
}

/// Shared registry of breakers keyed by dependency name.
#[derive(Clone)]
pub struct BreakerRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Breaker>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct BreakerSnapshot {
    pub dependency: String,
    pub status: BreakerStatus,
    pub consecutive_failures: u32,
    pub cooldown_ms: u64,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                breakers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.inner.config
    }

    /// Ask permission to call `dependency`.
    ///
    /// In half-open state only the first caller gets the trial; everyone else
    /// sees the breaker as open until the trial reports back.
    pub fn check(&self, dependency: &str) -> BreakerCheck {
        let now = Instant::now();
        let mut breakers = self.inner.breakers.lock();
        let breaker = breakers
            .entry(dependency.to_string())
            .or_insert_with(|| Breaker::new(self.inner.config.cooldown));
        breaker.refresh(now);

        match breaker.state {
            CircuitState::Closed => BreakerCheck::Allowed(self.call(dependency, false)),
            CircuitState::HalfOpen {
                trial_in_flight: false,
            } => {
                breaker.state = CircuitState::HalfOpen {
                    trial_in_flight: true,
                };
                info!(dependency, "circuit breaker half-open, admitting trial call");
                BreakerCheck::Allowed(self.call(dependency, true))
            }
            CircuitState::HalfOpen {
                trial_in_flight: true,
            } => BreakerCheck::Open {
                retry_after: Duration::ZERO,
            },
            CircuitState::Open { since } => BreakerCheck::Open {
                retry_after: breaker
                    .cooldown
                    .saturating_sub(now.saturating_duration_since(since)),
            },
        }
    }

    /// True when new calls to `dependency` would be refused right now.
    pub fn is_open(&self, dependency: &str) -> bool {
        let now = Instant::now();
        let mut breakers = self.inner.breakers.lock();
        match breakers.get_mut(dependency) {
            Some(breaker) => {
                breaker.refresh(now);
                matches!(
                    breaker.state,
                    CircuitState::Open { .. }
                        | CircuitState::HalfOpen {
                            trial_in_flight: true
                        }
                )
            }
            None => false,
        }
    }

    pub fn status(&self, dependency: &str) -> BreakerStatus {
        let now = Instant::now();
        let mut breakers = self.inner.breakers.lock();
        breakers.get_mut(dependency).map_or(BreakerStatus::Closed, |b| {
            b.refresh(now);
            b.status()
        })
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let now = Instant::now();
        let mut breakers = self.inner.breakers.lock();
        let mut out: Vec<BreakerSnapshot> = breakers
            .iter_mut()
            .map(|(name, b)| {
                b.refresh(now);
                BreakerSnapshot {
                    dependency: name.clone(),
                    status: b.status(),
                    consecutive_failures: b.consecutive_failures,
                    cooldown_ms: b.cooldown.as_millis() as u64,
                }
            })
            .collect();
        out.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        out
    }

    fn call(&self, dependency: &str, trial: bool) -> BreakerCall {
        BreakerCall {
            registry: Some(self.clone()),
            dependency: dependency.to_string(),
            trial,
        }
    }

    fn record(&self, dependency: &str, trial: bool, success: bool) {
        let config = &self.inner.config;
        let mut breakers = self.inner.breakers.lock();
        let breaker = breakers
            .entry(dependency.to_string())
            .or_insert_with(|| Breaker::new(config.cooldown));

        if success {
            if breaker.state != CircuitState::Closed {
                info!(dependency, "circuit breaker closed after successful trial");
            }
            breaker.state = CircuitState::Closed;
            breaker.consecutive_failures = 0;
            breaker.cooldown = config.cooldown;
            return;
        }

        breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);
        match breaker.state {
            CircuitState::HalfOpen { .. } if trial => {
                breaker.cooldown = backoff(breaker.cooldown, config);
                warn!(
                    dependency,
                    cooldown_ms = breaker.cooldown.as_millis() as u64,
                    "circuit breaker trial failed, re-opening"
                );
                breaker.state = CircuitState::Open {
                    since: Instant::now(),
                };
            }
            CircuitState::Closed if breaker.consecutive_failures >= config.failure_threshold => {
                warn!(
                    dependency,
                    failures = breaker.consecutive_failures,
                    cooldown_ms = breaker.cooldown.as_millis() as u64,
                    "circuit breaker opened"
                );
                breaker.state = CircuitState::Open {
                    since: Instant::now(),
                };
            }
            _ => {}
        }
    }

    fn abandon_trial(&self, dependency: &str) {
        let mut breakers = self.inner.breakers.lock();
        if let Some(breaker) = breakers.get_mut(dependency) {
            if let CircuitState::HalfOpen {
                trial_in_flight: true,
            } = breaker.state
            {
                breaker.state = CircuitState::HalfOpen {
                    trial_in_flight: false,
                };
            }
        }
    }
}

/// Double the cooldown, cap it, then apply ± jitter.
fn backoff(current: Duration, config: &BreakerConfig) -> Duration {
    let doubled = current.saturating_mul(2).min(config.max_cooldown);
    if config.jitter_factor <= 0.0 {
        return doubled;
    }
    let factor = rand::thread_rng().gen_range(-config.jitter_factor..=config.jitter_factor);
    doubled.mul_f64(1.0 + factor).min(config.max_cooldown)
}

/// Permission to make one call to a dependency.
///
/// Report the result with [`BreakerCall::success`] or [`BreakerCall::failure`].
/// Dropping an unreported half-open trial hands the trial slot to the next caller.
#[derive(Debug)]
#[must_use = "report the call result with success() or failure()"]
pub struct BreakerCall {
    registry: Option<BreakerRegistry>,
    dependency: String,
    trial: bool,
}

impl BreakerCall {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        if let Some(registry) = self.registry.take() {
            registry.record(&self.dependency, self.trial, true);
        }
    }

    pub fn failure(mut self) {
        if let Some(registry) = self.registry.take() {
            registry.record(&self.dependency, self.trial, false);
        }
    }
}

impl Drop for BreakerCall {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.take() {
            if self.trial {
                registry.abandon_trial(&self.dependency);
            }
        }
    }
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
