//! Global concurrency gate, per-user throttle and bounded priority queue.
//!
//! All check-then-act sequences run inside a single `parking_lot` critical
//! section, so counters can never be observed half-updated. Capacity is handed
//! back through [`AdmissionPermit`]'s `Drop`, which makes release exactly-once.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info};

use clonar_core::query::Priority;
use clonar_settings::AdmissionSettings;

use crate::breaker::{BreakerRegistry, BreakerSnapshot};
use crate::rate_limit::RateLimiter;

#[derive(Clone, Debug)]
pub struct AdmissionConfig {
    pub max_concurrent: usize,
    pub max_queue: usize,
    pub max_per_user: usize,
    pub rate_limit: u32,
    pub rate_window: Duration,
    /// Dependencies without a fallback. An open breaker on any of these
    /// rejects new requests outright.
    pub required_dependencies: Vec<String>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self::from(&AdmissionSettings::default())
    }
}

impl From<&AdmissionSettings> for AdmissionConfig {
    fn from(s: &AdmissionSettings) -> Self {
        Self {
            max_concurrent: s.max_concurrent.max(1),
            max_queue: s.max_queue,
            max_per_user: s.max_per_user.max(1),
            rate_limit: s.rate_limit,
            rate_window: s.rate_window(),
            required_dependencies: s.required_dependencies.clone(),
        }
    }
}

/// Who is asking and how urgent it is.
#[derive(Clone, Debug)]
pub struct AdmissionRequest {
    /// Key for the rate limiter (user id or client address).
    pub caller_key: String,
    /// Key for the per-user concurrency cap.
    pub user_key: String,
    pub priority: Priority,
}

impl AdmissionRequest {
    pub fn new(caller_key: impl Into<String>, priority: Priority) -> Self {
        let caller_key = caller_key.into();
        Self {
            user_key: caller_key.clone(),
            caller_key,
            priority,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("admission queue is full")]
    QueueFull,
    #[error("rate limited, retry after {}ms", .retry_after.as_millis())]
    RateLimited { retry_after: Duration },
    #[error("circuit open for dependency {dependency}")]
    CircuitOpen { dependency: String },
    #[error("timed out waiting in the admission queue")]
    QueueTimeout,
    #[error("admission controller is shutting down")]
    Closed,
}

impl Rejection {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::RateLimited { .. } => "rate_limited",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::QueueTimeout => "queue_timeout",
            Self::Closed => "shutting_down",
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum Admission {
    Admitted(AdmissionPermit),
    Queued(QueueTicket),
}

type QueueKey = (Reverse<Priority>, u64);

struct Waiter {
    user_key: String,
    tx: oneshot::Sender<AdmissionPermit>,
}

#[derive(Default)]
struct State {
    active: usize,
    per_user: HashMap<String, usize>,
    queue: BTreeMap<QueueKey, Waiter>,
    next_seq: u64,
    closed: bool,
}

impl State {
    fn user_active(&self, user_key: &str) -> usize {
        self.per_user.get(user_key).copied().unwrap_or(0)
    }

    fn occupy(&mut self, user_key: &str) {
        self.active += 1;
        *self.per_user.entry(user_key.to_string()).or_insert(0) += 1;
    }

    /// Returns false when the user had nothing to release.
    fn vacate(&mut self, user_key: &str) -> bool {
        match self.per_user.get_mut(user_key) {
            Some(n) if *n > 0 => {
                *n -= 1;
                if *n == 0 {
                    let _ = self.per_user.remove(user_key);
                }
                self.active = self.active.saturating_sub(1);
                true
            }
            _ => false,
        }
    }
}

struct Inner {
    config: AdmissionConfig,
    state: Mutex<State>,
    rate_limiter: RateLimiter,
    breakers: BreakerRegistry,
}

/// Admission gate shared by every request handler.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

#[derive(Clone, Debug, Serialize)]
pub struct AdmissionSnapshot {
    pub active: usize,
    pub queued: usize,
    pub max_concurrent: usize,
    pub max_queue: usize,
    pub users_active: usize,
    pub rate_limited_keys: usize,
    pub breakers: Vec<BreakerSnapshot>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig, breakers: BreakerRegistry) -> Self {
        let rate_limiter = RateLimiter::new(config.rate_limit, config.rate_window);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                rate_limiter,
                breakers,
            }),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.inner.config
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.inner.breakers
    }

    /// Admit, queue or reject a request.
    ///
    /// Checks run in order: rate limit, required-dependency breakers,
    /// concurrency gates, queue capacity.
    pub fn try_admit(&self, request: &AdmissionRequest) -> Result<Admission, Rejection> {
        if let Err(retry_after) = self.inner.rate_limiter.check(&request.caller_key) {
            debug!(caller = %request.caller_key, "rate limited");
            return Err(Rejection::RateLimited { retry_after });
        }

        for dependency in &self.inner.config.required_dependencies {
            if self.inner.breakers.is_open(dependency) {
                return Err(Rejection::CircuitOpen {
                    dependency: dependency.clone(),
                });
            }
        }

        let config = &self.inner.config;
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(Rejection::Closed);
        }

        if state.active < config.max_concurrent
            && state.user_active(&request.user_key) < config.max_per_user
        {
            state.occupy(&request.user_key);
            return Ok(Admission::Admitted(AdmissionPermit::new(
                self.inner.clone(),
                request.user_key.clone(),
            )));
        }

        if state.queue.len() >= config.max_queue {
            return Err(Rejection::QueueFull);
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let key = (Reverse(request.priority), seq);
        let (tx, rx) = oneshot::channel();
        let _ = state.queue.insert(
            key,
            Waiter {
                user_key: request.user_key.clone(),
                tx,
            },
        );
        debug!(
            user_key = %request.user_key,
            priority = ?request.priority,
            queued = state.queue.len(),
            "request queued"
        );

        Ok(Admission::Queued(QueueTicket {
            inner: self.inner.clone(),
            key,
            rx,
        }))
    }

    /// Give back one unit of capacity held by `user_key` and promote waiters.
    ///
    /// Prefer dropping the [`AdmissionPermit`]; this exists for callers that
    /// track capacity by key. Releasing a user with nothing active is a no-op.
    pub fn release(&self, user_key: &str) {
        self.inner.release(user_key);
    }

    /// Refuse new requests and drop every queued waiter.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.closed = true;
        let dropped = state.queue.len();
        state.queue.clear();
        if dropped > 0 {
            info!(dropped, "admission closed, queued requests rejected");
        }
    }

    /// Remove rate windows that have rolled over. Returns how many were dropped.
    pub fn purge_rate_windows(&self) -> usize {
        self.inner.rate_limiter.purge_expired()
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let (active, queued, users_active) = {
            let state = self.inner.state.lock();
            (state.active, state.queue.len(), state.per_user.len())
        };
        AdmissionSnapshot {
            active,
            queued,
            max_concurrent: self.inner.config.max_concurrent,
            max_queue: self.inner.config.max_queue,
            users_active,
            rate_limited_keys: self.inner.rate_limiter.tracked_keys(),
            breakers: self.inner.breakers.snapshot(),
        }
    }
}

impl Inner {
    fn release(self: &Arc<Self>, user_key: &str) {
        let mut state = self.state.lock();
        if !state.vacate(user_key) {
            return;
        }
        self.promote(&mut state);
    }

    /// Hand capacity to queued waiters in (priority desc, arrival asc) order,
    /// skipping any whose user is already at the per-user cap.
    fn promote(self: &Arc<Self>, state: &mut State) {
        while state.active < self.config.max_concurrent {
            let next = state
                .queue
                .iter()
                .find(|(_, w)| state.user_active(&w.user_key) < self.config.max_per_user)
                .map(|(key, _)| *key);
            let Some(key) = next else { break };
            let Some(waiter) = state.queue.remove(&key) else { break };

            state.occupy(&waiter.user_key);
            let permit = AdmissionPermit::new(self.clone(), waiter.user_key.clone());
            if let Err(mut permit) = waiter.tx.send(permit) {
                // The waiter went away between dequeue and hand-off.
                permit.disarm();
                let _ = state.vacate(&waiter.user_key);
                continue;
            }
            debug!(user_key = %waiter.user_key, "queued request admitted");
        }
    }

    fn remove_waiter(&self, key: &QueueKey) {
        let _ = self.state.lock().queue.remove(key);
    }
}

/// One unit of admitted capacity. Dropping it releases the capacity.
#[must_use = "dropping the permit releases capacity immediately"]
pub struct AdmissionPermit {
    inner: Option<Arc<Inner>>,
    user_key: String,
}

impl AdmissionPermit {
    fn new(inner: Arc<Inner>, user_key: String) -> Self {
        Self {
            inner: Some(inner),
            user_key,
        }
    }

    pub fn user_key(&self) -> &str {
        &self.user_key
    }

    fn disarm(&mut self) {
        self.inner = None;
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release(&self.user_key);
        }
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("user_key", &self.user_key)
            .field("armed", &self.inner.is_some())
            .finish()
    }
}

/// A place in the admission queue. Dropping it leaves the queue.
pub struct QueueTicket {
    inner: Arc<Inner>,
    key: QueueKey,
    rx: oneshot::Receiver<AdmissionPermit>,
}

impl QueueTicket {
    pub fn priority(&self) -> Priority {
        self.key.0 .0
    }

    /// Wait until capacity is handed over, at most `budget`.
    pub async fn wait(mut self, budget: Duration) -> Result<AdmissionPermit, Rejection> {
        match tokio::time::timeout(budget, &mut self.rx).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(Rejection::Closed),
            Err(_) => Err(Rejection::QueueTimeout),
        }
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        self.inner.remove_waiter(&self.key);
    }
}

impl std::fmt::Debug for QueueTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueTicket")
            .field("priority", &self.key.0 .0)
            .field("seq", &self.key.1)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerCheck, BreakerConfig};

    fn controller(max_concurrent: usize, max_queue: usize, max_per_user: usize) -> AdmissionController {
        AdmissionController::new(
            AdmissionConfig {
                max_concurrent,
                max_queue,
                max_per_user,
                rate_limit: 1_000,
                rate_window: Duration::from_secs(60),
                required_dependencies: Vec::new(),
            },
            BreakerRegistry::new(BreakerConfig::default()),
        )
    }

    fn req(user: &str) -> AdmissionRequest {
        AdmissionRequest::new(user, Priority::Fresh)
    }

    fn admitted(result: Result<Admission, Rejection>) -> AdmissionPermit {
        match result {
            Ok(Admission::Admitted(permit)) => permit,
            other => panic!("expected admission, got {other:?}"),
        }
    }

    fn queued(result: Result<Admission, Rejection>) -> QueueTicket {
        match result {
            Ok(Admission::Queued(ticket)) => ticket,
            other => panic!("expected queueing, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn six_queries_five_admitted_one_queued() {
        let ctl = controller(5, 20, 10);
        let mut permits = Vec::new();
        for i in 0..5 {
            permits.push(admitted(ctl.try_admit(&req(&format!("user{i}")))));
        }
        let ticket = queued(ctl.try_admit(&req("user5")));

        let snap = ctl.snapshot();
        assert_eq!(snap.active, 5);
        assert_eq!(snap.queued, 1);

        drop(permits.pop());
        let permit = ticket.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(permit.user_key(), "user5");
        assert_eq!(ctl.snapshot().active, 5);
        assert_eq!(ctl.snapshot().queued, 0);
    }

    #[tokio::test]
    async fn queue_overflow_rejects_newest() {
        let ctl = controller(1, 1, 1);
        let _p = admitted(ctl.try_admit(&req("a")));
        let _t = queued(ctl.try_admit(&req("b")));
        assert_eq!(ctl.try_admit(&req("c")).unwrap_err(), Rejection::QueueFull);
        assert_eq!(ctl.snapshot().queued, 1);
    }

    #[tokio::test]
    async fn follow_up_outranks_earlier_fresh_request() {
        let ctl = controller(1, 10, 1);
        let permit = admitted(ctl.try_admit(&req("a")));
        let fresh = queued(ctl.try_admit(&req("b")));
        let follow_up = queued(ctl.try_admit(&AdmissionRequest::new("c", Priority::FollowUp)));

        drop(permit);
        let got = follow_up.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.user_key(), "c");
        assert_eq!(ctl.snapshot().queued, 1);
        drop(fresh);
        assert_eq!(ctl.snapshot().queued, 0);
    }

    #[tokio::test]
    async fn per_user_cap_skips_waiter_but_serves_others() {
        let ctl = controller(3, 10, 1);
        let a1 = admitted(ctl.try_admit(&req("a")));
        let a2 = queued(ctl.try_admit(&req("a")));
        let _b = admitted(ctl.try_admit(&req("b")));
        let c = admitted(ctl.try_admit(&req("c")));

        // Freeing c's slot cannot go to a (still at cap).
        drop(c);
        assert_eq!(ctl.snapshot().queued, 1);
        assert_eq!(ctl.snapshot().active, 2);

        drop(a1);
        let permit = a2.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(permit.user_key(), "a");
    }

    #[tokio::test]
    async fn dropped_ticket_leaves_queue() {
        let ctl = controller(1, 5, 1);
        let permit = admitted(ctl.try_admit(&req("a")));
        let ticket = queued(ctl.try_admit(&req("b")));
        drop(ticket);
        assert_eq!(ctl.snapshot().queued, 0);
        drop(permit);
        assert_eq!(ctl.snapshot().active, 0);
    }

    #[tokio::test]
    async fn release_without_active_is_noop() {
        let ctl = controller(2, 5, 2);
        ctl.release("ghost");
        let snap = ctl.snapshot();
        assert_eq!(snap.active, 0);
        let _p = admitted(ctl.try_admit(&req("a")));
        ctl.release("ghost");
        assert_eq!(ctl.snapshot().active, 1);
    }

    #[tokio::test]
    async fn active_never_exceeds_max_or_goes_negative() {
        let ctl = controller(3, 50, 2);
        let mut permits = Vec::new();
        let mut tickets = Vec::new();
        for round in 0..40_usize {
            let user = format!("u{}", round % 4);
            match ctl.try_admit(&req(&user)) {
                Ok(Admission::Admitted(p)) => permits.push(p),
                Ok(Admission::Queued(t)) => tickets.push(t),
                Err(e) => panic!("unexpected rejection {e}"),
            }
            if round % 3 == 0 && !permits.is_empty() {
                drop(permits.remove(0));
            }
            if round % 5 == 0 && !tickets.is_empty() {
                drop(tickets.remove(0));
            }
            ctl.release("nobody");
            let snap = ctl.snapshot();
            assert!(snap.active <= 3);
        }
        drop(tickets);
        drop(permits);
        assert_eq!(ctl.snapshot().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn thirty_first_request_rate_limited_until_window_rolls() {
        let ctl = AdmissionController::new(
            AdmissionConfig {
                max_concurrent: 100,
                max_queue: 0,
                max_per_user: 100,
                rate_limit: 30,
                rate_window: Duration::from_secs(60),
                required_dependencies: Vec::new(),
            },
            BreakerRegistry::new(BreakerConfig::default()),
        );
        for _ in 0..30 {
            drop(admitted(ctl.try_admit(&req("10.1.1.1"))));
        }
        let err = ctl.try_admit(&req("10.1.1.1")).unwrap_err();
        assert_eq!(err.error_code(), "rate_limited");
        assert!(err.retry_after().is_some());

        tokio::time::advance(Duration::from_secs(60)).await;
        drop(admitted(ctl.try_admit(&req("10.1.1.1"))));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_request_times_out() {
        let ctl = controller(1, 5, 1);
        let _p = admitted(ctl.try_admit(&req("a")));
        let ticket = queued(ctl.try_admit(&req("b")));
        let err = ticket.wait(Duration::from_secs(30)).await.unwrap_err();
        assert_eq!(err, Rejection::QueueTimeout);
        assert_eq!(ctl.snapshot().queued, 0);
    }

    #[tokio::test]
    async fn required_dependency_open_rejects() {
        let breakers = BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            ..BreakerConfig::default()
        });
        let ctl = AdmissionController::new(
            AdmissionConfig {
                required_dependencies: vec!["llm".into()],
                ..AdmissionConfig::default()
            },
            breakers.clone(),
        );
        match breakers.check("llm") {
            BreakerCheck::Allowed(call) => call.failure(),
            BreakerCheck::Open { .. } => panic!("fresh breaker refused"),
        }
        let err = ctl.try_admit(&req("a")).unwrap_err();
        assert_eq!(
            err,
            Rejection::CircuitOpen {
                dependency: "llm".into()
            }
        );
    }

    #[tokio::test]
    async fn close_rejects_waiters_and_new_requests() {
        let ctl = controller(1, 5, 1);
        let _p = admitted(ctl.try_admit(&req("a")));
        let ticket = queued(ctl.try_admit(&req("b")));
        ctl.close();
        assert_eq!(ticket.wait(Duration::from_secs(1)).await.unwrap_err(), Rejection::Closed);
        assert_eq!(ctl.try_admit(&req("c")).unwrap_err(), Rejection::Closed);
    }
}
