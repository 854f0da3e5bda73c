use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use clonar_admission::AdmissionPermit;
use clonar_core::events::{DataPayload, EventKind, Outcome, SessionEvent};
use clonar_core::ids::{EventId, SessionId};

use crate::error::StoreError;

#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// How long a finished session stays replayable once nobody is attached.
    pub retention: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(300),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Completed,
    Errored,
}

struct SessionInner {
    state: SessionState,
    outcome: Option<Outcome>,
    log: Vec<SessionEvent>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<SessionEvent>>,
    next_event_id: EventId,
    next_subscriber_id: u64,
    terminated_at: Option<Instant>,
    last_detached_at: Option<Instant>,
}

impl SessionInner {
    /// Append and fan out. Caller holds the session lock.
    fn append(&mut self, kind: EventKind) -> EventId {
        let id = self.next_event_id;
        self.next_event_id += 1;
        let event = SessionEvent { id, kind };
        // Subscribers whose receiver is gone are pruned on the spot.
        self.subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
        self.log.push(event);
        id
    }
}

/// A single streamed query: its event log, subscribers and abort signal.
pub struct Session {
    id: SessionId,
    user_key: String,
    created_at: Instant,
    inner: Mutex<SessionInner>,
    permit: Mutex<Option<AdmissionPermit>>,
    cancel: CancellationToken,
}

impl Session {
    fn new(user_key: String, permit: Option<AdmissionPermit>) -> Self {
        let id = SessionId::new();
        let mut inner = SessionInner {
            state: SessionState::Active,
            outcome: None,
            log: Vec::new(),
            subscribers: HashMap::new(),
            next_event_id: 1,
            next_subscriber_id: 1,
            terminated_at: None,
            last_detached_at: None,
        };
        let _ = inner.append(EventKind::Start {
            session_id: id.clone(),
        });
        Self {
            id,
            user_key,
            created_at: Instant::now(),
            inner: Mutex::new(inner),
            permit: Mutex::new(permit),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn user_key(&self) -> &str {
        &self.user_key
    }

    /// Cancelled when the session is aborted.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.lock().outcome.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.inner.lock().log.clone()
    }

    /// Attach a new subscriber that first receives the full log.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        self.subscribe_after(None)
    }

    /// Attach a subscriber, replaying only events with id greater than `last_seen`.
    ///
    /// Replay and attach happen in one critical section, so no event published
    /// concurrently can be lost or duplicated. A terminal session yields the
    /// replay followed by end of stream.
    pub fn subscribe_after(self: &Arc<Self>, last_seen: Option<EventId>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let skip = last_seen.unwrap_or(0);
        for event in inner.log.iter().filter(|e| e.id > skip) {
            // The receiver is still in scope, send cannot fail.
            let _ = tx.send(event.clone());
        }

        let subscriber_id = if inner.state == SessionState::Active {
            let id = inner.next_subscriber_id;
            inner.next_subscriber_id += 1;
            let _ = inner.subscribers.insert(id, tx);
            Some(id)
        } else {
            None
        };

        Subscription {
            session: self.clone(),
            subscriber_id,
            rx,
        }
    }

    /// Append a data event. Returns `None` once the session is terminal.
    pub fn publish(&self, payload: DataPayload) -> Option<EventId> {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Active {
            return None;
        }
        Some(inner.append(EventKind::Data { payload }))
    }

    /// Finish the session exactly once.
    ///
    /// Appends the terminal event, closes every subscriber stream and releases
    /// the admission permit. Later calls return `false` and change nothing.
    pub fn terminate(&self, outcome: Outcome) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::Active {
                return false;
            }
            let _ = inner.append(outcome.clone().into_event_kind());
            inner.state = match outcome {
                Outcome::Errored(_) => SessionState::Errored,
                Outcome::Completed | Outcome::Aborted => SessionState::Completed,
            };
            inner.outcome = Some(outcome.clone());
            inner.terminated_at = Some(Instant::now());
            inner.subscribers.clear();
        }
        // Dropping the permit re-enters the admission controller; do it
        // outside the session lock.
        let permit = self.permit.lock().take();
        drop(permit);

        info!(
            session_id = %self.id,
            user_key = %self.user_key,
            outcome = outcome.as_str(),
            elapsed_ms = self.created_at.elapsed().as_millis() as u64,
            "session terminated"
        );
        true
    }

    /// Cancel in-flight work and terminate with `aborted`. Idempotent.
    pub fn abort(&self) -> bool {
        self.cancel.cancel();
        self.terminate(Outcome::Aborted)
    }

    /// How long the session has been active with nobody attached.
    pub fn detached_for(&self, now: Instant) -> Option<Duration> {
        let inner = self.inner.lock();
        if inner.state != SessionState::Active || !inner.subscribers.is_empty() {
            return None;
        }
        inner
            .last_detached_at
            .map(|at| now.saturating_duration_since(at))
    }

    fn detach(&self, subscriber_id: u64) {
        let mut inner = self.inner.lock();
        if inner.subscribers.remove(&subscriber_id).is_some() && inner.subscribers.is_empty() {
            inner.last_detached_at = Some(Instant::now());
            debug!(session_id = %self.id, "last subscriber detached");
        }
    }

    /// Terminal, nobody attached, and past the retention window.
    fn is_expired(&self, now: Instant, retention: Duration) -> bool {
        let inner = self.inner.lock();
        match inner.terminated_at {
            Some(at) => {
                inner.subscribers.is_empty() && now.saturating_duration_since(at) >= retention
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_key", &self.user_key)
            .finish_non_exhaustive()
    }
}

/// A detachable view of a session's event stream.
///
/// Yields the replayed log, then live events, and ends after the terminal
/// event. Dropping it detaches from the session.
pub struct Subscription {
    session: Arc<Session>,
    subscriber_id: Option<u64>,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Subscription {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("session_id", self.session.id())
            .field("attached", &self.subscriber_id.is_some())
            .finish()
    }
}

impl Stream for Subscription {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(id) = self.subscriber_id.take() {
            self.session.detach(id);
        }
    }
}

/// Registry of live and recently finished sessions.
pub struct SessionStore {
    config: StoreConfig,
    sessions: DashMap<SessionId, Arc<Session>>,
}

impl SessionStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Create a session that holds `permit` until it terminates. The `start`
    /// event is already in its log.
    pub fn create(&self, user_key: impl Into<String>, permit: Option<AdmissionPermit>) -> Arc<Session> {
        let session = Arc::new(Session::new(user_key.into(), permit));
        let _ = self.sessions.insert(session.id().clone(), session.clone());
        debug!(session_id = %session.id(), "session created");
        session
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Reattach to an existing session, skipping events up to `last_seen`.
    pub fn resume(&self, id: &SessionId, last_seen: Option<EventId>) -> Result<Subscription, StoreError> {
        let session = self.get(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
        Ok(session.subscribe_after(last_seen))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|e| e.value().is_active()).count()
    }

    /// Remove terminal sessions past retention with no subscribers.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let retention = self.config.retention;
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| !session.is_expired(now, retention));
        before.saturating_sub(self.sessions.len())
    }

    /// Abort every active session. Used at shutdown.
    pub fn abort_all(&self) -> usize {
        let active: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|e| e.value().is_active())
            .map(|e| e.value().clone())
            .collect();
        active.iter().filter(|s| s.abort()).count()
    }
}

/// Spawn the periodic garbage collector.
pub fn start_sweeper(
    store: Arc<SessionStore>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = store.sweep();
                    if removed > 0 {
                        info!(removed, remaining = store.len(), "expired sessions swept");
                    }
                }
            }
        }
    })
}
