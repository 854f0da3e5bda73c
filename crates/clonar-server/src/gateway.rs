//! Stream gateway: turns a session subscription into a Server-Sent Events
//! response and arms the abort-after-grace timer when the client goes away.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info};

use clonar_core::events::SessionEvent;
use clonar_store::{Session, Subscription};

/// Fires when the SSE body is dropped, which is how a client disconnect
/// shows up on the server side.
struct DisconnectGuard {
    session: Arc<Session>,
    grace: Duration,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.session.is_active() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let session = Arc::clone(&self.session);
        let grace = self.grace;
        debug!(session_id = %session.id(), grace_ms = grace.as_millis() as u64, "client stream dropped");
        let _ = runtime.spawn(abort_after_grace(session, grace));
    }
}

/// Abort the session unless someone re-attached within `grace`.
async fn abort_after_grace(session: Arc<Session>, grace: Duration) {
    tokio::time::sleep(grace).await;
    let abandoned = session
        .detached_for(Instant::now())
        .is_some_and(|detached| detached >= grace);
    if abandoned && session.abort() {
        info!(session_id = %session.id(), "session aborted after client disconnect");
    }
}

pub fn to_sse_event(event: &SessionEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default()
        .event(event.kind.event_type())
        .id(event.id.to_string())
        .data(data)
}

/// SSE response carrying replay followed by live events. The stream ends
/// right after the terminal event.
pub fn sse_response(
    subscription: Subscription,
    heartbeat: Duration,
    reconnect_grace: Duration,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let guard = DisconnectGuard {
        session: Arc::clone(subscription.session()),
        grace: reconnect_grace,
    };
    let stream = subscription.map(move |event| {
        let _ = &guard;
        Ok::<_, Infallible>(to_sse_event(&event))
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(heartbeat).text("keepalive"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clonar_core::events::DataPayload;
    use clonar_store::{SessionStore, StoreConfig};

    fn store() -> SessionStore {
        SessionStore::new(StoreConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_stream_aborts_after_grace() {
        let store = store();
        let session = store.create("u", None);
        let response = sse_response(session.subscribe(), Duration::from_secs(15), Duration::from_secs(10));
        drop(response);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!session.is_active());
        assert_eq!(session.outcome(), Some(clonar_core::events::Outcome::Aborted));
    }

    #[tokio::test(start_paused = true)]
    async fn reattach_within_grace_keeps_session() {
        let store = store();
        let session = store.create("u", None);
        drop(sse_response(session.subscribe(), Duration::from_secs(15), Duration::from_secs(10)));

        tokio::time::sleep(Duration::from_secs(3)).await;
        let resumed = store.resume(session.id(), None).unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert!(session.is_active());
        assert!(session.publish(DataPayload::token("still here")).is_some());
        drop(resumed);
    }

    #[test]
    fn sse_frame_carries_type_and_id() {
        let store = store();
        let session = store.create("u", None);
        let start = &session.events()[0];
        // Event has no public accessors; check the serialized payload instead.
        let data = serde_json::to_value(start).unwrap();
        assert_eq!(data["type"], "start");
        assert_eq!(data["id"], 1);
        let _ = to_sse_event(start);
    }
}
