//! In-memory session event store.
//!
//! Each session owns an append-only event log plus the set of subscribers
//! currently attached to it. Replay and attach happen atomically, so a client
//! that reconnects sees every event exactly once and in order.

pub mod error;
pub mod sessions;

pub use error::StoreError;
pub use sessions::{
    start_sweeper, Session, SessionState, SessionStore, StoreConfig, Subscription,
};
