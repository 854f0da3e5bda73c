//! Admission control: who gets to run, who waits, and which dependencies are
//! currently too unhealthy to call.

pub mod breaker;
pub mod controller;
pub mod rate_limit;

pub use breaker::{BreakerCall, BreakerCheck, BreakerConfig, BreakerRegistry, BreakerSnapshot, BreakerStatus};
pub use controller::{
    Admission, AdmissionConfig, AdmissionController, AdmissionPermit, AdmissionRequest,
    AdmissionSnapshot, QueueTicket, Rejection,
};
pub use rate_limit::RateLimiter;
