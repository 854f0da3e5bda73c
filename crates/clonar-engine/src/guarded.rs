//! Breaker-guarded, time-bounded calls to model collaborators.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use clonar_admission::{BreakerCheck, BreakerRegistry};
use clonar_core::errors::CollaboratorError;
use clonar_core::timeout::{race, Timed};

/// Breaker name shared by every language-model call.
pub const LLM_DEPENDENCY: &str = "llm";

#[derive(Debug)]
pub enum CallOutcome<T> {
    Ok(T),
    Failed(CollaboratorError),
    TimedOut,
    CircuitOpen,
    Cancelled,
}

impl<T> CallOutcome<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            Self::Ok(v) => Some(v),
            _ => None,
        }
    }

    /// Short label for logs and diagnostics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ok(_) => "ok",
            Self::Failed(_) => "failed",
            Self::TimedOut => "timed_out",
            Self::CircuitOpen => "circuit_open",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Run `fut` if the dependency's breaker allows it, racing `budget` and
/// `cancel`, and report the result back to the breaker.
///
/// Timeouts and dependency failures count against the breaker. Caller-side
/// errors (bad request, missing config) and cancellations do not.
pub async fn guarded_call<T, F>(
    breakers: Option<&BreakerRegistry>,
    dependency: &str,
    budget: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> CallOutcome<T>
where
    F: Future<Output = Result<T, CollaboratorError>>,
{
    let call = match breakers.map(|b| b.check(dependency)) {
        Some(BreakerCheck::Open { .. }) => return CallOutcome::CircuitOpen,
        Some(BreakerCheck::Allowed(call)) => Some(call),
        None => None,
    };

    match race(budget, cancel, fut).await {
        Timed::Completed(Ok(v)) => {
            if let Some(call) = call {
                call.success();
            }
            CallOutcome::Ok(v)
        }
        Timed::Completed(Err(e)) => {
            if let Some(call) = call {
                if e.is_dependency_failure() {
                    call.failure();
                }
            }
            warn!(dependency, error = %e, kind = e.error_kind(), "collaborator call failed");
            CallOutcome::Failed(e)
        }
        Timed::TimedOut(_) => {
            if let Some(call) = call {
                call.failure();
            }
            warn!(dependency, timeout_ms = budget.as_millis() as u64, "collaborator call timed out");
            CallOutcome::TimedOut
        }
        Timed::Cancelled => CallOutcome::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clonar_admission::{BreakerConfig, BreakerStatus};

    fn breakers() -> BreakerRegistry {
        BreakerRegistry::new(BreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(60),
            jitter_factor: 0.0,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_trip_the_breaker_then_short_circuit() {
        let reg = breakers();
        let cancel = CancellationToken::new();
        for _ in 0..2 {
            let out: CallOutcome<()> = guarded_call(Some(&reg), "llm", Duration::from_secs(1), &cancel, async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
            assert!(matches!(out, CallOutcome::TimedOut));
        }
        assert_eq!(reg.status("llm"), BreakerStatus::Open);

        let out = guarded_call(Some(&reg), "llm", Duration::from_secs(1), &cancel, async { Ok(1) }).await;
        assert!(matches!(out, CallOutcome::CircuitOpen));
    }

    #[tokio::test]
    async fn caller_errors_do_not_count() {
        let reg = breakers();
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            let out: CallOutcome<()> = guarded_call(Some(&reg), "llm", Duration::from_secs(1), &cancel, async {
                Err(CollaboratorError::NotConfigured("key".into()))
            })
            .await;
            assert_eq!(out.label(), "failed");
        }
        assert_eq!(reg.status("llm"), BreakerStatus::Closed);
    }

    #[tokio::test]
    async fn works_without_breakers() {
        let out = guarded_call(None, "llm", Duration::from_secs(1), &CancellationToken::new(), async {
            Ok::<_, CollaboratorError>("x")
        })
        .await;
        assert_eq!(out.ok(), Some("x"));
    }
}
