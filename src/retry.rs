use crate::classify::{Classification, Classified, FailureCategory};
use std::future::Future;
use thiserror::Error;
use tokio::time::{Duration, sleep};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(2_000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    /// The category can never succeed by retrying.
    Fatal,
    /// An infrastructure failure showed up again on a retry.
    InfrastructureRepeated,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { next_attempt: u32, delay: Duration },
    GiveUp(GiveUpReason),
}

impl RetryPolicy {
    /// What to do after attempt number `attempt` (0-based) failed with `category`.
    pub fn decide(&self, category: FailureCategory, attempt: u32) -> RetryDecision {
        if category.is_fatal() {
            return RetryDecision::GiveUp(GiveUpReason::Fatal);
        }
        if category.is_infrastructure() && attempt >= 1 {
            return RetryDecision::GiveUp(GiveUpReason::InfrastructureRepeated);
        }
        if attempt < self.max_retries {
            return RetryDecision::Retry {
                next_attempt: attempt + 1,
                delay: self.retry_delay,
            };
        }
        RetryDecision::GiveUp(GiveUpReason::Exhausted)
    }
}

/// Final failure of a retried operation, already translated for the user.
#[derive(Debug, Error)]
#[error("{} ({} after {attempts} attempt(s)): {error}", .classification.message, .classification.category)]
pub struct RetryFailure<E> {
    pub error: E,
    pub classification: Classification,
    pub attempts: u32,
    pub reason: GiveUpReason,
}

impl<E> RetryFailure<E> {
    pub fn user_message(&self) -> &'static str {
        self.classification.message
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Runs `attempt` until it succeeds or the policy gives up. The closure
    /// receives the 0-based attempt number.
    pub async fn attempt_with_retry<T, E, F, Fut>(
        &self,
        provider_id: &str,
        mut attempt: F,
    ) -> Result<T, RetryFailure<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classified + std::fmt::Display,
    {
        let mut current = 0;
        loop {
            crate::metrics::scrape_attempt(current);
            let error = match attempt(current).await {
                Ok(value) => {
                    if current > 0 {
                        info!(target: "scrape.retry", provider_id, attempt = current, "attempt succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let classification = error.classification();
            match self.policy.decide(classification.category, current) {
                RetryDecision::Retry {
                    next_attempt,
                    delay,
                } => {
                    warn!(
                        target: "scrape.retry",
                        provider_id,
                        attempt = current,
                        category = %classification.category,
                        error = %error,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed, retrying"
                    );
                    sleep(delay).await;
                    current = next_attempt;
                }
                RetryDecision::GiveUp(reason) => {
                    warn!(
                        target: "scrape.retry",
                        provider_id,
                        attempts = current + 1,
                        category = %classification.category,
                        reason = ?reason,
                        error = %error,
                        "giving up on scrape"
                    );
                    return Err(RetryFailure {
                        error,
                        classification,
                        attempts: current + 1,
                        reason,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    #[derive(Debug)]
    struct RawFailure(&'static str);

    impl std::fmt::Display for RawFailure {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.0)
        }
    }

    impl Classified for RawFailure {
        fn classification(&self) -> Classification {
            classify(self.0)
        }
    }

    /// Fails with `errors` in order, then succeeds. Records when each attempt ran.
    fn scripted(
        errors: Vec<&'static str>,
    ) -> (
        Arc<Mutex<Vec<Instant>>>,
        impl FnMut(u32) -> std::future::Ready<Result<u32, RawFailure>>,
    ) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let log = calls.clone();
        let op = move |attempt: u32| {
            log.lock().unwrap().push(Instant::now());
            let outcome = match errors.get(attempt as usize).copied() {
                Some(text) => Err(RawFailure(text)),
                None => Ok(attempt),
            };
            std::future::ready(outcome)
        };
        (calls, op)
    }

    #[test]
    fn policy_table() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(FailureCategory::TransportFailure, 0),
            RetryDecision::Retry {
                next_attempt: 1,
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(
            policy.decide(FailureCategory::TransportFailure, 1),
            RetryDecision::GiveUp(GiveUpReason::InfrastructureRepeated)
        );
        assert_eq!(
            policy.decide(FailureCategory::AuthenticationFailed, 0),
            RetryDecision::GiveUp(GiveUpReason::Fatal)
        );
        assert!(matches!(
            policy.decide(FailureCategory::Timeout, 2),
            RetryDecision::Retry { next_attempt: 3, .. }
        ));
        assert_eq!(
            policy.decide(FailureCategory::Timeout, 3),
            RetryDecision::GiveUp(GiveUpReason::Exhausted)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_transport_failure_fast_fails_after_two_attempts() {
        let controller = RetryController::default();
        let (calls, op) = scripted(vec!["status code 500", "status code 500", "status code 500"]);

        let failure = controller
            .attempt_with_retry("prov-1", op)
            .await
            .expect_err("should give up");

        assert_eq!(calls.lock().unwrap().len(), 2);
        assert_eq!(failure.attempts, 2);
        assert_eq!(failure.reason, GiveUpReason::InfrastructureRepeated);
        assert!(
            failure
                .user_message()
                .contains("utility provider service is currently unavailable")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_use_full_budget_with_delay() {
        let controller = RetryController::default();
        let (calls, op) = scripted(vec!["timed out"; 10]);

        let failure = controller
            .attempt_with_retry("prov-1", op)
            .await
            .expect_err("should exhaust");

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        assert_eq!(failure.reason, GiveUpReason::Exhausted);
        assert_eq!(failure.classification.category, FailureCategory::Timeout);
        for pair in calls.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(2_000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_one_transient_failure() {
        let controller = RetryController::default();
        let (calls, op) = scripted(vec!["429 Too Many Requests"]);

        let value = controller
            .attempt_with_retry("prov-1", op)
            .await
            .expect("second attempt succeeds");

        assert_eq!(value, 1);
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn configuration_failures_are_never_retried() {
        let controller = RetryController::default();
        let (calls, op) = scripted(vec!["extension pgcrypto is not installed"]);

        let failure = controller
            .attempt_with_retry("prov-1", op)
            .await
            .expect_err("fatal");

        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(failure.reason, GiveUpReason::Fatal);
        assert!(failure.user_message().contains("pgcrypto"));
    }

    #[tokio::test(start_paused = true)]
    async fn respects_configured_budget() {
        let controller = RetryController::new(RetryPolicy {
            max_retries: 1,
            retry_delay: Duration::from_millis(10),
        });
        let (calls, op) = scripted(vec!["unexpected"; 5]);

        let failure = controller
            .attempt_with_retry("prov-1", op)
            .await
            .expect_err("exhausted");

        assert_eq!(calls.lock().unwrap().len(), 2);
        assert_eq!(failure.classification.category, FailureCategory::Unknown);
    }
}
