use async_trait::async_trait;
use std::time::Duration;

use super::chain::{Advisor, CallChain};
use super::context::{ChatRequest, ATTEMPTS_ATTRIBUTE};
use crate::errors::{GatewayError, GatewayResult};
use crate::providers::base::Completion;

/// Exponential backoff schedule and attempt cap for transient upstream failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, min_backoff: Duration, max_backoff: Duration) -> GatewayResult<Self> {
        if max_attempts == 0 {
            return Err(GatewayError::Config(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if min_backoff > max_backoff {
            return Err(GatewayError::Config(format!(
                "retry min_backoff ({}ms) exceeds max_backoff ({}ms)",
                min_backoff.as_millis(),
                max_backoff.as_millis()
            )));
        }
        Ok(Self {
            max_attempts,
            min_backoff,
            max_backoff,
        })
    }

    /// Wait after the given failed attempt (1-based): `min(max, min * 2^(attempt-1))`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        2u32.checked_pow(exponent)
            .and_then(|factor| self.min_backoff.checked_mul(factor))
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }

    /// Whether a failure on the given attempt earns another one
    pub fn should_retry(&self, error: &GatewayError, attempt: u32) -> bool {
        error.is_retryable() && attempt < self.max_attempts
    }
}

/// Re-invokes the rest of the chain on transient failures. Blocking path only: once a
/// stream has handed chunks to the caller there is nothing safe to replay.
#[derive(Debug, Clone, Default)]
pub struct RetryAdvisor {
    policy: RetryPolicy,
}

impl RetryAdvisor {
    pub const DEFAULT_ORDER: i32 = 100;

    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl Advisor for RetryAdvisor {
    fn name(&self) -> &str {
        "retry"
    }

    async fn advise_call(&self, request: ChatRequest, next: CallChain) -> GatewayResult<Completion> {
        let mut attempt = 1;
        loop {
            request.context.set_attribute(ATTEMPTS_ATTRIBUTE, attempt);

            let error = match next.call(request.clone()).await {
                Ok(completion) => return Ok(completion),
                Err(error) => error,
            };

            if !self.policy.should_retry(&error, attempt) {
                if error.is_retryable() {
                    tracing::warn!(
                        request_id = %request.context.request_id(),
                        attempts = attempt,
                        error = %error,
                        "Giving up after exhausting retry attempts"
                    );
                }
                return Err(error);
            }

            let delay = self.policy.backoff(attempt);
            tracing::warn!(
                request_id = %request.context.request_id(),
                attempt,
                max_attempts = self.policy.max_attempts,
                backoff_ms = delay.as_millis() as u64,
                error = %error,
                "Transient upstream failure, retrying"
            );
            // Dropping this future while asleep cancels all further attempts
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisors::chain::AdvisorChain;
    use crate::advisors::context::AdvisorContext;
    use crate::models::message::Message;
    use crate::providers::base::{Prompt, Usage};
    use crate::providers::mock::MockInvoker;
    use std::sync::Arc;

    fn request() -> ChatRequest {
        ChatRequest::new(
            AdvisorContext::new("c"),
            Prompt::new("", vec![Message::user("hi")]),
        )
    }

    fn chain(mock: &Arc<MockInvoker>, policy: RetryPolicy) -> AdvisorChain {
        AdvisorChain::builder(mock.clone())
            .advisor(RetryAdvisor::new(policy), RetryAdvisor::DEFAULT_ORDER)
            .build()
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(5), Duration::from_secs(10));
        assert_eq!(policy.backoff(64), Duration::from_secs(10));
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::new(0, Duration::ZERO, Duration::ZERO).is_err());
        assert!(RetryPolicy::new(3, Duration::from_secs(5), Duration::from_secs(1)).is_err());
        assert!(RetryPolicy::new(1, Duration::ZERO, Duration::ZERO).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_timeouts_then_success() -> anyhow::Result<()> {
        let mock = Arc::new(MockInvoker::new(vec![
            Err(GatewayError::timeout("first")),
            Err(GatewayError::timeout("second")),
            Ok(Completion::new("done", Usage::default(), "m")),
        ]));
        let req = request();
        let context = req.context.clone();

        let started = tokio::time::Instant::now();
        let completion = chain(&mock, RetryPolicy::default()).call(req).await?;

        assert_eq!(completion.text, "done");
        assert_eq!(mock.invocations(), 3);
        assert_eq!(context.attempts(), Some(3));
        // 1s + 2s of backoff on the paused clock
        assert!(started.elapsed() >= Duration::from_secs(3));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_return_last_error() {
        let mock = Arc::new(MockInvoker::new(vec![
            Err(GatewayError::timeout("one")),
            Err(GatewayError::connection("two")),
            Err(GatewayError::timeout("three")),
            Ok(Completion::new("too late", Usage::default(), "m")),
        ]));

        let err = chain(&mock, RetryPolicy::default())
            .call(request())
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::timeout("three"));
        assert_eq!(mock.invocations(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let mock = Arc::new(MockInvoker::new(vec![
            Err(GatewayError::FatalUpstream("400 bad request".to_string())),
            Ok(Completion::new("unused", Usage::default(), "m")),
        ]));

        let err = chain(&mock, RetryPolicy::default())
            .call(request())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::FatalUpstream(_)));
        assert_eq!(mock.invocations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_policy() {
        let mock = Arc::new(MockInvoker::new(vec![Err(GatewayError::timeout("only"))]));
        let policy = RetryPolicy::new(1, Duration::from_secs(1), Duration::from_secs(1)).unwrap();

        assert!(chain(&mock, policy).call(request()).await.is_err());
        assert_eq!(mock.invocations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_further_attempts() {
        let mock = Arc::new(MockInvoker::new(vec![
            Err(GatewayError::timeout("one")),
            Ok(Completion::new("never", Usage::default(), "m")),
        ]));
        let chain = chain(&mock, RetryPolicy::default());

        // Cancel while the advisor sleeps through its first backoff
        let cancelled =
            tokio::time::timeout(Duration::from_millis(500), chain.call(request())).await;
        assert!(cancelled.is_err());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(mock.invocations(), 1);
    }
}
