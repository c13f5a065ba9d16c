use super::error::{AgentError, ModelError, Result};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries allowed after the initial call.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry `n` (1-based): `base_delay * 2^(n-1)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exp)
    }
}

/// Per-call bookkeeping, dropped once the call settles.
#[derive(Debug)]
struct RetryState {
    attempt: u32,
    policy: RetryPolicy,
}

/// Run `op` until it succeeds, fails permanently, or transient failures
/// outlast the policy. Sleeps between attempts; never runs anything in the
/// background.
pub async fn call_with_retry<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ModelError>>,
{
    let mut state = RetryState { attempt: 0, policy };
    loop {
        state.attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(ModelError::Permanent(msg)) => return Err(AgentError::PermanentService(msg)),
            Err(ModelError::Transient(msg)) => {
                let retry = state.attempt;
                if retry > state.policy.max_retries {
                    return Err(AgentError::TransientService {
                        attempts: state.attempt,
                        last: msg,
                    });
                }
                let delay = state.policy.delay_for(retry);
                warn!(
                    "Retrying model call after transient failure (retry {}/{}, waiting {:?}): {}",
                    retry, state.policy.max_retries, delay, msg
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[test]
    fn test_delay_doubles() {
        let p = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_succeeds_after_two_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = call_with_retry(policy(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(ModelError::Transient("503".into()))
                } else {
                    Ok("reply")
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, "reply");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_escalates_when_transient_failures_persist() {
        let calls = AtomicU32::new(0);
        let err = call_with_retry(policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ModelError::Transient("429".into())) }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(matches!(err, AgentError::TransientService { attempts: 4, .. }));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let err = call_with_retry(policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ModelError::Permanent("401".into())) }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, AgentError::PermanentService(_)));
    }
}
