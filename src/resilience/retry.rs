use crate::resilience::types::{ResilienceError, RetryPolicy};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Invoke `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempt budget runs out.
///
/// After the zero-based attempt `n` fails, the loop sleeps
/// `min(base_delay * backoff_factor^n, max_delay)`, scaled by a random factor in
/// `[0.5, 1.0]` when jitter is enabled. Non-retryable errors are returned as-is
/// without sleeping. When every attempt failed, the last error is wrapped in
/// [`ResilienceError::RetryExhausted`].
pub async fn retry<T, F, Fut, P>(
    policy: &RetryPolicy,
    is_retryable: P,
    mut op: F,
) -> Result<T, ResilienceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ResilienceError>>,
    P: Fn(&ResilienceError) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..max_attempts {
        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("Operation succeeded on attempt {}/{}", attempt + 1, max_attempts);
                }
                return Ok(value);
            }
            Err(error) if !is_retryable(&error) => {
                debug!("Operation failed with non-retryable error: {}", error);
                return Err(error);
            }
            Err(error) => {
                if attempt + 1 == max_attempts {
                    warn!(
                        "Operation failed after {} attempts: {}",
                        max_attempts, error
                    );
                    last_error = Some(error);
                    break;
                }

                let delay = backoff_delay(policy, attempt);
                warn!(
                    "Operation failed (attempt {}/{}), retrying in {:.2}s: {}",
                    attempt + 1,
                    max_attempts,
                    delay.as_secs_f64(),
                    error
                );
                last_error = Some(error);
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(ResilienceError::RetryExhausted {
        attempts: max_attempts,
        last: Box::new(
            last_error.unwrap_or_else(|| ResilienceError::Transient("no attempt made".into())),
        ),
    })
}

/// Delay before the next attempt, with jitter applied when the policy asks for it.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let delay = policy.delay_for(attempt);
    if policy.jitter {
        let factor = 0.5 + rand::random::<f64>() * 0.5;
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay)
    } else {
        delay
    }
}
