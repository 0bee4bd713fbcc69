//! Shared retry policy for the issuance deadline race and the PDF poller.
//!
//! A policy bundles the attempt ceiling, the delay between attempts (fixed or
//! exponential), an optional overall deadline and what to do once the attempts
//! run out.

use std::future::Future;
use std::time::Duration;

/// What the caller does once every attempt has been used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// Give up and report failure.
    Fail,
    /// Act as if the last attempt succeeded.
    Proceed,
}

#[derive(Debug, thiserror::Error)]
#[error("deadline of {}s exceeded", .0.as_secs())]
pub struct DeadlineExceeded(pub Duration);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// 1.0 gives a fixed delay.
    pub multiplier: f64,
    pub deadline: Option<Duration>,
    pub fallback: Fallback,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            deadline: None,
            fallback: Fallback::Fail,
        }
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// Single attempt raced against `timeout`; losing the race is a failure.
    pub fn issuance(timeout: Duration) -> Self {
        Self::builder()
            .max_attempts(1)
            .deadline(timeout)
            .fallback(Fallback::Fail)
            .build()
    }

    /// Fixed-delay polling that proceeds anyway once exhausted.
    pub fn pdf(max_attempts: u32, delay: Duration) -> Self {
        Self::builder()
            .max_attempts(max_attempts)
            .initial_delay(delay)
            .max_delay(delay)
            .multiplier(1.0)
            .fallback(Fallback::Proceed)
            .build()
    }

    /// Delay to wait after the given (zero-based) attempt.
    ///
    /// `initial_delay * multiplier^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let delay = Duration::from_millis(delay_ms as u64);

        delay.min(self.max_delay)
    }

    /// Attempts at which progress should be surfaced to the operator:
    /// the first one and each further third of the ceiling.
    pub fn is_milestone(&self, attempt: u32) -> bool {
        attempt == 0 || attempt == self.max_attempts / 3 || attempt == 2 * self.max_attempts / 3
    }

    pub fn is_last_attempt(&self, attempt: u32) -> bool {
        attempt + 1 >= self.max_attempts
    }

    /// Races `operation` against the deadline, if any. The losing future is
    /// dropped; race a `JoinHandle` when the work has to outlive the wait.
    pub async fn race<F, T>(&self, operation: F) -> Result<T, DeadlineExceeded>
    where
        F: Future<Output = T>,
    {
        match self.deadline {
            Some(limit) => tokio::time::timeout(limit, operation)
                .await
                .map_err(|_| DeadlineExceeded(limit)),
            None => Ok(operation.await),
        }
    }
}

pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.policy.max_attempts = max_attempts.max(1);
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.policy.deadline = Some(deadline);
        self
    }

    pub fn fallback(mut self, fallback: Fallback) -> Self {
        self.policy.fallback = fallback;
        self
    }

    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(500))
            .multiplier(2.0)
            .build();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn test_pdf_policy_uses_fixed_delay() {
        let policy = RetryPolicy::pdf(15, Duration::from_secs(2));
        for attempt in 0..15 {
            assert_eq!(policy.delay_for_attempt(attempt), Duration::from_secs(2));
        }
        assert_eq!(policy.fallback, Fallback::Proceed);
        assert!(policy.is_last_attempt(14));
        assert!(!policy.is_last_attempt(13));
    }

    #[test]
    fn test_milestones() {
        let policy = RetryPolicy::pdf(15, Duration::from_secs(2));
        let milestones: Vec<u32> = (0..15).filter(|a| policy.is_milestone(*a)).collect();
        assert_eq!(milestones, vec![0, 5, 10]);

        let policy = RetryPolicy::pdf(5, Duration::from_millis(10));
        let milestones: Vec<u32> = (0..5).filter(|a| policy.is_milestone(*a)).collect();
        assert_eq!(milestones, vec![0, 1, 3]);
    }

    #[test]
    fn test_zero_attempts_is_clamped() {
        let policy = RetryPolicy::builder().max_attempts(0).build();
        assert_eq!(policy.max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_times_out() {
        let policy = RetryPolicy::issuance(Duration::from_secs(60));
        let result = policy
            .race(async {
                tokio::time::sleep(Duration::from_secs(61)).await;
                42
            })
            .await;
        assert!(matches!(result, Err(DeadlineExceeded(d)) if d == Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_wins_before_deadline() {
        let policy = RetryPolicy::issuance(Duration::from_secs(60));
        let result = policy
            .race(async {
                tokio::time::sleep(Duration::from_secs(59)).await;
                42
            })
            .await;
        assert_eq!(result.unwrap(), 42);
    }
}
