use std::cmp;
use std::time::Duration;

use tokio::time::Instant;

/// Bounded exponential backoff settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,

    /// Wait after the first failure. Doubles on every further failure
    pub base_delay: Duration,

    /// Upper bound for the wait between attempts
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl RetryPolicy {
    pub fn start(&self) -> Retry {
        Retry {
            policy: self.clone(),
            attempts: 0,
            current_backoff: self.base_delay,
            deadline: None,
        }
    }

    /// Like [`RetryPolicy::start`], but also give up once waiting for the
    /// next attempt would go past `deadline`
    pub fn start_with_deadline(&self, deadline: Instant) -> Retry {
        Retry {
            deadline: Some(deadline),
            ..self.start()
        }
    }
}

/// Retry state for a single operation.
///
/// Call [`Retry::begin`] before every attempt and [`Retry::backoff`] after
/// every failed one. `backoff` returns the time to wait before the next
/// attempt, or `None` once the policy is exhausted.
#[derive(Debug, Clone)]
pub struct Retry {
    policy: RetryPolicy,
    attempts: u32,
    current_backoff: Duration,
    deadline: Option<Instant>,
}

impl Retry {
    /// Register a new attempt, returning its 1-based number
    pub fn begin(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Number of attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failure of the current attempt.
    ///
    /// `retry_after` is a wait requested by the remote end, it replaces the
    /// computed backoff when given. Both are capped at `max_delay`.
    pub fn backoff(&mut self, retry_after: Option<Duration>) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }

        let delay = if let Some(duration) = retry_after {
            cmp::min(duration, self.policy.max_delay)
        } else {
            let delay = self.current_backoff;
            self.current_backoff = cmp::min(self.current_backoff * 2, self.policy.max_delay);
            cmp::min(delay, self.policy.max_delay)
        };

        if let Some(deadline) = self.deadline
            && Instant::now() + delay > deadline
        {
            return None;
        }

        Some(delay)
    }

    /// Wait out the backoff for the failed attempt.
    ///
    /// Returns `false` without waiting if no attempts are left.
    pub async fn wait(&mut self, retry_after: Option<Duration>) -> bool {
        match self.backoff(retry_after) {
            Some(delay) => {
                tokio::time::sleep(delay).await;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        }
    }

    #[test]
    fn test_doubles_delay_up_to_the_cap() {
        let mut retry = policy(10).start();
        let mut delays = Vec::new();
        for _ in 0..5 {
            retry.begin();
            delays.push(retry.backoff(None).unwrap());
        }

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(350),
                Duration::from_millis(350),
                Duration::from_millis(350),
            ]
        );
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let mut retry = policy(3).start();

        assert_eq!(retry.begin(), 1);
        assert!(retry.backoff(None).is_some());
        assert_eq!(retry.begin(), 2);
        assert!(retry.backoff(None).is_some());
        assert_eq!(retry.begin(), 3);
        assert!(retry.backoff(None).is_none());
        assert_eq!(retry.attempts(), 3);
    }

    #[test]
    fn test_retry_after_overrides_backoff() {
        let mut retry = policy(3).start();
        retry.begin();

        assert_eq!(
            retry.backoff(Some(Duration::from_millis(300))),
            Some(Duration::from_millis(300))
        );

        // the computed backoff does not advance on remote delays
        retry.begin();
        assert_eq!(retry.backoff(None), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_retry_after_is_capped() {
        let mut retry = policy(3).start();
        retry.begin();

        // a day long wait requested by the remote
        assert_eq!(
            retry.backoff(Some(Duration::from_secs(86_400))),
            Some(Duration::from_millis(350))
        );
    }

    #[tokio::test]
    async fn test_gives_up_when_the_deadline_would_pass() {
        let deadline = Instant::now() + Duration::from_millis(150);
        let mut retry = policy(10).start_with_deadline(deadline);

        retry.begin();
        assert!(retry.backoff(None).is_some());
        retry.begin();
        // 200ms from now is past the deadline
        assert!(retry.backoff(None).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_sleeps_for_the_backoff() {
        let mut retry = policy(2).start();
        let start = Instant::now();

        retry.begin();
        assert!(retry.wait(None).await);
        assert!(Instant::now() - start >= Duration::from_millis(100));

        retry.begin();
        assert!(!retry.wait(None).await);
    }
}
