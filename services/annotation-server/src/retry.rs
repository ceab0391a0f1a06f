use std::future::Future;
use std::num::ParseIntError;
use std::time::Duration;

use rand::Rng;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Fixed retry intervals for background deliveries. Attempt `n` failing waits
/// `intervals[n - 1]` before attempt `n + 1`; there are `intervals + 1` attempts in total.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetrySchedule {
    intervals: Vec<Duration>,
}

impl RetrySchedule {
    pub fn new(intervals: Vec<Duration>) -> Self {
        Self { intervals }
    }

    /// Parses comma separated seconds, e.g. `10,60,180`.
    pub fn parse(s: &str) -> Result<Self, ParseIntError> {
        let intervals = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| p.parse::<u64>().map(Duration::from_secs))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { intervals })
    }

    pub fn max_attempts(&self) -> u32 {
        self.intervals.len() as u32 + 1
    }

    /// Delay before the next attempt after `attempts_made` failed attempts, or
    /// `None` once the schedule is exhausted.
    pub fn delay_after(&self, attempts_made: u32) -> Option<Duration> {
        if attempts_made == 0 {
            return Some(Duration::ZERO);
        }
        self.intervals.get(attempts_made as usize - 1).copied()
    }
}

/// Exponential backoff budget for serializable transactions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            max_elapsed: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the delay before retry number `attempt` (0-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Jittered delay in `[ceiling / 2, ceiling]`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let floor = ceiling / 2;
        if ceiling <= floor {
            return ceiling;
        }
        rand::thread_rng().gen_range(floor..=ceiling)
    }
}

pub trait RetryableError {
    fn is_serialization_conflict(&self) -> bool;
}

impl RetryableError for sqlx::Error {
    fn is_serialization_conflict(&self) -> bool {
        match self {
            sqlx::Error::Database(db) => {
                matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
            }
            _ => false,
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-conflict error, or the next
/// backoff would exceed the policy's time budget.
pub async fn retry_serializable<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryableError + std::fmt::Display,
{
    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_serialization_conflict() => {
                let delay = policy.delay_for(attempt);
                if started.elapsed() + delay > policy.max_elapsed {
                    warn!(attempts = attempt + 1, error = %e, "serializable retry budget exhausted");
                    return Err(e);
                }
                debug!(attempt, ?delay, "serialization conflict, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

pub async fn begin_serializable(pool: &PgPool) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    enum FakeError {
        Conflict,
        Fatal,
    }

    impl std::fmt::Display for FakeError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl RetryableError for FakeError {
        fn is_serialization_conflict(&self) -> bool {
            matches!(self, FakeError::Conflict)
        }
    }

    #[test]
    fn schedule_bounds_attempts() {
        let s = RetrySchedule::parse("10, 60,180").unwrap();
        assert_eq!(s.max_attempts(), 4);
        assert_eq!(s.delay_after(1), Some(Duration::from_secs(10)));
        assert_eq!(s.delay_after(2), Some(Duration::from_secs(60)));
        assert_eq!(s.delay_after(3), Some(Duration::from_secs(180)));
        assert_eq!(s.delay_after(4), None);

        let none = RetrySchedule::parse("").unwrap();
        assert_eq!(none.max_attempts(), 1);
        assert_eq!(none.delay_after(1), None);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let p = RetryPolicy::default();
        assert_eq!(p.ceiling(0), Duration::from_millis(50));
        assert_eq!(p.ceiling(1), Duration::from_millis(100));
        assert_eq!(p.ceiling(3), Duration::from_millis(400));
        assert_eq!(p.ceiling(10), Duration::from_secs(2));
        assert_eq!(p.ceiling(u32::MAX), Duration::from_secs(2));
        for attempt in 0..8 {
            let d = p.delay_for(attempt);
            assert!(d <= p.ceiling(attempt) && d >= p.ceiling(attempt) / 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn conflicts_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out: Result<u32, FakeError> = retry_serializable(&RetryPolicy::default(), || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(FakeError::Conflict)
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(out.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out: Result<(), FakeError> = retry_serializable(&RetryPolicy::default(), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(FakeError::Fatal)
            }
        })
        .await;
        assert!(matches!(out, Err(FakeError::Fatal)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_conflicts_stop_within_budget() {
        let policy = RetryPolicy {
            max_elapsed: Duration::from_secs(3),
            ..RetryPolicy::default()
        };
        let started = Instant::now();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out: Result<(), FakeError> = retry_serializable(&policy, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(FakeError::Conflict)
            }
        })
        .await;
        assert!(matches!(out, Err(FakeError::Conflict)));
        assert!(started.elapsed() <= policy.max_elapsed);
        assert!(calls.load(Ordering::SeqCst) > 1);
    }
}
