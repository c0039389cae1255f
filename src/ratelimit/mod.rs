pub mod budget;

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Error};
use governor::{Quota, RateLimiter as GovernorLimiter};
use rand::Rng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub use budget::{BudgetAllocator, BudgetStats};

/// How long a 429 parks all requests before retrying (§4.7).
pub const BACKOFF_DURATION: Duration = Duration::from_secs(10);
/// A second 429 within this window does not re-extend the cooldown.
pub const BACKOFF_COOLDOWN: Duration = Duration::from_secs(15);

type DirectLimiter = GovernorLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// The single transport-level gate every outbound HTTP call in the engine
/// passes through: a token bucket (capacity `burst`, refill at `limit`/sec)
/// plus an anti-stampede cooldown after a 429. Generalizes the retry loop the
/// teacher hand-rolls in `registry::http::http_cli::HttpCli::request` by
/// adding the rate-limiting half of the contract; the auth-refresh/redirect
/// half stays in `registry::http`.
pub struct RateLimiter {
    limiter: DirectLimiter,
    cooldown_until: Mutex<Option<Instant>>,
    last_cooldown_entered: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(limit_per_sec: NonZeroU32, burst: NonZeroU32) -> Self {
        let quota = Quota::per_second(limit_per_sec).allow_burst(burst);
        RateLimiter {
            limiter: GovernorLimiter::direct(quota),
            cooldown_until: Mutex::new(None),
            last_cooldown_entered: Mutex::new(None),
        }
    }

    /// Wait for a token and for any active cooldown to elapse, observing
    /// `cancel`. Returns an error if cancelled before a token was granted.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), Error> {
        loop {
            let wait_for = {
                let cooldown_until = self.cooldown_until.lock().await;
                cooldown_until.map(|until| until.saturating_duration_since(Instant::now()))
            };
            match wait_for {
                Some(d) if !d.is_zero() => {
                    tokio::select! {
                        _ = tokio::time::sleep(d) => continue,
                        _ = cancel.cancelled() => bail!("cancelled while waiting out rate-limit cooldown"),
                    }
                }
                _ => break,
            }
        }

        tokio::select! {
            _ = self.limiter.until_ready() => Ok(()),
            _ = cancel.cancelled() => bail!("cancelled while waiting for a rate-limit token"),
        }
    }

    /// Record a 429 response. Anti-stampede: a second 429 observed while
    /// already in cooldown does not push the cooldown deadline further out.
    pub async fn note_throttled(&self) {
        let now = Instant::now();
        let mut last = self.last_cooldown_entered.lock().await;
        let should_extend = match *last {
            Some(prev) => now.duration_since(prev) >= BACKOFF_COOLDOWN,
            None => true,
        };
        if should_extend {
            *last = Some(now);
            let mut cooldown_until = self.cooldown_until.lock().await;
            *cooldown_until = Some(now + BACKOFF_DURATION);
        }
    }
}

/// Exponential backoff with jitter for 5xx responses, one request at a time
/// (distinct from the shared-cooldown 429 behavior above).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: f64,
    pub steps: u32,
    pub deadline: Duration,
}

impl RetryPolicy {
    pub fn promotion_default() -> Self {
        RetryPolicy {
            base: Duration::from_millis(250),
            factor: 2.0,
            steps: 6,
            deadline: Duration::from_secs(32 * 60),
        }
    }

    pub fn audit_default() -> Self {
        RetryPolicy {
            base: Duration::from_millis(250),
            factor: 2.0,
            steps: 6,
            deadline: Duration::from_secs(8 * 60),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.base.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = raw.min(self.deadline.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.0..capped.max(0.001));
        Duration::from_secs_f64(jitter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// 5xx, timeout, connection reset: retry with backoff.
    Transient,
    /// 429: governed by the shared `RateLimiter` cooldown, not per-request backoff.
    Throttled,
    /// Anything else: don't retry.
    Terminal,
}

/// Run `f` under `policy`, retrying `Transient`/`Throttled` failures up to
/// `policy.steps` times or until `policy.deadline` elapses, observing `cancel`
/// at every sleep. `classify` maps an error to a `RetryClass`.
pub async fn retry<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    limiter: Option<&Arc<RateLimiter>>,
    cancel: &CancellationToken,
    classify: C,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryClass,
{
    let deadline = Instant::now() + policy.deadline;
    let mut attempt = 0u32;
    loop {
        let result = f().await;
        let err = match result {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };

        let class = classify(&err);
        if class == RetryClass::Terminal || attempt >= policy.steps || Instant::now() >= deadline
        {
            return Err(err);
        }

        if class == RetryClass::Throttled {
            if let Some(limiter) = limiter {
                limiter.note_throttled().await;
            }
        }

        let delay = policy.delay_for(attempt);
        attempt += 1;
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU32;

    #[tokio::test]
    async fn acquire_respects_burst_then_refills() {
        let limiter = RateLimiter::new(
            NonZeroU32::new(100).unwrap(),
            NonZeroU32::new(1).unwrap(),
        );
        let cancel = CancellationToken::new();
        limiter.acquire(&cancel).await.unwrap();
        // second token not immediately free but arrives quickly given the high rate.
        let start = Instant::now();
        limiter.acquire(&cancel).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn second_429_within_window_does_not_extend_cooldown() {
        let limiter = RateLimiter::new(
            NonZeroU32::new(1000).unwrap(),
            NonZeroU32::new(1000).unwrap(),
        );
        limiter.note_throttled().await;
        let first_deadline = *limiter.cooldown_until.lock().await;
        limiter.note_throttled().await;
        let second_deadline = *limiter.cooldown_until.lock().await;
        assert_eq!(first_deadline, second_deadline);
    }

    #[tokio::test]
    async fn cancellation_interrupts_retry_sleep() {
        let policy = RetryPolicy {
            base: Duration::from_secs(5),
            factor: 1.0,
            steps: 10,
            deadline: Duration::from_secs(60),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let start = Instant::now();
        let res: Result<(), &str> = retry(
            &policy,
            None,
            &cancel,
            |_| RetryClass::Transient,
            || async { Err("boom") },
        )
        .await;
        assert!(res.is_err());
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
