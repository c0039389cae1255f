use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Error};
use tokio::sync::Mutex;

use super::RateLimiter;

struct SubBudget {
    share: f64,
    limiter: Arc<RateLimiter>,
    requests: AtomicU64,
    wait_nanos: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BudgetStats {
    pub total_requests: u64,
    pub total_wait: Duration,
}

/// Partitions a total requests-per-second budget across named sub-budgets
/// (e.g. "promotion" 70%, "signing" 30%), each owning its own `RateLimiter` and
/// therefore its own token bucket — the fix for the legacy single
/// process-wide transport described in spec §9.
pub struct BudgetAllocator {
    total_rps: f64,
    burst_fraction: f64,
    sub_budgets: Mutex<HashMap<String, SubBudget>>,
}

impl BudgetAllocator {
    pub fn new(total_rps: f64) -> Self {
        BudgetAllocator {
            total_rps,
            burst_fraction: 1.0,
            sub_budgets: Mutex::new(HashMap::new()),
        }
    }

    /// Register a named sub-budget with the given share (0.0..=1.0) of the
    /// total RPS, returning a rate limiter scoped to that share.
    pub async fn register(&self, name: impl Into<String>, share: f64) -> Result<Arc<RateLimiter>, Error> {
        if !(0.0..=1.0).contains(&share) {
            bail!("sub-budget share must be in [0, 1], got {}", share);
        }
        let name = name.into();
        let limiter = Arc::new(Self::limiter_for_share(self.total_rps, self.burst_fraction, share));
        let mut budgets = self.sub_budgets.lock().await;
        budgets.insert(
            name,
            SubBudget {
                share,
                limiter: limiter.clone(),
                requests: AtomicU64::new(0),
                wait_nanos: AtomicU64::new(0),
            },
        );
        Ok(limiter)
    }

    fn limiter_for_share(total_rps: f64, burst_fraction: f64, share: f64) -> RateLimiter {
        let rps = (total_rps * share).max(1.0).round() as u32;
        let burst = ((total_rps * share * burst_fraction).max(1.0)).round() as u32;
        RateLimiter::new(
            NonZeroU32::new(rps).unwrap_or(NonZeroU32::new(1).unwrap()),
            NonZeroU32::new(burst).unwrap_or(NonZeroU32::new(1).unwrap()),
        )
    }

    /// Record a completed request's wait time against a named sub-budget.
    pub async fn record(&self, name: &str, waited: Duration) {
        let budgets = self.sub_budgets.lock().await;
        if let Some(b) = budgets.get(name) {
            b.requests.fetch_add(1, Ordering::Relaxed);
            b.wait_nanos
                .fetch_add(waited.as_nanos() as u64, Ordering::Relaxed);
        }
    }

    /// Hand the full remaining budget to `name`, clamping every other
    /// sub-budget's share to 0 — used when one phase (e.g. signing) has
    /// finished and the rest should go to whatever's still running.
    pub async fn give_all(&self, name: &str) -> Result<(), Error> {
        let mut budgets = self.sub_budgets.lock().await;
        if !budgets.contains_key(name) {
            bail!("no such sub-budget: {}", name);
        }
        let total_rps = self.total_rps;
        let burst_fraction = self.burst_fraction;
        for (key, budget) in budgets.iter_mut() {
            let new_share = if key == name { 1.0 } else { 0.0 };
            budget.share = new_share;
            budget.limiter = Arc::new(Self::limiter_for_share(total_rps, burst_fraction, new_share.max(0.0)));
        }
        Ok(())
    }

    pub async fn stats(&self, name: &str) -> Option<BudgetStats> {
        let budgets = self.sub_budgets.lock().await;
        budgets.get(name).map(|b| BudgetStats {
            total_requests: b.requests.load(Ordering::Relaxed),
            total_wait: Duration::from_nanos(b.wait_nanos.load(Ordering::Relaxed)),
        })
    }

    pub async fn limiter(&self, name: &str) -> Option<Arc<RateLimiter>> {
        let budgets = self.sub_budgets.lock().await;
        budgets.get(name).map(|b| b.limiter.clone())
    }
}
