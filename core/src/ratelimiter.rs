//! QPS pacing for outbound enrichment queries.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

const MAX_BURST: usize = 16;

/// Token-drip limiter: a background task adds one permit per interval and
/// each caller burns one permit per request. Idle permits accumulate only up
/// to a small burst allowance.
#[derive(Clone)]
pub struct RateLimiter {
    sem: Arc<Semaphore>,
}

impl RateLimiter {
    /// Must be called from within a tokio runtime; the refill task is
    /// spawned on it.
    pub fn new(queries_per_sec: u32) -> Self {
        let sem = Arc::new(Semaphore::new(0));
        let refill = sem.clone();
        let every = Duration::from_millis(1000 / u64::from(queries_per_sec.max(1)));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if refill.available_permits() < MAX_BURST {
                    refill.add_permits(1);
                }
            }
        });
        RateLimiter { sem }
    }

    pub async fn acquire(&self) {
        // The semaphore is never closed; forget the permit so it is not
        // handed back on drop.
        if let Ok(permit) = self.sem.acquire().await {
            permit.forget();
        }
    }
}
