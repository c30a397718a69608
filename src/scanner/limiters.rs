//! Token-bucket limiters built on semaphore permits: the bucket is prefilled
//! with `burst` tokens and a refill task adds one per interval while below
//! the cap, so a full bucket drops the tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::types::StartRequest;

pub struct TokenBucket {
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl TokenBucket {
    pub fn new(interval: Duration, burst: usize) -> Self {
        let interval = if interval.is_zero() { Duration::from_nanos(1) } else { interval };
        let burst = burst.max(1);
        let permits = Arc::new(Semaphore::new(burst));
        let shutdown = CancellationToken::new();

        let refill = permits.clone();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tick.tick() => {
                        if refill.available_permits() < burst {
                            refill.add_permits(1);
                        }
                    }
                }
            }
        });

        Self { permits, shutdown }
    }

    /// Consume one token, waiting for the refill if the bucket is empty.
    /// Returns `false` iff `cancel` fired first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            permit = self.permits.acquire() => match permit {
                Ok(p) => {
                    p.forget();
                    true
                }
                Err(_) => false,
            }
        }
    }

    /// Consume one token only if one is available right now.
    pub fn try_acquire(&self) -> bool {
        match self.permits.try_acquire() {
            Ok(p) => {
                p.forget();
                true
            }
            Err(_) => false,
        }
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TokenBucket {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// The two buckets a scan may carry: the request rate gate and the verbose
/// probe-event gate (which limits live event fan-out, never actual probing).
pub struct Limiters {
    pub rate: Option<Arc<TokenBucket>>,
    pub probe_events: Option<Arc<TokenBucket>>,
}

const MAX_PROBE_EVENTS_PER_SEC: u32 = 50;

impl Limiters {
    pub fn build(req: &StartRequest) -> Self {
        let rate = (req.rate_limit > 0).then(|| {
            let interval = Duration::from_secs(1) / req.rate_limit;
            let burst = (req.rate_limit as usize).min(10).max(1);
            Arc::new(TokenBucket::new(interval, burst))
        });

        let probe_events = req.verbose.then(|| {
            Arc::new(TokenBucket::new(
                Duration::from_secs(1) / MAX_PROBE_EVENTS_PER_SEC,
                MAX_PROBE_EVENTS_PER_SEC as usize,
            ))
        });

        Self { rate, probe_events }
    }

    pub fn stop(&self) {
        if let Some(bucket) = &self.rate {
            bucket.stop();
        }
        if let Some(bucket) = &self.probe_events {
            bucket.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StartRequest;

    #[tokio::test(start_paused = true)]
    async fn bucket_is_prefilled_with_burst() {
        let bucket = TokenBucket::new(Duration::from_millis(100), 3);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn refill_restores_tokens_over_time() {
        let bucket = TokenBucket::new(Duration::from_millis(100), 2);
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());

        tokio::time::sleep(Duration::from_millis(250)).await;
        tokio::task::yield_now().await;
        assert!(bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn full_bucket_drops_refill_ticks() {
        let bucket = TokenBucket::new(Duration::from_millis(10), 2);
        tokio::time::sleep(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;

        // Despite many elapsed intervals only `burst` tokens are stored.
        assert!(bucket.try_acquire());
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_observes_cancellation() {
        let bucket = TokenBucket::new(Duration::from_secs(3600), 1);
        let cancel = CancellationToken::new();
        assert!(bucket.acquire(&cancel).await);

        // Bucket is now empty and the refill is an hour out.
        cancel.cancel();
        assert!(!bucket.acquire(&cancel).await);
    }

    #[tokio::test]
    async fn rate_zero_means_no_rate_gate() {
        let req = StartRequest { rate_limit: 0, verbose: false, ..Default::default() };
        let lim = Limiters::build(&req);
        assert!(lim.rate.is_none());
        assert!(lim.probe_events.is_none());
    }

    #[tokio::test]
    async fn verbose_builds_the_probe_event_gate() {
        let req = StartRequest { rate_limit: 25, verbose: true, ..Default::default() };
        let lim = Limiters::build(&req);
        assert!(lim.rate.is_some());
        assert!(lim.probe_events.is_some());
        lim.stop();
    }
}
