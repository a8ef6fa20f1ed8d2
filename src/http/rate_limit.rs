use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

type Slot = Arc<tokio::sync::Mutex<Option<Instant>>>;

/// Per-origin minimum-interval gate for outbound requests.
///
/// Each origin gets its own async mutex holding the time of the last
/// request, so waiting on one origin never delays another. The outer
/// table lock is only held long enough to look up (or insert) a slot.
///
/// The table is bounded by `max_origins`. When it is full the
/// least-recently-used idle origin is evicted: one no task is holding or
/// waiting on, and whose interval has already passed. If every origin is
/// still busy the table grows by one instead, so an eviction can never let
/// two requests to the same origin through inside one interval.
pub struct RateLimiter {
    min_interval: Duration,
    origins: Mutex<LruCache<String, Slot>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration, max_origins: usize) -> Self {
        let capacity = NonZeroUsize::new(max_origins).unwrap_or(NonZeroUsize::MIN);
        Self {
            min_interval,
            origins: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Waits until at least `min_interval` has passed since the previous
    /// `acquire` for `origin`, then records the current time.
    ///
    /// Concurrent callers for the same origin are served one at a time in
    /// lock order; each waits at most `min_interval` after the one before it.
    pub async fn acquire(&self, origin: &str) {
        if self.min_interval.is_zero() {
            return;
        }

        let slot = self.slot(origin);
        let mut last = slot.lock().await;

        if let Some(previous) = *last {
            let ready_at = previous + self.min_interval;
            if ready_at > Instant::now() {
                tracing::debug!(
                    origin = %origin,
                    wait_ms = (ready_at - Instant::now()).as_millis() as u64,
                    "Rate limiting request"
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }

        *last = Some(Instant::now());
    }

    fn slot(&self, origin: &str) -> Slot {
        // A poisoned table only means another task panicked mid-lookup; the
        // cache itself is still consistent.
        let mut origins = self.origins.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = origins.get(origin) {
            return Arc::clone(slot);
        }

        if origins.len() >= origins.cap().get() {
            let now = Instant::now();
            let idle = origins
                .iter()
                .rev()
                .find(|(_, slot)| is_idle(slot, now, self.min_interval))
                .map(|(key, _)| key.clone());
            match idle {
                Some(key) => {
                    origins.pop(&key);
                }
                None => {
                    let grown = origins.cap().saturating_add(1);
                    tracing::debug!(capacity = grown.get(), "All rate-limited origins busy, growing table");
                    origins.resize(grown);
                }
            }
        }

        let slot: Slot = Arc::new(tokio::sync::Mutex::new(None));
        origins.put(origin.to_owned(), Arc::clone(&slot));
        slot
    }

    #[cfg(test)]
    fn tracked_origins(&self) -> usize {
        self.origins.lock().map(|o| o.len()).unwrap_or(0)
    }
}

/// True when no task holds or waits on `slot` and its last request is at
/// least `min_interval` old.
fn is_idle(slot: &Slot, now: Instant, min_interval: Duration) -> bool {
    if Arc::strong_count(slot) > 1 {
        return false;
    }
    slot.try_lock()
        .map(|last| (*last).map_or(true, |at| now.duration_since(at) >= min_interval))
        .unwrap_or(false)
}
