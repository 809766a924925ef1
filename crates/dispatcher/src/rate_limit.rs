//! Lock-free records-per-second ceiling

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

const WINDOW_MS: u64 = 1_000;

/// Fixed one-second window counter
///
/// A limit of zero disables limiting. The limit can be changed at any time
/// (reconfigure) without blocking `allow`.
#[derive(Debug)]
pub struct RateLimiter {
    limit: AtomicU32,
    window_start_ms: AtomicU64,
    count: AtomicU32,
    epoch: Instant,
}

impl RateLimiter {
    pub fn new(limit: Option<u32>) -> Self {
        Self {
            limit: AtomicU32::new(limit.unwrap_or(0)),
            window_start_ms: AtomicU64::new(0),
            count: AtomicU32::new(0),
            epoch: Instant::now(),
        }
    }

    pub fn set_limit(&self, limit: Option<u32>) {
        self.limit.store(limit.unwrap_or(0), Ordering::Relaxed);
    }

    /// Whether one more record fits in the current window
    #[inline]
    pub fn allow(&self) -> bool {
        let limit = self.limit.load(Ordering::Relaxed);
        if limit == 0 {
            return true;
        }
        self.allow_at(limit, self.epoch.elapsed().as_millis() as u64)
    }

    fn allow_at(&self, limit: u32, now_ms: u64) -> bool {
        let start = self.window_start_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(start) >= WINDOW_MS
            && self
                .window_start_ms
                .compare_exchange(start, now_ms, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.count.store(0, Ordering::Release);
        }
        self.count.fetch_add(1, Ordering::AcqRel) < limit
    }
}
