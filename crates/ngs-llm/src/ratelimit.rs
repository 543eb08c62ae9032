use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tokio::time::{sleep, Duration, Instant};

/// Requests-per-minute bucket plus an in-flight cap. Surplus work blocks
/// until a slot frees up; nothing is dropped.
pub struct RateLimiter {
    window: Mutex<VecDeque<Instant>>,
    rpm: usize,
    concurrency: Arc<Semaphore>,
}

impl RateLimiter {
    pub fn new(rpm: usize, max_in_flight: usize) -> Self {
        Self {
            window: Mutex::new(VecDeque::new()),
            rpm: rpm.max(1),
            concurrency: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    /// Wait for both a rate slot and a concurrency permit. The permit is
    /// held for the duration of the request.
    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        loop {
            let wait = {
                let mut window = self.window.lock().await;
                let now = Instant::now();
                while let Some(front) = window.front() {
                    if now.duration_since(*front) >= Duration::from_secs(60) {
                        window.pop_front();
                    } else {
                        break;
                    }
                }
                if window.len() < self.rpm {
                    window.push_back(now);
                    None
                } else {
                    // Sleep until the oldest entry ages out of the window.
                    let oldest = *window.front().expect("window non-empty");
                    Some(Duration::from_secs(60).saturating_sub(now.duration_since(oldest)))
                }
            };

            match wait {
                None => break,
                Some(d) => sleep(d.max(Duration::from_millis(50))).await,
            }
        }

        self.concurrency
            .acquire()
            .await
            .expect("rate limiter semaphore never closes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_under_limit_is_immediate() {
        let limiter = RateLimiter::new(10, 2);
        let start = Instant::now();
        let _p1 = limiter.acquire().await;
        drop(_p1);
        let _p2 = limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_blocks_when_window_is_full() {
        let limiter = RateLimiter::new(2, 4);
        let _a = limiter.acquire().await;
        let _b = limiter.acquire().await;

        let start = Instant::now();
        let _c = limiter.acquire().await;
        // With the window full, the third acquire must wait for the
        // 60-second window to open up (auto-advanced under paused time).
        assert!(start.elapsed() >= Duration::from_secs(59));
    }
}
