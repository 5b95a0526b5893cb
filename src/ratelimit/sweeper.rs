//! Background eviction of idle buckets.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::limiter::RateLimiter;

/// Periodically removes buckets that have been idle past the retention
/// window.
///
/// The window is read from `retention` on every sweep, so it can follow
/// rule reloads.
///
/// The task stops when [`Sweeper::shutdown`] is called or the sweeper is
/// dropped.
pub struct Sweeper {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    /// Spawn the sweep loop on the current tokio runtime.
    pub fn spawn<F>(limiter: Arc<RateLimiter>, interval: Duration, retention: F) -> Self
    where
        F: Fn() -> Duration + Send + 'static,
    {
        info!(
            interval_ms = interval.as_millis() as u64,
            "Starting bucket sweeper"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let window = retention();
                let removed = limiter.evict_idle(window);
                if removed > 0 {
                    debug!(
                        removed = removed,
                        remaining = limiter.bucket_count(),
                        retention_secs = window.as_secs(),
                        "Evicted idle buckets"
                    );
                }
            }
        });

        Self {
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stop the sweep loop. Calling this more than once is harmless.
    pub fn shutdown(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
            info!("Bucket sweeper stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}
