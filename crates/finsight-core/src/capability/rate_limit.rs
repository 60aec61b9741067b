use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::debug;

/// Minimum spacing between calls to the same external service.
///
/// Each service gets its own async lock so that a slow data source never
/// delays calls to an unrelated one. Services without an interval are not
/// limited.
#[derive(Debug, Default)]
pub struct RateLimiter {
    intervals: DashMap<String, Duration>,
    last_call: DashMap<String, Arc<Mutex<Option<Instant>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seconds<'a>(limits: impl IntoIterator<Item = (&'a String, &'a f64)>) -> Self {
        let limiter = Self::new();
        for (service, seconds) in limits {
            limiter.set_interval(service, Duration::from_secs_f64(seconds.max(0.0)));
        }
        limiter
    }

    /// Adjust a service interval while runs are in flight.
    pub fn set_interval(&self, service: &str, interval: Duration) {
        self.intervals.insert(service.to_string(), interval);
    }

    pub fn interval(&self, service: &str) -> Option<Duration> {
        self.intervals.get(service).map(|entry| *entry.value())
    }

    /// Wait until `service` may be called again and record the call.
    pub async fn acquire(&self, service: &str) {
        let Some(interval) = self.interval(service).filter(|value| !value.is_zero()) else {
            return;
        };

        let slot = self
            .last_call
            .entry(service.to_string())
            .or_default()
            .value()
            .clone();
        let mut last = slot.lock().await;
        if let Some(previous) = *last {
            let wait = interval.saturating_sub(previous.elapsed());
            if !wait.is_zero() {
                debug!(service, wait_ms = wait.as_millis() as u64, "rate limiting service call");
                sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }
}
