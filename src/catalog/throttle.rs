// src/catalog/throttle.rs

//! Upstream call spacing
//!
//! The catalog service rate-limits aggressively, so every upstream call waits
//! on an injected [`Throttle`]. The default enforces a fixed minimum gap
//! between calls; tests inject [`NoThrottle`] or a millisecond interval.

use super::{Catalog, TitleMetadata};
use crate::error::Result;
use crate::model::TitleId;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Default spacing between catalog calls
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Rate limiter port
#[async_trait]
pub trait Throttle: Send + Sync {
    /// Wait until the next call is allowed
    async fn acquire(&self);
}

/// Enforces a minimum interval between successive calls
#[derive(Debug)]
pub struct MinIntervalThrottle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl MinIntervalThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Default for MinIntervalThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_INTERVAL)
    }
}

#[async_trait]
impl Throttle for MinIntervalThrottle {
    async fn acquire(&self) {
        // Held across the sleep so concurrent callers queue up in order
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.interval;
            if ready_at > Instant::now() {
                debug!("Throttling catalog call for {:?}", ready_at - Instant::now());
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Throttle that never waits
#[derive(Debug, Default, Clone, Copy)]
pub struct NoThrottle;

#[async_trait]
impl Throttle for NoThrottle {
    async fn acquire(&self) {}
}

/// Catalog decorator that passes every call through a throttle
pub struct ThrottledCatalog {
    inner: Arc<dyn Catalog>,
    throttle: Arc<dyn Throttle>,
}

impl ThrottledCatalog {
    pub fn new(inner: Arc<dyn Catalog>, throttle: Arc<dyn Throttle>) -> Self {
        Self { inner, throttle }
    }
}

#[async_trait]
impl Catalog for ThrottledCatalog {
    async fn get_title_metadata(&self, title_id: &TitleId) -> Result<Option<TitleMetadata>> {
        self.throttle.acquire().await;
        self.inner.get_title_metadata(title_id).await
    }
}
