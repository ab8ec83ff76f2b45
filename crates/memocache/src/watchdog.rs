use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::CacheKey;

/// Callback invoked when a dispatched operation is slow to settle.
pub type SlowCallback = Arc<dyn Fn(&CacheKey) + Send + Sync>;

/// Reports operations that take longer than a threshold to settle.
///
/// The watchdog only observes: it never cancels the watched future and does not change its
/// output.
#[derive(Clone)]
pub struct Watchdog {
    threshold: Duration,
    on_slow: SlowCallback,
}

impl fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watchdog")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl Watchdog {
    pub fn new(threshold: Duration, on_slow: SlowCallback) -> Self {
        Self { threshold, on_slow }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Drives `future` to completion, invoking the slow callback once if it is still pending
    /// after the threshold.
    ///
    /// The timer is dropped together with the watched future as soon as it settles.
    pub async fn watch<F: Future>(&self, key: &CacheKey, future: F) -> F::Output {
        let mut future = std::pin::pin!(future);

        match tokio::time::timeout(self.threshold, future.as_mut()).await {
            Ok(output) => output,
            Err(_elapsed) => {
                tracing::warn!(
                    key = %key,
                    threshold = ?self.threshold,
                    "Computation is taking longer than expected",
                );
                (self.on_slow)(key);
                future.await
            }
        }
    }
}
