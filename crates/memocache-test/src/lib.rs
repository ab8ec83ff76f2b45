//! Helpers for testing the caches.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Most tests should run with paused time (`#[tokio::test(start_paused = true)]`). The stub
//!    operations in this crate sleep on the tokio timer, so their latency is deterministic and
//!    tests do not actually wait.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `memocache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("memocache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Arguments of the [`Deferred`] stub operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sum {
    pub a: u64,
    pub b: u64,
}

impl Sum {
    pub fn new(a: u64, b: u64) -> Self {
        Self { a, b }
    }
}

/// A stub for a slow operation.
///
/// Every invocation is counted and settles after a fixed delay. Clones share their call counter.
#[derive(Debug, Clone)]
pub struct Deferred {
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl Deferred {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: Default::default(),
        }
    }

    /// The number of times any of the operations was invoked.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Resolves to `a + b` after the delay.
    pub fn sum(&self, args: Sum) -> impl Future<Output = Result<u64, std::io::Error>> + Send + use<> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let delay = self.delay;
        async move {
            tokio::time::sleep(delay).await;
            Ok(args.a + args.b)
        }
    }

    /// Rejects after the delay.
    pub fn reject(&self, args: Sum) -> impl Future<Output = Result<u64, std::io::Error>> + Send + use<> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let delay = self.delay;
        async move {
            tokio::time::sleep(delay).await;
            Err(std::io::Error::other(format!("refusing to add {} and {}", args.a, args.b)))
        }
    }
}

/// Counts invocations of a callback, such as the slow callback of a policy.
#[derive(Debug, Clone, Default)]
pub struct CallCounter(Arc<AtomicUsize>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a single call.
    pub fn hit(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}
