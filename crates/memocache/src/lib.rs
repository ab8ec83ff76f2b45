//! Memoization for async operations.
//!
//! A [`Memoizer`] turns an async operation into a cached one. Each call derives a [`CacheKey`]
//! from its arguments and is then either served from the cache, attached to an identical call
//! that is still in flight, or dispatched to the operation. Whether a cached value may still be
//! used is decided by the validator named in the [`Policy`]:
//!
//! - `forever`: values never expire.
//! - `age`: values expire after `max_age` (default 5 minutes).
//! - `once-a-day`: values expire when the local time of day `time` passes.
//!
//! Further validators can be registered by name. Failed operations are never cached, and an
//! optional slow callback reports operations that take longer than a configured threshold.
//!
//! ```no_run
//! # async fn fetch_user(id: u32) -> Result<String, std::io::Error> { Ok(id.to_string()) }
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use std::time::Duration;
//!
//! let memoizer = memocache::Memoizer::default();
//! let fetch_user = memoizer
//!     .cache(memocache::Policy::named("age").with_max_age(Duration::from_secs(30)))?
//!     .wrap(fetch_user);
//!
//! let user = fetch_user.call(42).await?;
//! memoizer.invalidate_all();
//! # Ok(())
//! # }
//! ```
//!
//! For convenience, a process-wide memoizer is available through [`global`] and the free
//! functions [`cache`], [`register_validator`] and [`invalidate_all`]. Applications embedding
//! the caches usually call [`setup`] once at startup.

use std::sync::OnceLock;

#[macro_use]
pub mod metrics;

mod cache_key;
pub mod config;
mod error;
pub mod logging;
mod memoizer;
mod policy;
mod registry;
mod store;
mod utils;
pub mod validators;
mod watchdog;

pub use cache_key::{CacheKey, CacheKeyBuilder};
pub use config::{CacheConfig, Config};
pub use error::CacheError;
pub use memoizer::{CachedFn, Decorator, Memoizer};
pub use policy::{DEFAULT_VALIDATOR, Policy, PolicySettings};
pub use registry::{CacheRegistry, ClearCache};
pub use store::{CacheStats, CacheStore, ComputationResult};
pub use validators::{EntryInfo, Params, Validator, ValidatorRegistry};
pub use watchdog::{SlowCallback, Watchdog};

static GLOBAL: OnceLock<Memoizer> = OnceLock::new();

/// Initializes the process-wide memoizer with the given defaults.
///
/// This must happen before the first use of [`global`], otherwise it fails with
/// [`CacheError::AlreadyInitialized`].
pub fn init(config: CacheConfig) -> Result<(), CacheError> {
    GLOBAL
        .set(Memoizer::new(config))
        .map_err(|_| CacheError::AlreadyInitialized)
}

/// Configures logging, metrics and the process-wide memoizer from `config`.
pub fn setup(config: &Config) -> anyhow::Result<()> {
    logging::init_logging(config);

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd,
            config.metrics.custom_tags.clone(),
        )?;
    }

    init(config.caches)?;
    Ok(())
}

/// The process-wide memoizer, initialized with default settings on first use.
pub fn global() -> &'static Memoizer {
    GLOBAL.get_or_init(Memoizer::default)
}

/// Creates a decorator on the process-wide memoizer.
pub fn cache(policy: impl Into<Policy>) -> Result<Decorator, CacheError> {
    global().cache(policy)
}

/// Registers a validator on the process-wide memoizer.
pub fn register_validator<F>(name: impl Into<String>, predicate: F) -> Result<(), CacheError>
where
    F: Fn(&EntryInfo, &Params) -> bool + Send + Sync + 'static,
{
    global().register_validator(name, predicate)
}

/// Clears all caches created through the process-wide memoizer.
pub fn invalidate_all() {
    global().invalidate_all()
}
