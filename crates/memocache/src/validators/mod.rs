//! Validators decide whether a settled cache entry is still usable.
//!
//! Every [`Policy`](crate::Policy) names a validator. The built-in ones are `forever`, `age`
//! and `once-a-day` (see [`BuiltinValidator`]). Additional validators can be registered under
//! any name on a [`ValidatorRegistry`], either as closures or as types implementing
//! [`Validator`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveTime};
use serde_json::Value;
use tokio::time::Instant;

use crate::{CacheConfig, CacheError, CacheKey};

mod builtin;

pub use builtin::*;

/// Read-only view on a cache entry, handed to validators.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    key: CacheKey,
    created_at: Instant,
    created_wall: DateTime<Local>,
}

impl EntryInfo {
    /// Creates the info for an entry created right now.
    pub fn new(key: CacheKey) -> Self {
        Self::with_timestamps(key, Instant::now(), Local::now())
    }

    /// Creates the info for an entry with explicit creation timestamps.
    pub fn with_timestamps(key: CacheKey, created_at: Instant, created_wall: DateTime<Local>) -> Self {
        Self {
            key,
            created_at,
            created_wall,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Monotonic creation time, used for age computations.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Wall-clock creation time in the local timezone, used for time-of-day computations.
    pub fn created_wall(&self) -> DateTime<Local> {
        self.created_wall
    }

    /// Resets both creation timestamps to now.
    pub(crate) fn touch(&mut self) {
        self.created_at = Instant::now();
        self.created_wall = Local::now();
    }
}

/// Parameters of a policy, as passed to its validator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    /// Maximum age of an entry, used by `age`.
    pub max_age: Option<Duration>,
    /// Local time of day at which entries expire, used by `once-a-day`.
    pub time: Option<NaiveTime>,
    /// Any other parameters, for custom validators.
    pub extra: BTreeMap<String, Value>,
}

impl Params {
    /// Returns a custom parameter by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.extra.get(name)
    }
}

/// Decides whether a settled cache entry is invalid.
///
/// Validators are evaluated while the cache store is locked, so they must be quick and must not
/// call into the cache they are validating.
pub trait Validator: Send + Sync + 'static {
    /// Returns `true` if `entry` is invalid and the call should be treated as a miss.
    ///
    /// An `Err` is treated as a miss as well, and logged.
    fn is_invalid(&self, entry: &EntryInfo, params: &Params) -> anyhow::Result<bool>;

    /// Checks the policy parameters when a policy is bound at decoration time.
    fn check_params(&self, _name: &str, _params: &Params) -> Result<(), CacheError> {
        Ok(())
    }

    /// Fills in defaults for a policy given only by name.
    fn default_params(&self, _params: &mut Params, _config: &CacheConfig) {}
}

/// A [`Validator`] backed by a plain predicate.
struct FnValidator<F>(F);

impl<F> Validator for FnValidator<F>
where
    F: Fn(&EntryInfo, &Params) -> bool + Send + Sync + 'static,
{
    fn is_invalid(&self, entry: &EntryInfo, params: &Params) -> anyhow::Result<bool> {
        Ok((self.0)(entry, params))
    }
}

/// Maps validator names to validators.
///
/// A fresh registry contains all the [`BuiltinValidator`]s.
pub struct ValidatorRegistry {
    validators: RwLock<BTreeMap<String, Arc<dyn Validator>>>,
}

impl fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatorRegistry")
            .field("validators", &self.names())
            .finish()
    }
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        let validators = BuiltinValidator::ALL
            .iter()
            .map(|builtin| {
                let validator: Arc<dyn Validator> = Arc::new(*builtin);
                (builtin.name().to_owned(), validator)
            })
            .collect();

        Self {
            validators: RwLock::new(validators),
        }
    }
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a predicate under `name`, replacing any previous validator of that name.
    ///
    /// The predicate returns `true` if an entry is invalid.
    pub fn register_fn<F>(&self, name: impl Into<String>, predicate: F) -> Result<(), CacheError>
    where
        F: Fn(&EntryInfo, &Params) -> bool + Send + Sync + 'static,
    {
        self.register(name, FnValidator(predicate))
    }

    /// Installs a validator under `name`, replacing any previous validator of that name.
    ///
    /// Overwriting a built-in validator is allowed. Policies that were already bound keep the
    /// validator they resolved.
    pub fn register<V: Validator>(
        &self,
        name: impl Into<String>,
        validator: V,
    ) -> Result<(), CacheError> {
        let name = name.into();
        if name.is_empty() {
            return Err(CacheError::EmptyValidatorName);
        }

        tracing::debug!(validator = %name, "Registering validator");
        let previous = self
            .validators
            .write()
            .unwrap()
            .insert(name.clone(), Arc::new(validator));
        if previous.is_some() {
            tracing::debug!(validator = %name, "Replaced existing validator");
        }
        Ok(())
    }

    /// Looks up the validator registered under `name`.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Validator>, CacheError> {
        self.validators
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::UnknownValidator(name.to_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.validators.read().unwrap().contains_key(name)
    }

    /// Returns the names of all registered validators in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.validators.read().unwrap().keys().cloned().collect()
    }
}
