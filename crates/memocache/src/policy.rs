use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::validators::{EntryInfo, Params, Validator, ValidatorRegistry, parse_time_of_day};
use crate::watchdog::{SlowCallback, Watchdog};
use crate::{CacheConfig, CacheError, CacheKey};

/// The name of the validator used when a policy does not name one.
pub const DEFAULT_VALIDATOR: &str = "age";

/// Explicit validator parameters of a [`Policy`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    /// Maximum age of entries, for the `age` validator.
    ///
    /// Accepts a human readable duration such as `5m`, or an integer number of milliseconds.
    #[serde(deserialize_with = "deserialize_max_age", alias = "maxAge")]
    pub max_age: Option<Duration>,
    /// Local time of day in `HH:MM:SS` format, for the `once-a-day` validator.
    pub time: Option<String>,
    /// Parameters for custom validators.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn deserialize_max_age<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum MaxAge {
        Millis(u64),
        Human(#[serde(with = "humantime_serde")] Duration),
    }

    Ok(match Option::<MaxAge>::deserialize(deserializer)? {
        Some(MaxAge::Millis(millis)) => Some(Duration::from_millis(millis)),
        Some(MaxAge::Human(duration)) => Some(duration),
        None => None,
    })
}

/// Configuration of a cache, bound to an operation at decoration time.
///
/// A policy is either just a validator name, in which case the validator fills in default
/// parameters, or a structured configuration with explicit parameters that must match the
/// validator exactly. A policy that names no validator at all uses `age` with the configured
/// default window.
///
/// Policies deserialize from a plain string or from a map:
///
/// ```yaml
/// type: age
/// maxAge: 5s
/// ```
#[derive(Clone, Default)]
pub struct Policy {
    validator: Option<String>,
    settings: Option<PolicySettings>,
    on_slow: Option<SlowCallback>,
    name: Option<String>,
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("validator", &self.validator)
            .field("settings", &self.settings)
            .field("on_slow", &self.on_slow.is_some())
            .field("name", &self.name)
            .finish()
    }
}

impl Policy {
    /// The default policy: `age` with the configured default window.
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy selecting the validator `name` with its default parameters.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            validator: Some(name.into()),
            ..Default::default()
        }
    }

    /// A policy selecting the validator `name` with explicit parameters.
    pub fn with_settings(name: impl Into<String>, settings: PolicySettings) -> Self {
        Self {
            validator: Some(name.into()),
            settings: Some(settings),
            ..Default::default()
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.settings_mut().max_age = Some(max_age);
        self
    }

    pub fn with_time(mut self, time: impl Into<String>) -> Self {
        self.settings_mut().time = Some(time.into());
        self
    }

    /// Adds a parameter for a custom validator.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.settings_mut().extra.insert(name.into(), value.into());
        self
    }

    /// Invokes `on_slow` whenever a dispatched operation takes longer than the slow threshold.
    pub fn on_slow<F>(mut self, on_slow: F) -> Self
    where
        F: Fn(&CacheKey) + Send + Sync + 'static,
    {
        self.on_slow = Some(Arc::new(on_slow));
        self
    }

    /// Names the cache for logs and metrics.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn validator_name(&self) -> &str {
        self.validator.as_deref().unwrap_or(DEFAULT_VALIDATOR)
    }

    fn settings_mut(&mut self) -> &mut PolicySettings {
        self.settings.get_or_insert_with(Default::default)
    }

    /// Resolves the validator and checks the parameters.
    ///
    /// Parameters are only filled in with defaults unless the policy both names a validator and
    /// carries explicit settings.
    pub(crate) fn bind(
        self,
        validators: &ValidatorRegistry,
        config: &CacheConfig,
    ) -> Result<BoundPolicy, CacheError> {
        let validator_name = self.validator_name().to_owned();
        let validator = validators.resolve(&validator_name)?;

        let explicit = self.validator.is_some() && self.settings.is_some();
        let settings = self.settings.unwrap_or_default();
        let mut params = Params {
            max_age: settings.max_age,
            time: settings.time.as_deref().map(parse_time_of_day).transpose()?,
            extra: settings.extra,
        };
        if !explicit {
            validator.default_params(&mut params, config);
        }
        validator.check_params(&validator_name, &params)?;

        let watchdog = self
            .on_slow
            .map(|on_slow| Watchdog::new(config.slow_threshold, on_slow));

        Ok(BoundPolicy {
            name: self.name.unwrap_or_else(|| "unnamed".to_owned()).into(),
            validator_name,
            validator,
            params,
            watchdog,
        })
    }
}

impl From<&str> for Policy {
    fn from(name: &str) -> Self {
        Self::named(name)
    }
}

impl From<String> for Policy {
    fn from(name: String) -> Self {
        Self::named(name)
    }
}

impl<'de> Deserialize<'de> for Policy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Structured {
            #[serde(rename = "type", default)]
            validator: Option<String>,
            #[serde(default)]
            name: Option<String>,
            #[serde(flatten)]
            settings: PolicySettings,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawPolicy {
            Shorthand(String),
            Structured(Structured),
        }

        Ok(match RawPolicy::deserialize(deserializer)? {
            RawPolicy::Shorthand(name) => Policy::named(name),
            RawPolicy::Structured(structured) => Policy {
                validator: structured.validator,
                settings: Some(structured.settings),
                on_slow: None,
                name: structured.name,
            },
        })
    }
}

/// A [`Policy`] with its validator resolved and its parameters checked.
pub(crate) struct BoundPolicy {
    pub name: Arc<str>,
    pub validator_name: String,
    pub validator: Arc<dyn Validator>,
    pub params: Params,
    pub watchdog: Option<Watchdog>,
}

impl fmt::Debug for BoundPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundPolicy")
            .field("name", &self.name)
            .field("validator", &self.validator_name)
            .field("params", &self.params)
            .field("watchdog", &self.watchdog)
            .finish()
    }
}

impl BoundPolicy {
    /// Runs the validator, treating validator failures as invalid entries.
    ///
    /// Validators run while the cache store is locked. A panicking validator counts as a failure,
    /// it must not poison the store.
    pub fn is_invalid(&self, entry: &EntryInfo) -> bool {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.validator.is_invalid(entry, &self.params)
        }))
        .unwrap_or_else(|payload| {
            let message = panic_message(&*payload);
            Err(anyhow::anyhow!("validator panicked: {message}"))
        });

        match outcome {
            Ok(invalid) => invalid,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    validator = %self.validator_name,
                    cache = %self.name,
                    "Validator failed, treating entry as invalid",
                );
                metric!(counter("caches.validator.error") += 1, "cache" => &self.name);
                true
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
