use anyhow::Context;
use chrono::{Local, NaiveDateTime, NaiveTime};

use super::{EntryInfo, Params, Validator};
use crate::{CacheConfig, CacheError};

/// The validators every registry starts out with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinValidator {
    /// Entries never become invalid.
    Forever,
    /// Entries become invalid once they are older than `max_age`.
    Age,
    /// Entries become invalid once the local time of day `time` has passed since their creation.
    OnceADay,
}

impl BuiltinValidator {
    pub const ALL: &'static [Self] = &[Self::Forever, Self::Age, Self::OnceADay];

    /// The name the validator is registered under.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Forever => "forever",
            Self::Age => "age",
            Self::OnceADay => "once-a-day",
        }
    }

    /// Which of the `(max_age, time)` parameters this validator requires.
    fn required_params(&self) -> (bool, bool) {
        match self {
            Self::Forever => (false, false),
            Self::Age => (true, false),
            Self::OnceADay => (false, true),
        }
    }
}

impl Validator for BuiltinValidator {
    fn is_invalid(&self, entry: &EntryInfo, params: &Params) -> anyhow::Result<bool> {
        match self {
            Self::Forever => Ok(false),
            Self::Age => {
                let max_age = params.max_age.context("`max_age` is not set")?;
                Ok(entry.created_at().elapsed() > max_age)
            }
            Self::OnceADay => {
                let time = params.time.context("`time` is not set")?;
                let created = entry.created_wall().naive_local();
                let now = Local::now().naive_local();
                Ok(time_of_day_passed(created, now, time))
            }
        }
    }

    fn check_params(&self, name: &str, params: &Params) -> Result<(), CacheError> {
        let (needs_max_age, needs_time) = self.required_params();
        check_param(name, "max_age", params.max_age.is_some(), needs_max_age)?;
        check_param(name, "time", params.time.is_some(), needs_time)?;

        match params.extra.keys().next() {
            Some(param) => Err(CacheError::UnexpectedParameter {
                validator: name.to_owned(),
                param: param.clone(),
            }),
            None => Ok(()),
        }
    }

    fn default_params(&self, params: &mut Params, config: &CacheConfig) {
        match self {
            Self::Forever => {}
            Self::Age => {
                params.max_age.get_or_insert(config.default_max_age);
            }
            Self::OnceADay => {
                params.time.get_or_insert(NaiveTime::MIN);
            }
        }
    }
}

fn check_param(
    validator: &str,
    param: &'static str,
    present: bool,
    required: bool,
) -> Result<(), CacheError> {
    match (present, required) {
        (false, true) => Err(CacheError::MissingParameter {
            validator: validator.to_owned(),
            param,
        }),
        (true, false) => Err(CacheError::UnexpectedParameter {
            validator: validator.to_owned(),
            param: param.to_owned(),
        }),
        _ => Ok(()),
    }
}

/// Parses a time of day in `HH:MM:SS` or `HH:MM` format.
///
/// Components do not need to be zero-padded, so `9:5:0` is accepted as well.
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime, CacheError> {
    let invalid = || CacheError::InvalidTime(value.to_owned());

    let mut parts = [0u32; 3];
    let mut count = 0;
    for part in value.trim().split(':') {
        let slot = parts.get_mut(count).ok_or_else(invalid)?;
        *slot = part.parse().map_err(|_| invalid())?;
        count += 1;
    }
    if count < 2 {
        return Err(invalid());
    }

    let [hour, min, sec] = parts;
    NaiveTime::from_hms_opt(hour, min, sec).ok_or_else(invalid)
}

/// Checks whether the most recent occurrence of `time` lies after `created`.
///
/// The most recent occurrence is today's if `now` is at or after it, and yesterday's otherwise.
pub fn time_of_day_passed(created: NaiveDateTime, now: NaiveDateTime, time: NaiveTime) -> bool {
    let today = now.date().and_time(time);
    let last = if now >= today {
        today
    } else {
        today - chrono::Duration::days(1)
    };
    created < last
}
