use thiserror::Error;

/// An error that happens while configuring a cache or deriving a cache key.
///
/// Errors of the wrapped operations themselves never show up here, they are passed through to
/// the callers unchanged.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The policy names a validator that was never registered.
    #[error("unknown validator `{0}`")]
    UnknownValidator(String),
    /// Validators cannot be registered under an empty name.
    #[error("validator name must not be empty")]
    EmptyValidatorName,
    /// The validator requires a parameter that the policy does not provide.
    #[error("validator `{validator}` requires parameter `{param}`")]
    MissingParameter {
        validator: String,
        param: &'static str,
    },
    /// The policy provides a parameter that the validator does not understand.
    #[error("validator `{validator}` does not accept parameter `{param}`")]
    UnexpectedParameter { validator: String, param: String },
    /// The time of day for the `once-a-day` validator could not be parsed.
    #[error("invalid time of day `{0}`, expected HH:MM:SS")]
    InvalidTime(String),
    /// The call arguments could not be serialized into a cache key.
    #[error("failed to derive cache key")]
    Key(#[from] serde_json::Error),
    /// The process-wide memoizer was already initialized.
    #[error("global memoizer is already initialized")]
    AlreadyInitialized,
}

impl From<CacheError> for std::io::Error {
    fn from(err: CacheError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, err)
    }
}
