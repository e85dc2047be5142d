//! Operator error abstractions.

use thiserror::Error;

/// A result type where the error is an `AppError`.
pub type AppResult<T> = ::std::result::Result<T, AppError>;

/// Application error variants.
///
/// These variants drive retry classification throughout the operator, so callers should match on
/// them rather than on error strings.
#[derive(Debug, Error)]
pub enum AppError {
    /// A write was rejected because the stored record has a newer version.
    #[error("the record was modified concurrently, a newer version exists")]
    Conflict,
    /// The target resource does not exist.
    #[error("the requested resource was not found")]
    ResourceNotFound,
    /// The credentials used by a client were rejected.
    #[error("unauthorized to perform the requested action")]
    Unauthorized,
    /// The given input was invalid.
    #[error("validation error: {0}")]
    InvalidInput(String),
    /// A persisted action has a type which this build does not know how to run.
    #[error("unsupported action type in plan: {0}")]
    UnknownAction(String),
    /// A conflicting write kept recurring until the attempt budget was spent.
    #[error("update abandoned after {0} conflicting attempts")]
    RetriesExhausted(usize),
    /// An outbound call did not finish in time.
    #[error("timeout while {0}")]
    Timeout(&'static str),
    /// The operator has hit an internal error, but will remain online.
    #[error("internal error: {0:#}")]
    Ise(anyhow::Error),
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<AppError>() {
            Ok(app_err) => app_err,
            Err(err) => Self::Ise(err),
        }
    }
}
