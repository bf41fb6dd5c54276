use thiserror::Error;

/// Errors surfaced by the UserOperation pipeline.
///
/// Each variant names the field or collaborator involved so callers can decide
/// whether to retry, fall back or abort.
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("cannot resolve counterfactual address: {0}")]
    Resolution(String),

    #[error("gas estimation failed for {field}: {reason}")]
    GasEstimation { field: &'static str, reason: String },

    #[error("cannot decode account call data: {0}")]
    CallDataDecode(String),

    #[error("{0} validation module is not configured")]
    ModuleNotConfigured(&'static str),

    #[error("cannot build a user operation from an empty call batch")]
    EmptyBatch,

    #[error("user operation is missing required field `{0}`")]
    IncompleteOperation(&'static str),

    #[error("paymaster sponsorship failed ({method}): {reason}")]
    Sponsorship { method: &'static str, reason: String },

    #[error("session key is not permitted: {0}")]
    SessionPermission(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("chain query `{method}` failed: {reason}")]
    Chain { method: &'static str, reason: String },

    #[error("bundler `{method}` failed: {reason}")]
    Bundler { method: &'static str, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = AccountError> = std::result::Result<T, E>;

impl AccountError {
    pub(crate) fn chain(method: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Chain {
            method,
            reason: format!("{err:#}"),
        }
    }

    pub(crate) fn gas(field: &'static str, reason: impl std::fmt::Display) -> Self {
        Self::GasEstimation {
            field,
            reason: format!("{reason:#}"),
        }
    }

    pub(crate) fn sponsorship(method: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Sponsorship {
            method,
            reason: format!("{err:#}"),
        }
    }

    pub(crate) fn signing(err: impl std::fmt::Display) -> Self {
        Self::Signing(format!("{err:#}"))
    }
}
