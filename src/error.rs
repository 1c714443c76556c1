use crate::config::ConfigError;
use crate::model::LinkStep;
use thiserror::Error;

pub type Result<T, E = WingsError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum WingsError {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid stored settings: {0}")]
    Settings(#[from] serde_json::Error),
    #[error("endpoint id {0} registered twice")]
    DuplicateEndpointId(i32),
    #[error("endpoint {0} is not registered")]
    EndpointNotRegistered(String),
    #[error("endpoint {0} is already linked; unlink it first")]
    AlreadyLinked(String),
}

/// Failure of a link flow. Always resets the endpoint to unlinked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("no link request is in progress")]
    NoLinkInProgress,
    #[error("unexpected link step {got}, expected {expected}")]
    StepMismatch { expected: LinkStep, got: LinkStep },
    #[error("linking was denied: {0}")]
    Denied(String),
    #[error("linking did not provide {0}")]
    Incomplete(&'static str),
    #[error("destination {0} does not belong to this endpoint")]
    UnknownDestination(i32),
}

impl LinkError {
    /// Message shown to the user by a presentation layer.
    pub fn user_message(&self) -> &'static str {
        match self {
            LinkError::Denied(_) => "Linking was cancelled or denied. Please try again.",
            _ => "Something went wrong while linking your account. Please try again.",
        }
    }
}
