//! Closed error taxonomy for the registry/dispatch/adapter path.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("missing API key for provider '{0}'")]
    MissingApiKey(String),

    #[error("missing Google Cloud project")]
    MissingProject,

    #[error("missing Google Cloud location")]
    MissingLocation,

    #[error("missing OAuth access token")]
    MissingToken,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("vendor API error: {0}")]
    ApiError(String),

    #[error("request aborted")]
    Aborted,

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Unknown(err.to_string())
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::InvalidResponse(err.to_string())
    }
}
