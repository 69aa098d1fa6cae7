//! Error types for the OpenStack-style control-plane client.

use thiserror::Error;

use crate::compute::SpecError;
use crate::config::ConfigError;

/// Errors raised by the control-plane client.
#[derive(Debug, Error)]
pub enum OpenStackError {
    /// Raised when the high-level configuration is incomplete.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when an instance spec fails validation.
    #[error("invalid instance spec: {0}")]
    Validation(String),
    /// Non-success HTTP response, carrying the status and the decoded error
    /// body returned by the control plane.
    #[error("API error {status}: {body}")]
    Api {
        /// HTTP status code of the failed response.
        status: u16,
        /// Decoded error body (raw text wrapped in a JSON string when the
        /// body is not valid JSON).
        body: serde_json::Value,
    },
    /// Raised when the request never produced an HTTP response.
    #[error("transport error: {message}")]
    Transport {
        /// Human readable description from the HTTP client.
        message: String,
    },
    /// Raised when the service catalog has no endpoint for the requested
    /// service type in the configured region.
    #[error("service catalog has no '{service}' endpoint for this region")]
    MissingService {
        /// Service type that could not be resolved (for example `compute`).
        service: String,
    },
    /// Raised when an operation targets an instance that does not exist.
    #[error("instance '{name}' not found")]
    NotFound {
        /// Instance name that failed to resolve.
        name: String,
    },
    /// Raised when an image label does not resolve to a provider identifier.
    #[error("image '{name}' not found in the image catalog")]
    UnknownImage {
        /// Image label passed by the caller.
        name: String,
    },
    /// Raised when a flavor label does not resolve to a provider identifier.
    #[error("flavor '{name}' not found in the flavor catalog")]
    UnknownFlavor {
        /// Flavor label passed by the caller.
        name: String,
    },
    /// Raised when an instance exists but carries no image reference to
    /// rebuild from.
    #[error("instance '{name}' has no image reference to rebuild from")]
    MissingImageRef {
        /// Instance whose detail lacked an image reference.
        name: String,
    },
}

impl From<reqwest::Error> for OpenStackError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport {
            message: value.to_string(),
        }
    }
}

impl From<ConfigError> for OpenStackError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<SpecError> for OpenStackError {
    fn from(value: SpecError) -> Self {
        Self::Validation(value.to_string())
    }
}
