use config::ConfigError;
use reqwest::{Method, StatusCode};
use thiserror::Error;

use crate::digest::OciDigest;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Invalid response code for {method} {url}, expected: {expected}, got: {got}, {body}")]
    UnexpectedStatus {
        method: Method,
        url: String,
        expected: StatusCode,
        got: StatusCode,
        body: String,
    },

    #[error("{subject} {field} mismatch; expected: {expected}, got: {got}")]
    Integrity {
        subject: String,
        field: &'static str,
        expected: String,
        got: String,
    },

    #[error("Duplicate referrer result detected: {0}")]
    DuplicateReferrer(OciDigest),

    #[error("Referrers mismatch: {0}")]
    ReferrersMismatch(String),

    #[error("{method} {url} failed: {message}")]
    Transport {
        method: Method,
        url: String,
        message: String,
    },

    #[error("Failed to resolve {host}: {message}")]
    Resolve { host: String, message: String },

    #[error("No {header} header in response to {url}")]
    MissingHeader { header: &'static str, url: String },

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{step}: {source}")]
    Step {
        step: &'static str,
        source: Box<RegistryError>,
    },
}

impl RegistryError {
    /// Attach the name of the check step that produced this error.
    pub fn in_step(self, step: &'static str) -> Self {
        RegistryError::Step {
            step,
            source: Box::new(self),
        }
    }

    /// The innermost error, with all step context removed.
    pub fn root(&self) -> &RegistryError {
        match self {
            RegistryError::Step { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

impl From<ConfigError> for RegistryError {
    fn from(err: ConfigError) -> Self {
        RegistryError::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_unwraps_nested_steps() {
        let err = RegistryError::ReferrersMismatch("count".to_string())
            .in_step("verify referrers")
            .in_step("check referrers");

        assert!(matches!(err.root(), RegistryError::ReferrersMismatch(_)));
        assert_eq!(
            err.to_string(),
            "check referrers: verify referrers: Referrers mismatch: count"
        );
    }
}
