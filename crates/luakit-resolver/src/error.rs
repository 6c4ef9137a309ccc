//! Error types for registry resolution.

use thiserror::Error;

/// Errors produced while resolving an image config.
///
/// `Clone` so cache entries can hold failures and replay them verbatim
/// without hammering the registry again.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The reference does not parse as an image name.
    #[error("parse reference '{reference}': {reason}")]
    Reference { reference: String, reason: String },

    /// Network failure or non-success status from the registry.
    #[error("registry request for {reference}: {message}")]
    Http { reference: String, message: String },

    /// Token endpoint failure during a bearer challenge.
    #[error("authorize against {registry}: {message}")]
    Auth { registry: String, message: String },

    /// The manifest body did not decode.
    #[error("decode manifest for {reference}: {message}")]
    Manifest { reference: String, message: String },

    /// An image index with no entry for the requested platform.
    #[error("no manifest for platform {platform} in {reference}")]
    NoMatchingPlatform { reference: String, platform: String },

    /// The config blob did not decode as an OCI image configuration.
    #[error("decode image config for {reference}: {message}")]
    Config { reference: String, message: String },
}

pub type ResolveResult<T> = std::result::Result<T, ResolveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_name_the_reference() {
        let err = ResolveError::NoMatchingPlatform {
            reference: "docker.io/library/alpine:latest".to_string(),
            platform: "linux/s390x".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("alpine"));
        assert!(msg.contains("linux/s390x"));
    }

    #[test]
    fn errors_clone_for_cache_replay() {
        let err = ResolveError::Http {
            reference: "r".to_string(),
            message: "connection refused".to_string(),
        };
        assert_eq!(err.clone(), err);
    }
}
