//! Error types for operation construction and definition assembly.

use thiserror::Error;

/// Boxed error carried across the resolver seam.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by operation constructors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Empty image reference passed to an image source.
    #[error("empty image reference")]
    EmptyReference,

    /// A reference that does not parse as a container image name.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// A local-context name outside the allowed grammar.
    #[error("invalid local source name '{name}': {reason}")]
    InvalidLocalName { name: String, reason: String },

    /// A git remote with an unsupported scheme or missing host.
    #[error("invalid git url '{url}': {reason}")]
    InvalidGitUrl { url: String, reason: String },

    /// An http source with an unsupported scheme or missing host.
    #[error("invalid http url '{url}': {reason}")]
    InvalidHttpUrl { url: String, reason: String },

    /// Basic-auth usernames are joined with ':' on the wire and so must
    /// not contain one.
    #[error("http basic-auth username must not contain ':'")]
    InvalidBasicAuthUser,

    /// Exec with no command.
    #[error("empty command for exec operation")]
    EmptyCommand,

    /// A file action with an empty path argument.
    #[error("file {action}: empty {field}")]
    EmptyPath {
        action: &'static str,
        field: &'static str,
    },

    /// Merge needs at least two filesystems to union.
    #[error("merge requires at least 2 inputs, got {count}")]
    MergeTooFewInputs { count: usize },

    /// Diff needs both sides.
    #[error("diff requires both a lower and an upper state")]
    DiffMissingInput,
}

pub type ValidationResult<T> = std::result::Result<T, ValidationError>;

/// Errors produced while assembling a definition.
#[derive(Debug, Error)]
pub enum SerializeError {
    /// Image-config resolution failed for a source node.
    #[error("resolve image config for {reference}: {source}")]
    Resolve {
        reference: String,
        #[source]
        source: BoxError,
    },

    /// The exported image config could not be JSON-encoded.
    #[error("encode image config: {0}")]
    ConfigJson(#[from] serde_json::Error),
}

pub type SerializeResult<T> = std::result::Result<T, SerializeError>;
