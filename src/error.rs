//! Error types for the egress runtime.

use thiserror::Error;

/// Main error type for the egress runtime.
#[derive(Error, Debug)]
pub enum EgressError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Profile error: {0}")]
    Profile(#[from] ProfileError),

    #[error("No environment provisioned for '{0}'")]
    UnknownEnvironment(String),

    #[error("Invalid environment id '{id}': {reason}")]
    InvalidEnvironmentId { id: String, reason: String },

    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("DNS sidecar '{name}' did not become ready after {attempts} attempts")]
    SidecarStartTimeout { name: String, attempts: u32 },

    #[error("Docker API error: {0}")]
    Backend(String),

    #[error("Docker connection error: {0}")]
    BackendConnection(String),

    #[error("State error: {0}")]
    State(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid domain pattern '{pattern}': {reason}")]
    InvalidDomainPattern { pattern: String, reason: String },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Profile loading and validation errors.
#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Unknown profile: {0}")]
    NotFound(String),

    #[error("Invalid profile '{name}': {reason}")]
    Invalid { name: String, reason: String },

    #[error("Failed to read profile '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, EgressError>;
