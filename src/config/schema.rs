//! Runtime settings schema and domain pattern helpers.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, EgressError};

/// Default image for the DNS-filtering sidecar container.
pub const DEFAULT_SIDECAR_IMAGE: &str = "andyshinn/dnsmasq:2.78";

/// DNS sidecar settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarSettings {
    /// Container image to run as the filtering resolver.
    #[serde(default = "default_sidecar_image")]
    pub image: String,

    /// Upstream resolvers used for allowed domains.
    #[serde(default = "default_upstreams")]
    pub upstreams: Vec<String>,

    /// Readiness poll attempts before giving up.
    #[serde(default = "default_readiness_attempts")]
    pub readiness_attempts: u32,

    /// Base backoff between readiness polls, in milliseconds (doubles per attempt).
    #[serde(default = "default_readiness_backoff_ms")]
    pub readiness_backoff_ms: u64,
}

fn default_sidecar_image() -> String {
    DEFAULT_SIDECAR_IMAGE.to_string()
}

fn default_upstreams() -> Vec<String> {
    vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()]
}

fn default_readiness_attempts() -> u32 {
    10
}

fn default_readiness_backoff_ms() -> u64 {
    250
}

impl Default for SidecarSettings {
    fn default() -> Self {
        Self {
            image: default_sidecar_image(),
            upstreams: default_upstreams(),
            readiness_attempts: default_readiness_attempts(),
            readiness_backoff_ms: default_readiness_backoff_ms(),
        }
    }
}

/// Per-environment network settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSettings {
    /// Disable inter-container communication on created networks.
    /// Falls back to a regular bridge (with a warning) if the host rejects it.
    #[serde(default = "default_true")]
    pub disable_icc: bool,
}

fn default_true() -> bool {
    true
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self { disable_icc: true }
    }
}

/// Main egress runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EgressSettings {
    /// Root directory for persisted per-environment state (default: ~/.ert).
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Directory holding file-backed profile templates (default: <data_dir>/profiles).
    #[serde(default)]
    pub profiles_dir: Option<PathBuf>,

    /// Sidecar settings.
    #[serde(default)]
    pub sidecar: SidecarSettings,

    /// Network settings.
    #[serde(default)]
    pub network: NetworkSettings,
}

impl EgressSettings {
    /// Resolve the data directory, falling back to `~/.ert`.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".ert")
        })
    }

    /// Resolve the profiles directory, falling back to `<data_dir>/profiles`.
    pub fn profiles_dir(&self) -> PathBuf {
        self.profiles_dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("profiles"))
    }

    /// Validate the settings.
    pub fn validate(&self) -> Result<(), EgressError> {
        if self.sidecar.image.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "sidecar image cannot be empty".to_string(),
            )
            .into());
        }

        if self.sidecar.upstreams.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one upstream resolver is required".to_string(),
            )
            .into());
        }

        if self.sidecar.readiness_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "readinessAttempts must be at least 1".to_string(),
            )
            .into());
        }

        Ok(())
    }
}

/// Validate a domain pattern.
pub fn validate_domain_pattern(pattern: &str) -> Result<(), EgressError> {
    // Check for empty pattern
    if pattern.is_empty() {
        return Err(ConfigError::InvalidDomainPattern {
            pattern: pattern.to_string(),
            reason: "domain pattern cannot be empty".to_string(),
        }
        .into());
    }

    // Check for just wildcard
    if pattern == "*" {
        return Err(ConfigError::InvalidDomainPattern {
            pattern: pattern.to_string(),
            reason: "wildcard-only patterns are not allowed".to_string(),
        }
        .into());
    }

    // Check for too broad patterns like *.com
    if pattern.starts_with("*.") {
        let suffix = &pattern[2..];
        // Check if suffix is a TLD or too short
        if !suffix.contains('.') && suffix.len() <= 4 {
            return Err(ConfigError::InvalidDomainPattern {
                pattern: pattern.to_string(),
                reason: "pattern is too broad (matches entire TLD)".to_string(),
            }
            .into());
        }
    }

    // Check for port numbers
    if pattern.contains(':') {
        return Err(ConfigError::InvalidDomainPattern {
            pattern: pattern.to_string(),
            reason: "domain patterns cannot include port numbers".to_string(),
        }
        .into());
    }

    // Check for invalid characters
    let check_part = if pattern.starts_with("*.") {
        &pattern[2..]
    } else {
        pattern
    };

    for ch in check_part.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '-' && ch != '_' {
            return Err(ConfigError::InvalidDomainPattern {
                pattern: pattern.to_string(),
                reason: format!("invalid character '{}' in domain pattern", ch),
            }
            .into());
        }
    }

    Ok(())
}
