//! Settings loader from ~/.ert-settings.json.

use std::path::{Path, PathBuf};

use crate::config::schema::EgressSettings;
use crate::error::{ConfigError, EgressError};

/// Default settings file name.
const DEFAULT_SETTINGS_FILE: &str = ".ert-settings.json";

/// Get the default settings file path.
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(DEFAULT_SETTINGS_FILE))
}

/// Load settings from a file path.
pub fn load_settings(path: &Path) -> Result<EgressSettings, EgressError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()).into());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ParseError(format!("Failed to read settings file: {}", e)))?;

    parse_settings(&content)
}

/// Load settings from the default path, or return defaults if not found.
pub fn load_default_settings() -> Result<EgressSettings, EgressError> {
    match default_settings_path() {
        Some(path) if path.exists() => load_settings(&path),
        _ => Ok(EgressSettings::default()),
    }
}

/// Parse settings from a JSON string.
pub fn parse_settings(json: &str) -> Result<EgressSettings, EgressError> {
    let settings: EgressSettings = serde_json::from_str(json)
        .map_err(|e| ConfigError::ParseError(format!("Failed to parse settings JSON: {}", e)))?;

    settings.validate()?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_settings() {
        let json = r#"{}"#;
        let settings = parse_settings(json).unwrap();
        assert!(settings.data_dir.is_none());
        assert!(!settings.sidecar.upstreams.is_empty());
    }

    #[test]
    fn test_parse_full_settings() {
        let json = r#"{
            "dataDir": "/var/lib/ert",
            "profilesDir": "/etc/ert/profiles",
            "sidecar": {
                "image": "dnsmasq:custom",
                "upstreams": ["9.9.9.9"],
                "readinessAttempts": 5,
                "readinessBackoffMs": 100
            },
            "network": {
                "disableIcc": false
            }
        }"#;

        let settings = parse_settings(json).unwrap();
        assert_eq!(settings.data_dir(), PathBuf::from("/var/lib/ert"));
        assert_eq!(settings.profiles_dir(), PathBuf::from("/etc/ert/profiles"));
        assert_eq!(settings.sidecar.image, "dnsmasq:custom");
        assert_eq!(settings.sidecar.upstreams, vec!["9.9.9.9"]);
        assert_eq!(settings.sidecar.readiness_attempts, 5);
        assert!(!settings.network.disable_icc);
    }

    #[test]
    fn test_parse_invalid_settings() {
        assert!(parse_settings("not json").is_err());
        assert!(parse_settings(r#"{"sidecar": {"upstreams": []}}"#).is_err());
    }

    #[test]
    fn test_load_settings_missing_file() {
        let result = load_settings(Path::new("/nonexistent/.ert-settings.json"));
        assert!(result.is_err());
    }
}
