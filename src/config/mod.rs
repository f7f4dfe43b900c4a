//! Runtime settings module.

pub mod loader;
pub mod schema;

pub use loader::{default_settings_path, load_default_settings, load_settings, parse_settings};
pub use schema::{
    validate_domain_pattern, EgressSettings, NetworkSettings, SidecarSettings,
    DEFAULT_SIDECAR_IMAGE,
};
