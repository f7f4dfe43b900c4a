//! Egress Runtime - DNS-level egress control for container-based environments.
//!
//! Each environment gets an isolated bridge network plus a dnsmasq sidecar
//! pinned to a reserved address in the network's subnet. The sidecar answers
//! the environment's DNS queries according to an egress profile and two
//! mutable per-environment domain lists; everything unlisted follows the
//! profile's default action.

pub mod cli;
pub mod config;
pub mod docker;
pub mod error;
pub mod manager;
pub mod network;
pub mod profile;
pub mod rules;
pub mod sidecar;
pub mod utils;

pub use config::EgressSettings;
pub use error::{ConfigError, EgressError, ProfileError, Result};
pub use manager::{EgressController, NetworkAttachment, Provisioned};
pub use network::{NetworkHandle, ProvisionWarning};
pub use profile::{Profile, ProfileRegistry};
pub use rules::{RuleList, RuleStore};

/// Re-export commonly used items.
pub mod prelude {
    pub use crate::config::EgressSettings;
    pub use crate::error::{EgressError, Result};
    pub use crate::manager::{EgressController, NetworkAttachment, Provisioned};
    pub use crate::rules::RuleList;
}
