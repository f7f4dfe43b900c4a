//! CLI parsing and execution.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Egress Runtime - DNS-level egress control for container environments
#[derive(Parser, Debug)]
#[command(name = "ert")]
#[command(about = "Egress Runtime - provision DNS-filtered networks for container environments")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long = "debug", global = true)]
    pub debug: bool,

    /// Path to settings file (default: ~/.ert-settings.json)
    #[arg(short = 's', long = "settings", global = true)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision egress control for an environment
    Up {
        /// Environment identity
        env: String,

        /// Egress profile (standard, strict, airgapped, permissive, or a template name)
        #[arg(short = 'p', long = "profile", default_value = "standard")]
        profile: String,
    },

    /// Re-render the policy and reload the DNS sidecar
    Reload {
        /// Environment identity
        env: String,
    },

    /// Tear down an environment's egress resources
    Down {
        /// Environment identity
        env: String,
    },

    /// Add a domain to the allow list (takes effect on reload)
    Allow {
        /// Environment identity
        env: String,

        /// Domain or wildcard pattern (e.g. pkg.example.com, *.example.com)
        domain: String,

        /// Remove the domain instead of adding it
        #[arg(long = "remove")]
        remove: bool,
    },

    /// Add a domain to the block list (takes effect on reload)
    Block {
        /// Environment identity
        env: String,

        /// Domain or wildcard pattern
        domain: String,

        /// Remove the domain instead of adding it
        #[arg(long = "remove")]
        remove: bool,
    },

    /// Print an environment's allow and block lists
    Rules {
        /// Environment identity
        env: String,
    },

    /// Show what the current policy would answer for a hostname
    Check {
        /// Environment identity
        env: String,

        /// Hostname to evaluate
        hostname: String,
    },
}

impl Cli {
    /// Parse CLI arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Get the settings file path.
    pub fn get_settings_path(&self) -> Option<PathBuf> {
        self.settings.clone().or_else(crate::config::default_settings_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_up_defaults_to_standard_profile() {
        let cli = Cli::try_parse_from(["ert", "up", "env1"]).unwrap();
        match cli.command {
            Commands::Up { env, profile } => {
                assert_eq!(env, "env1");
                assert_eq!(profile, "standard");
            }
            _ => panic!("expected up"),
        }
    }

    #[test]
    fn test_allow_with_remove_flag() {
        let cli = Cli::try_parse_from(["ert", "allow", "env1", "crates.io", "--remove"]).unwrap();
        match cli.command {
            Commands::Allow { env, domain, remove } => {
                assert_eq!(env, "env1");
                assert_eq!(domain, "crates.io");
                assert!(remove);
            }
            _ => panic!("expected allow"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["ert", "down", "env1", "--debug"]).unwrap();
        assert!(cli.debug);
        assert!(matches!(cli.command, Commands::Down { .. }));
    }

    #[test]
    fn test_missing_subcommand_is_an_error() {
        assert!(Cli::try_parse_from(["ert"]).is_err());
    }
}
