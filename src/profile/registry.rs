//! Profile registry - named egress policy templates.
//!
//! Four profiles are built in:
//!
//! | name         | mode         | default action | seeded rules          |
//! |--------------|--------------|----------------|-----------------------|
//! | `standard`   | filtering    | deny           | common dev registries |
//! | `strict`     | filtering    | deny           | none                  |
//! | `airgapped`  | none         | deny           | none                  |
//! | `permissive` | unrestricted | allow          | none                  |
//!
//! A profiles directory may override a builtin or add new profiles. Template
//! files use one domain per line: plain lines are allow entries, `!domain`
//! lines are block entries, `#` starts a comment. Directive lines
//! `default-allow` / `default-deny` set the default action and an optional
//! `mode none|unrestricted|filtering` directive sets the mode (filtering is
//! the default for file-backed templates).

use std::path::PathBuf;

use crate::config::schema::validate_domain_pattern;
use crate::error::ProfileError;

/// Default action applied to domains not covered by any rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressAction {
    Allow,
    Deny,
}

impl EgressAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EgressAction::Allow => "allow",
            EgressAction::Deny => "deny",
        }
    }
}

/// How egress is enforced for a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// DNS-filtering sidecar on an isolated network.
    Filtering,
    /// No network at all (airgapped).
    None,
    /// Default network, no filtering (permissive).
    Unrestricted,
}

impl FilterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterMode::Filtering => "filtering",
            FilterMode::None => "none",
            FilterMode::Unrestricted => "unrestricted",
        }
    }
}

/// Tag on a profile rule entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Allow,
    Block,
}

/// A single domain rule carried by a profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleEntry {
    pub domain: String,
    pub action: RuleAction,
}

/// An immutable, named egress policy template.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub name: String,
    pub default_action: EgressAction,
    pub mode: FilterMode,
    /// Ordered rule entries seeded by the template.
    pub rules: Vec<RuleEntry>,
}

impl Profile {
    /// Validate internal consistency of the profile.
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.mode != FilterMode::Filtering && !self.rules.is_empty() {
            return Err(ProfileError::Invalid {
                name: self.name.clone(),
                reason: format!("mode '{}' cannot carry domain entries", self.mode.as_str()),
            });
        }

        for rule in &self.rules {
            validate_domain_pattern(&rule.domain).map_err(|e| ProfileError::Invalid {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }
}

/// Names of the built-in profiles.
pub const BUILTIN_PROFILES: &[&str] = &["standard", "strict", "airgapped", "permissive"];

/// Domains the `standard` profile allows out of the box.
const STANDARD_ALLOWED: &[&str] = &[
    "github.com",
    "githubusercontent.com",
    "registry.npmjs.org",
    "pypi.org",
    "files.pythonhosted.org",
    "crates.io",
    "static.crates.io",
    "index.crates.io",
    "proxy.golang.org",
    "sum.golang.org",
    "deb.debian.org",
    "archive.ubuntu.com",
    "security.ubuntu.com",
];

fn builtin_profile(name: &str) -> Option<Profile> {
    match name {
        "standard" => Some(Profile {
            name: "standard".to_string(),
            default_action: EgressAction::Deny,
            mode: FilterMode::Filtering,
            rules: STANDARD_ALLOWED
                .iter()
                .map(|d| RuleEntry {
                    domain: d.to_string(),
                    action: RuleAction::Allow,
                })
                .collect(),
        }),
        "strict" => Some(Profile {
            name: "strict".to_string(),
            default_action: EgressAction::Deny,
            mode: FilterMode::Filtering,
            rules: Vec::new(),
        }),
        "airgapped" => Some(Profile {
            name: "airgapped".to_string(),
            default_action: EgressAction::Deny,
            mode: FilterMode::None,
            rules: Vec::new(),
        }),
        "permissive" => Some(Profile {
            name: "permissive".to_string(),
            default_action: EgressAction::Allow,
            mode: FilterMode::Unrestricted,
            rules: Vec::new(),
        }),
        _ => None,
    }
}

/// Loads and validates named policy templates.
///
/// File-backed templates in the profiles directory take precedence over
/// builtins with the same name. Templates are read at lookup time, so edits
/// take effect on the next provision/reconfigure.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles_dir: PathBuf,
}

impl ProfileRegistry {
    /// Create a registry backed by the given profiles directory.
    pub fn new(profiles_dir: PathBuf) -> Self {
        Self { profiles_dir }
    }

    /// Load and validate a profile by name.
    pub fn load(&self, name: &str) -> Result<Profile, ProfileError> {
        let path = self.profiles_dir.join(name);

        let profile = if path.is_file() {
            let content = std::fs::read_to_string(&path).map_err(|e| ProfileError::Io {
                name: name.to_string(),
                source: e,
            })?;
            parse_profile(name, &content)?
        } else {
            builtin_profile(name).ok_or_else(|| ProfileError::NotFound(name.to_string()))?
        };

        profile.validate()?;
        Ok(profile)
    }
}

/// Parse a file-backed profile template.
fn parse_profile(name: &str, content: &str) -> Result<Profile, ProfileError> {
    let mut default_action: Option<EgressAction> = None;
    let mut mode = FilterMode::Filtering;
    let mut rules = Vec::new();

    for raw_line in content.lines() {
        let line = raw_line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        match line {
            "default-allow" => default_action = Some(EgressAction::Allow),
            "default-deny" => default_action = Some(EgressAction::Deny),
            _ if line.starts_with("mode ") || line.starts_with("mode=") => {
                mode = match line[5..].trim() {
                    "filtering" => FilterMode::Filtering,
                    "none" => FilterMode::None,
                    "unrestricted" => FilterMode::Unrestricted,
                    other => {
                        return Err(ProfileError::Invalid {
                            name: name.to_string(),
                            reason: format!("unknown mode '{}'", other),
                        })
                    }
                };
            }
            _ if line.starts_with('!') => rules.push(RuleEntry {
                domain: line[1..].trim().to_string(),
                action: RuleAction::Block,
            }),
            _ => rules.push(RuleEntry {
                domain: line.to_string(),
                action: RuleAction::Allow,
            }),
        }
    }

    // A filtering template must state its default posture explicitly.
    let default_action = match (mode, default_action) {
        (FilterMode::Filtering, None) => {
            return Err(ProfileError::Invalid {
                name: name.to_string(),
                reason: "filtering profile has no default-allow/default-deny directive"
                    .to_string(),
            })
        }
        (FilterMode::None, action) => action.unwrap_or(EgressAction::Deny),
        (FilterMode::Unrestricted, action) => action.unwrap_or(EgressAction::Allow),
        (_, Some(action)) => action,
    };

    Ok(Profile {
        name: name.to_string(),
        default_action,
        mode,
        rules,
    })
}
