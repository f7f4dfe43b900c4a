//! Egress policy profiles.

pub mod registry;

pub use registry::{
    EgressAction, FilterMode, Profile, ProfileRegistry, RuleAction, RuleEntry, BUILTIN_PROFILES,
};
