//! Rendering of the sidecar's dnsmasq configuration.
//!
//! The rendered text is a disposable artifact: regenerated from the profile
//! plus the current rule lists on every provision and reconfigure, never
//! edited in place.
//!
//! Precedence is most-specific-wins, which is dnsmasq's native matching
//! order: one directive per listed domain, then a single `#` catch-all for
//! the profile's default action. `#` is the least specific pattern, so the
//! catch-all can never shadow a listed domain no matter where it appears in
//! the file; it is emitted last for readability. A domain present in both
//! lists is blocked.

use crate::profile::{EgressAction, Profile, RuleAction};

/// Marker domain the readiness probe resolves. Always rendered, never
/// forwarded upstream.
pub const READINESS_DOMAIN: &str = "ready.egress.internal";

/// Strip a wildcard prefix: dnsmasq domain directives already match
/// subdomains, so `*.example.com` and `example.com` render identically.
fn dnsmasq_domain(pattern: &str) -> &str {
    pattern.strip_prefix("*.").unwrap_or(pattern)
}

/// Check a hostname against a listed pattern with the same semantics the
/// rendered `server=`/`address=` directives have: the domain itself and any
/// subdomain match.
pub fn matches_policy_domain(hostname: &str, pattern: &str) -> bool {
    let hostname = hostname.to_lowercase();
    let domain = dnsmasq_domain(&pattern.to_lowercase()).to_string();
    hostname == domain || hostname.ends_with(&format!(".{}", domain))
}

/// Render the sidecar config for a filtering profile and the environment's
/// current rule lists. Profile entries render before rule-store entries;
/// within each source, insertion order is preserved.
pub fn render_sidecar_config(
    profile: &Profile,
    allowed: &[String],
    blocked: &[String],
    upstreams: &[String],
) -> String {
    let mut block_domains: Vec<String> = Vec::new();
    let mut allow_domains: Vec<String> = Vec::new();

    let push_unique = |list: &mut Vec<String>, domain: &str| {
        let domain = dnsmasq_domain(domain).to_string();
        if !list.contains(&domain) {
            list.push(domain);
        }
    };

    for rule in &profile.rules {
        match rule.action {
            RuleAction::Allow => push_unique(&mut allow_domains, &rule.domain),
            RuleAction::Block => push_unique(&mut block_domains, &rule.domain),
        }
    }
    for domain in allowed {
        push_unique(&mut allow_domains, domain);
    }
    for domain in blocked {
        push_unique(&mut block_domains, domain);
    }

    // Block wins when a domain is on both lists.
    allow_domains.retain(|d| !block_domains.contains(d));

    let mut out = String::new();
    out.push_str("# Generated by egress-runtime; regenerated on every reconfigure.\n");
    out.push_str(&format!("# profile: {}\n", profile.name));
    out.push_str("port=53\n");
    out.push_str("no-resolv\n");
    out.push_str("no-hosts\n");
    out.push_str("log-queries\n");
    out.push_str(&format!("address=/{}/127.0.0.1\n", READINESS_DOMAIN));

    for domain in &allow_domains {
        for upstream in upstreams {
            out.push_str(&format!("server=/{}/{}\n", domain, upstream));
        }
    }

    for domain in &block_domains {
        out.push_str(&format!("address=/{}/0.0.0.0\n", domain));
    }

    // Catch-all for everything unlisted; least specific, so listed domains
    // always take precedence.
    match profile.default_action {
        EgressAction::Allow => {
            for upstream in upstreams {
                out.push_str(&format!("server=/#/{}\n", upstream));
            }
        }
        EgressAction::Deny => out.push_str("address=/#/0.0.0.0\n"),
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{FilterMode, RuleEntry};

    fn strict() -> Profile {
        Profile {
            name: "strict".to_string(),
            default_action: EgressAction::Deny,
            mode: FilterMode::Filtering,
            rules: Vec::new(),
        }
    }

    #[test]
    fn test_strict_with_allowed_domain() {
        let config = render_sidecar_config(
            &strict(),
            &["pkg.example.com".to_string()],
            &[],
            &["1.1.1.1".to_string()],
        );

        assert!(config.contains("server=/pkg.example.com/1.1.1.1\n"));
        assert!(config.contains("address=/#/0.0.0.0\n"));
        // Unlisted domains only hit the catch-all.
        assert!(!config.contains("evil.example.com"));
        // Catch-all comes after all specific entries.
        assert!(config.find("server=/pkg.example.com/").unwrap() < config.find("address=/#/").unwrap());
    }

    #[test]
    fn test_readiness_marker_always_present() {
        let config = render_sidecar_config(&strict(), &[], &[], &["1.1.1.1".to_string()]);
        assert!(config.contains(&format!("address=/{}/127.0.0.1", READINESS_DOMAIN)));
    }

    #[test]
    fn test_default_allow_forwards_catch_all() {
        let mut profile = strict();
        profile.default_action = EgressAction::Allow;

        let config = render_sidecar_config(
            &profile,
            &[],
            &["tracker.example.com".to_string()],
            &["1.1.1.1".to_string(), "8.8.8.8".to_string()],
        );

        assert!(config.contains("address=/tracker.example.com/0.0.0.0\n"));
        assert!(config.contains("server=/#/1.1.1.1\n"));
        assert!(config.contains("server=/#/8.8.8.8\n"));
    }

    #[test]
    fn test_block_wins_over_allow() {
        let config = render_sidecar_config(
            &strict(),
            &["dual.example.com".to_string()],
            &["dual.example.com".to_string()],
            &["1.1.1.1".to_string()],
        );

        assert!(!config.contains("server=/dual.example.com/"));
        assert!(config.contains("address=/dual.example.com/0.0.0.0\n"));
    }

    #[test]
    fn test_profile_rules_render_before_store_rules() {
        let mut profile = strict();
        profile.rules.push(RuleEntry {
            domain: "crates.io".to_string(),
            action: RuleAction::Allow,
        });

        let config = render_sidecar_config(
            &profile,
            &["pkg.example.com".to_string()],
            &[],
            &["1.1.1.1".to_string()],
        );

        assert!(config.find("server=/crates.io/").unwrap() < config.find("server=/pkg.example.com/").unwrap());
    }

    #[test]
    fn test_policy_domain_matching() {
        // Plain patterns match the domain and its subdomains, as dnsmasq does.
        assert!(matches_policy_domain("example.com", "example.com"));
        assert!(matches_policy_domain("api.example.com", "example.com"));
        assert!(matches_policy_domain("EXAMPLE.COM", "example.com"));
        assert!(!matches_policy_domain("notexample.com", "example.com"));

        // Wildcard patterns render the same as plain ones.
        assert!(matches_policy_domain("api.example.com", "*.example.com"));
        assert!(matches_policy_domain("example.com", "*.example.com"));
    }

    #[test]
    fn test_wildcard_prefix_stripped() {
        let config = render_sidecar_config(
            &strict(),
            &["*.example.com".to_string(), "example.com".to_string()],
            &[],
            &["1.1.1.1".to_string()],
        );

        // Both patterns collapse to the same dnsmasq directive, emitted once.
        assert_eq!(config.matches("server=/example.com/1.1.1.1").count(), 1);
        assert!(!config.contains("*."));
    }
}
