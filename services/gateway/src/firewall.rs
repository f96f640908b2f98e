//! Firewall rule model and rule-set comparison.
//!
//! Rule sets are compared structurally:
//! - same number of rules, compared position by position
//! - scalar fields (direction, protocol, port, description) must match
//! - source and destination prefix lists are compared as multisets
//!
//! The expected rule set is always generated in one fixed order: the
//! Kubernetes API rule, then the Talos API rule.

use std::cmp::Ordering;
use std::net::IpAddr;

use hctg_networking::IpPrefix;
use serde::{Deserialize, Serialize};

use crate::{KUBERNETES_API_PORT, TALOS_API_PORT};

/// Traffic direction of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

/// Protocol matched by a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Esp,
    Gre,
}

/// A single firewall rule, as exchanged with the cloud API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub direction: Direction,
    pub protocol: Protocol,

    /// Port or port range ("80", "80-85"); absent for icmp/esp/gre.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_ips: Vec<IpPrefix>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destination_ips: Vec<IpPrefix>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl FirewallRule {
    /// Inbound TCP rule for one port allowing the given sources.
    pub fn inbound_tcp(port: u16, sources: Vec<IpPrefix>) -> Self {
        Self {
            direction: Direction::In,
            protocol: Protocol::Tcp,
            port: Some(port.to_string()),
            source_ips: sources,
            destination_ips: Vec::new(),
            description: None,
        }
    }

    /// Semantic equality: prefix lists are compared ignoring order.
    pub fn matches(&self, other: &FirewallRule) -> bool {
        self.direction == other.direction
            && self.protocol == other.protocol
            && self.port == other.port
            && self.description == other.description
            && prefixes_equal(&self.source_ips, &other.source_ips)
            && prefixes_equal(&self.destination_ips, &other.destination_ips)
    }

    fn canonical_cmp(&self, other: &FirewallRule) -> Ordering {
        self.direction
            .cmp(&other.direction)
            .then(self.protocol.cmp(&other.protocol))
            .then_with(|| self.port.cmp(&other.port))
            .then_with(|| self.description.cmp(&other.description))
    }
}

/// A firewall resource and its current rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Firewall {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub rules: Vec<FirewallRule>,
}

/// Compare two rule sets position by position.
///
/// Rule order matters; prefix order inside a rule does not.
pub fn rules_equal(a: &[FirewallRule], b: &[FirewallRule]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.matches(y))
}

/// Compare two rule sets after sorting both into canonical order.
///
/// Tolerates a remote side that stores rules in a different order.
pub fn rules_equivalent(a: &[FirewallRule], b: &[FirewallRule]) -> bool {
    rules_equal(&canonical_order(a), &canonical_order(b))
}

/// Sort rules by (direction, protocol, port, description).
pub fn canonical_order(rules: &[FirewallRule]) -> Vec<FirewallRule> {
    let mut sorted = rules.to_vec();
    sorted.sort_by(FirewallRule::canonical_cmp);
    sorted
}

/// Build the desired rule set for the given node public addresses.
///
/// Each address becomes its own host prefix; both rules share the same
/// source list.
pub fn expected_rules(public_addresses: &[IpAddr]) -> Vec<FirewallRule> {
    let sources: Vec<IpPrefix> = public_addresses
        .iter()
        .copied()
        .map(IpPrefix::host)
        .collect();

    vec![
        FirewallRule::inbound_tcp(KUBERNETES_API_PORT, sources.clone()),
        FirewallRule::inbound_tcp(TALOS_API_PORT, sources),
    ]
}

fn prefixes_equal(a: &[IpPrefix], b: &[IpPrefix]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    b.sort();
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn cidrs(list: &[&str]) -> Vec<IpPrefix> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    fn rule() -> FirewallRule {
        FirewallRule {
            direction: Direction::In,
            protocol: Protocol::Tcp,
            port: None,
            source_ips: Vec::new(),
            destination_ips: Vec::new(),
            description: None,
        }
    }

    #[test]
    fn test_rule_set_lengths() {
        assert!(rules_equal(&[], &[]));
        assert!(rules_equal(&[rule()], &[rule()]));
        assert!(!rules_equal(&[rule()], &[]));
        assert!(!rules_equal(&[], &[rule()]));
    }

    #[rstest]
    #[case(&["10.0.0.0/24"], &["10.0.0.0/24"], true)]
    #[case(&["10.0.0.0/24", "10.0.1.0/24"], &["10.0.1.0/24", "10.0.0.0/24"], true)]
    #[case(&["10.0.0.0/24"], &["10.0.1.0/24"], false)]
    #[case(&["10.0.0.0/24"], &["10.0.0.0/24", "10.0.1.0/24"], false)]
    #[case(&["10.0.0.0/24", "10.0.0.0/24"], &["10.0.0.0/24", "10.0.1.0/24"], false)]
    fn test_prefix_lists_ignore_order(
        #[case] left: &[&str],
        #[case] right: &[&str],
        #[case] equal: bool,
    ) {
        let a = FirewallRule {
            source_ips: cidrs(left),
            ..rule()
        };
        let b = FirewallRule {
            source_ips: cidrs(right),
            ..rule()
        };
        assert_eq!(rules_equal(&[a], &[b]), equal);

        let a = FirewallRule {
            destination_ips: cidrs(left),
            ..rule()
        };
        let b = FirewallRule {
            destination_ips: cidrs(right),
            ..rule()
        };
        assert_eq!(rules_equal(&[a], &[b]), equal);
    }

    #[rstest]
    #[case(None, None, true)]
    #[case(Some("80"), Some("80"), true)]
    #[case(None, Some("80"), false)]
    #[case(Some("80"), None, false)]
    #[case(Some("80"), Some("81"), false)]
    fn test_port(#[case] left: Option<&str>, #[case] right: Option<&str>, #[case] equal: bool) {
        let a = FirewallRule {
            port: left.map(str::to_string),
            ..rule()
        };
        let b = FirewallRule {
            port: right.map(str::to_string),
            ..rule()
        };
        assert_eq!(rules_equal(&[a], &[b]), equal);
    }

    #[rstest]
    #[case(None, None, true)]
    #[case(Some("desc"), Some("desc"), true)]
    #[case(None, Some("desc"), false)]
    #[case(Some("desc"), None, false)]
    #[case(Some("desc"), Some("desc2"), false)]
    fn test_description(
        #[case] left: Option<&str>,
        #[case] right: Option<&str>,
        #[case] equal: bool,
    ) {
        let a = FirewallRule {
            description: left.map(str::to_string),
            ..rule()
        };
        let b = FirewallRule {
            description: right.map(str::to_string),
            ..rule()
        };
        assert_eq!(rules_equal(&[a], &[b]), equal);
    }

    #[test]
    fn test_direction_and_protocol() {
        let out = FirewallRule {
            direction: Direction::Out,
            ..rule()
        };
        assert!(!rules_equal(&[rule()], &[out]));

        let udp = FirewallRule {
            protocol: Protocol::Udp,
            ..rule()
        };
        assert!(!rules_equal(&[rule()], &[udp]));
    }

    #[test]
    fn test_rule_order_is_significant() {
        let rules = expected_rules(&["1.2.3.4".parse().unwrap()]);
        let mut reversed = rules.clone();
        reversed.reverse();

        assert!(!rules_equal(&rules, &reversed));
        assert!(rules_equivalent(&rules, &reversed));
    }

    #[test]
    fn test_shuffled_sources_are_equal() {
        let addrs: Vec<IpAddr> = vec![
            "1.2.3.4".parse().unwrap(),
            "5.6.7.8".parse().unwrap(),
            "9.9.9.9".parse().unwrap(),
        ];
        let rules = expected_rules(&addrs);

        let mut shuffled = rules.clone();
        for r in &mut shuffled {
            r.source_ips.reverse();
        }

        assert!(rules_equal(&shuffled, &rules));
    }

    #[test]
    fn test_expected_rules_shape() {
        let rules = expected_rules(&["1.2.3.4".parse().unwrap(), "2001:db8::1".parse().unwrap()]);

        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].port.as_deref(), Some("6443"));
        assert_eq!(rules[1].port.as_deref(), Some("50000"));
        for r in &rules {
            assert_eq!(r.direction, Direction::In);
            assert_eq!(r.protocol, Protocol::Tcp);
            assert!(r.destination_ips.is_empty());
            assert!(r.description.is_none());
            assert_eq!(r.source_ips, cidrs(&["1.2.3.4/32", "2001:db8::1/128"]));
        }
    }

    #[test]
    fn test_rule_json_matches_api_shape() {
        let rule = FirewallRule::inbound_tcp(6443, cidrs(&["1.2.3.4/32"]));
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "direction": "in",
                "protocol": "tcp",
                "port": "6443",
                "source_ips": ["1.2.3.4/32"]
            })
        );

        let parsed: FirewallRule = serde_json::from_value(serde_json::json!({
            "direction": "in",
            "protocol": "icmp",
            "port": null,
            "source_ips": ["0.0.0.0/0", "::/0"],
            "destination_ips": [],
            "description": null
        }))
        .unwrap();
        assert_eq!(parsed.protocol, Protocol::Icmp);
        assert!(parsed.port.is_none());
        assert_eq!(parsed.source_ips.len(), 2);
    }
}
