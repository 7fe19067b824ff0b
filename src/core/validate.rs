//! Single-rule validation
//!
//! [`validate`] turns a stored [`Rule`] into a [`CheckedRule`] with parsed
//! networks and bounded ports, or reports every violation it finds in one
//! pass. It is pure: nothing is mutated and nothing is logged.

use crate::core::error::{InvalidRuleError, RuleViolation};
use crate::core::model::{Action, PortRange, Protocol, Rule};
use crate::core::rule_constraints::{
    canonical_network, families_of, is_normalized, port_in_range, protocol_supports_ports,
};
use crate::validators;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Port range with bounds known to be valid (`start <= end`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortSpan {
    pub start: u16,
    pub end: u16,
}

impl PortSpan {
    pub fn is_single(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for PortSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// A rule whose criteria have been parsed and checked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckedRule {
    pub id: Uuid,
    pub position: u32,
    pub label: String,
    pub protocol: Protocol,
    pub action: Action,
    pub enabled: bool,
    pub sources: Vec<IpNetwork>,
    pub destinations: Vec<IpNetwork>,
    pub source_ports: Vec<PortSpan>,
    pub destination_ports: Vec<PortSpan>,
}

/// Validates a rule, collecting every violation.
///
/// # Errors
///
/// Returns [`InvalidRuleError`] listing each field problem when the rule has
/// malformed or non-normalized CIDRs, out-of-range or inverted ports, ports on
/// a protocol without ports, source and destination sets with no common
/// address family, or a bad label.
pub fn validate(rule: &Rule) -> Result<CheckedRule, InvalidRuleError> {
    let mut violations = Vec::new();

    if let Err(reason) = validators::validate_label(&rule.label) {
        violations.push(RuleViolation::new("label", reason));
    }

    let sources = check_networks("sources", &rule.sources, &mut violations);
    let destinations = check_networks("destinations", &rule.destinations, &mut violations);

    if !protocol_supports_ports(rule.protocol)
        && (!rule.source_ports.is_empty() || !rule.destination_ports.is_empty())
    {
        violations.push(RuleViolation::new(
            "protocol",
            format!("{} rules cannot match ports", rule.protocol),
        ));
    }
    let source_ports = check_ports("source_ports", &rule.source_ports, &mut violations);
    let destination_ports =
        check_ports("destination_ports", &rule.destination_ports, &mut violations);

    // Only meaningful when every CIDR parsed
    if sources.len() == rule.sources.len()
        && destinations.len() == rule.destinations.len()
        && families_of(&sources)
            .intersect(families_of(&destinations))
            .is_empty()
    {
        violations.push(RuleViolation::new(
            "destinations",
            "source and destination address families never match (empty match space)",
        ));
    }

    if !violations.is_empty() {
        return Err(InvalidRuleError {
            rule_id: rule.id,
            violations,
        });
    }

    Ok(CheckedRule {
        id: rule.id,
        position: rule.position,
        label: rule.label.clone(),
        protocol: rule.protocol,
        action: rule.action,
        enabled: rule.enabled,
        sources,
        destinations,
        source_ports,
        destination_ports,
    })
}

fn check_networks(
    field: &str,
    raw: &[String],
    violations: &mut Vec<RuleViolation>,
) -> Vec<IpNetwork> {
    let mut parsed = Vec::with_capacity(raw.len());
    for (i, text) in raw.iter().enumerate() {
        let slot = format!("{field}[{i}]");
        match IpNetwork::from_str(text.trim()) {
            Ok(net) if is_normalized(&net) => parsed.push(net),
            Ok(net) => violations.push(RuleViolation::new(
                slot,
                format!(
                    "'{text}' has host bits set; use {}",
                    canonical_network(&net)
                ),
            )),
            Err(e) => violations.push(RuleViolation::new(
                slot,
                format!("'{text}' is not a valid CIDR: {e}"),
            )),
        }
    }
    parsed
}

fn check_ports(
    field: &str,
    raw: &[PortRange],
    violations: &mut Vec<RuleViolation>,
) -> Vec<PortSpan> {
    let mut spans = Vec::with_capacity(raw.len());
    for (i, range) in raw.iter().enumerate() {
        let slot = format!("{field}[{i}]");
        if !port_in_range(range.start) || !port_in_range(range.end) {
            violations.push(RuleViolation::new(
                slot,
                format!("{range} is outside 0-65535"),
            ));
            continue;
        }
        if range.start > range.end {
            violations.push(RuleViolation::new(
                slot,
                format!("start {} is greater than end {}", range.start, range.end),
            ));
            continue;
        }
        // Both bounds checked above
        spans.push(PortSpan {
            start: u16::try_from(range.start).unwrap_or(u16::MAX),
            end: u16::try_from(range.end).unwrap_or(u16::MAX),
        });
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::{allow_tcp, rule_with_ports};

    fn fields(err: &InvalidRuleError) -> Vec<&str> {
        err.violations.iter().map(|v| v.field.as_str()).collect()
    }

    #[test]
    fn test_valid_rule_is_checked() {
        let rule = allow_tcp(1, &["10.0.0.0/8"], &[443]);
        let checked = validate(&rule).unwrap();
        assert_eq!(checked.sources[0].to_string(), "10.0.0.0/8");
        assert_eq!(
            checked.destination_ports,
            vec![PortSpan {
                start: 443,
                end: 443
            }]
        );
    }

    #[test]
    fn test_empty_sets_mean_any() {
        let rule = Rule::new(1, Protocol::Any, Action::Deny);
        let checked = validate(&rule).unwrap();
        assert!(checked.sources.is_empty());
        assert!(checked.destinations.is_empty());
    }

    #[test]
    fn test_host_bits_violation_names_canonical_form() {
        let rule = allow_tcp(1, &["10.0.0.1/8"], &[]);
        let err = validate(&rule).unwrap_err();
        assert_eq!(fields(&err), vec!["sources[0]"]);
        assert!(err.violations[0].reason.contains("10.0.0.0/8"));
    }

    #[test]
    fn test_bare_address_is_accepted() {
        let rule = allow_tcp(1, &["192.168.1.10"], &[22]);
        let checked = validate(&rule).unwrap();
        assert_eq!(checked.sources[0].prefix(), 32);
    }

    #[test]
    fn test_collects_every_violation() {
        let rule = Rule::new(1, Protocol::Icmp, Action::Allow)
            .with_label("bad\"label")
            .with_sources(["not-an-ip", "10.0.0.0/33"])
            .with_destination_ports([PortRange {
                start: 70_000,
                end: 80,
            }]);
        let err = validate(&rule).unwrap_err();
        let got = fields(&err);
        assert!(got.contains(&"label"));
        assert!(got.contains(&"sources[0]"));
        assert!(got.contains(&"sources[1]"));
        assert!(got.contains(&"protocol"));
        assert!(got.contains(&"destination_ports[0]"));
        assert_eq!(err.violations.len(), 5);
    }

    #[test]
    fn test_inverted_port_range() {
        let rule = rule_with_ports(1, Protocol::Udp, &[], &[(100, 10)]);
        let err = validate(&rule).unwrap_err();
        assert!(err.violations[0].reason.contains("greater than"));
    }

    #[test]
    fn test_any_protocol_rejects_ports() {
        let rule = Rule::new(1, Protocol::Any, Action::Allow).with_source_ports([PortRange::single(53)]);
        let err = validate(&rule).unwrap_err();
        assert_eq!(fields(&err), vec!["protocol"]);
    }

    #[test]
    fn test_family_mismatch_is_empty_match_space() {
        let rule = Rule::new(1, Protocol::Tcp, Action::Allow)
            .with_sources(["10.0.0.0/8"])
            .with_destinations(["2001:db8::/32"]);
        let err = validate(&rule).unwrap_err();
        assert!(err.violations[0].reason.contains("empty match space"));
    }

    #[test]
    fn test_mixed_families_with_common_family_are_valid() {
        let rule = Rule::new(1, Protocol::Tcp, Action::Allow)
            .with_sources(["10.0.0.0/8", "2001:db8::/32"])
            .with_destinations(["2001:db8:1::/48"]);
        assert!(validate(&rule).is_ok());
    }

    #[test]
    fn test_port_span_display() {
        assert_eq!(PortSpan { start: 80, end: 80 }.to_string(), "80");
        assert_eq!(
            PortSpan {
                start: 1000,
                end: 2000
            }
            .to_string(),
            "1000-2000"
        );
    }
}
