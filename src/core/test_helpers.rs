//! Shared test utilities for core module tests
//!
//! Provides common rule and policy builders to avoid duplication across
//! test suites. This module is only compiled in test mode.

use crate::core::model::{Action, DefaultAction, FilteringPolicy, PortRange, Protocol, Rule};
use crate::core::validate::{CheckedRule, validate};
use uuid::Uuid;

fn tcp_rule(position: u32, action: Action, sources: &[&str], dports: &[u16]) -> Rule {
    Rule::new(position, Protocol::Tcp, action)
        .with_sources(sources.iter().copied())
        .with_destination_ports(dports.iter().copied().map(PortRange::single))
}

/// TCP allow rule from `sources` to any destination on `dports`.
pub fn allow_tcp(position: u32, sources: &[&str], dports: &[u16]) -> Rule {
    tcp_rule(position, Action::Allow, sources, dports)
}

/// TCP deny rule from `sources` to any destination on `dports`.
pub fn deny_tcp(position: u32, sources: &[&str], dports: &[u16]) -> Rule {
    tcp_rule(position, Action::Deny, sources, dports)
}

/// Allow rule with raw (unchecked) port bounds.
pub fn rule_with_ports(
    position: u32,
    protocol: Protocol,
    sports: &[(u32, u32)],
    dports: &[(u32, u32)],
) -> Rule {
    let to_ranges = |ports: &[(u32, u32)]| -> Vec<PortRange> {
        ports
            .iter()
            .map(|&(start, end)| PortRange { start, end })
            .collect()
    };
    Rule::new(position, protocol, Action::Allow)
        .with_source_ports(to_ranges(sports))
        .with_destination_ports(to_ranges(dports))
}

/// Validates a rule that the test knows to be valid.
pub fn checked(rule: &Rule) -> CheckedRule {
    validate(rule).expect("test rule should be valid")
}

/// Policy holding `rules` exactly as given (positions are not renumbered).
pub fn policy_with(default_action: DefaultAction, rules: Vec<Rule>) -> FilteringPolicy {
    let mut policy = FilteringPolicy::new(Uuid::new_v4(), "test-policy", default_action);
    policy.rules = rules;
    policy
}
