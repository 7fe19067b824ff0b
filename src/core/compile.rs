//! Policy compilation
//!
//! Turns an editable [`FilteringPolicy`] into an immutable [`CompiledPolicy`]:
//!
//! 1. positions must be unique and dense; every enabled rule must validate
//! 2. conflict analysis runs; any error-severity finding aborts
//! 3. redundant (info) and disabled rules are dropped, positions renumbered
//! 4. the default action is appended as a final catch-all
//!
//! Output is deterministic. The same rules in the same order always produce
//! the same instruction bytes and therefore the same checksum.

use crate::core::analyze::{ConflictReport, analyze_checked};
use crate::core::error::{CompileError, InvalidRuleError};
use crate::core::match_space::{set_to_spans, spans_to_set};
use crate::core::model::{Action, DefaultAction, FilteringPolicy, MAX_RULES, PolicyVersion, Protocol};
use crate::core::rule_constraints::AddressFamily;
use crate::core::validate::{CheckedRule, PortSpan, validate};
use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Normalized, order-significant match + action unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    /// Final 1-based position; targets rebuild order from this
    pub position: u32,
    /// Originating rule; `None` for the default-action catch-all
    pub rule_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub label: String,
    pub protocol: Protocol,
    pub sources: Vec<String>,
    pub destinations: Vec<String>,
    pub source_ports: Vec<PortSpan>,
    pub destination_ports: Vec<PortSpan>,
    pub action: Action,
}

impl Instruction {
    pub fn is_catch_all(&self) -> bool {
        self.rule_id.is_none()
    }

    fn catch_all(position: u32, default_action: DefaultAction) -> Self {
        Self {
            position,
            rule_id: None,
            label: String::new(),
            protocol: Protocol::Any,
            sources: Vec::new(),
            destinations: Vec::new(),
            source_ports: Vec::new(),
            destination_ports: Vec::new(),
            action: default_action.as_action(),
        }
    }

    fn from_rule(position: u32, rule: &CheckedRule) -> Self {
        Self {
            position,
            rule_id: Some(rule.id),
            label: rule.label.clone(),
            protocol: rule.protocol,
            sources: canonical_networks(&rule.sources),
            destinations: canonical_networks(&rule.destinations),
            source_ports: set_to_spans(&spans_to_set(&rule.source_ports)),
            destination_ports: set_to_spans(&spans_to_set(&rule.destination_ports)),
            action: rule.action,
        }
    }
}

/// Immutable, versioned output of [`compile`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledPolicy {
    pub id: Uuid,
    pub version: PolicyVersion,
    pub firewall_id: Uuid,
    /// Revision of the policy this was compiled from
    pub policy_revision: u64,
    pub instructions: Vec<Instruction>,
    pub default_action: DefaultAction,
    pub compiled_at: DateTime<Utc>,
    /// SHA-256 of the canonical instruction bytes
    pub checksum: String,
}

impl CompiledPolicy {
    /// Returns `true` if the stored checksum still matches the instructions.
    pub fn verify_checksum(&self) -> bool {
        compute_checksum(&self.instructions) == self.checksum
    }

    /// Instructions ordered for safe delivery: restrictive ones first, then
    /// permissive ones. Each keeps its final position.
    pub fn delivery_order(&self) -> Vec<Instruction> {
        let (mut restrictive, permissive): (Vec<Instruction>, Vec<Instruction>) = self
            .instructions
            .iter()
            .cloned()
            .partition(|i| i.action.is_restrictive());
        restrictive.extend(permissive);
        restrictive
    }
}

/// Compiles `policy` as `version`.
///
/// # Errors
///
/// Returns [`CompileError`] with kind `InvalidRule` when positions are broken
/// or any enabled rule fails validation (every violation is reported), and
/// kind `FatalConflict` when analysis finds error-severity shadowing.
pub fn compile(policy: &FilteringPolicy, version: u64) -> Result<CompiledPolicy, CompileError> {
    let (checked, report) = check_policy(policy)?;

    if report.has_errors() {
        return Err(CompileError::fatal_conflicts(report.errors().cloned().collect()));
    }
    for finding in report.warnings() {
        warn!(policy = %policy.id, "{finding}");
    }

    let pruned: HashSet<Uuid> = report.redundant().collect();
    for id in &pruned {
        debug!(policy = %policy.id, rule = %id, "Pruning redundant rule");
    }

    let mut instructions: Vec<Instruction> = checked
        .iter()
        .filter(|r| !pruned.contains(&r.id))
        .zip(1u32..)
        .map(|(rule, position)| Instruction::from_rule(position, rule))
        .collect();
    let catch_all_position = u32::try_from(instructions.len() + 1).unwrap_or(u32::MAX);
    instructions.push(Instruction::catch_all(catch_all_position, policy.default_action));

    let checksum = compute_checksum(&instructions);
    info!(
        policy = %policy.id,
        version,
        instructions = instructions.len(),
        pruned = pruned.len(),
        "Policy compiled"
    );

    Ok(CompiledPolicy {
        id: Uuid::new_v4(),
        version: PolicyVersion::new(policy.id, version),
        firewall_id: policy.firewall_id,
        policy_revision: policy.revision,
        instructions,
        default_action: policy.default_action,
        compiled_at: Utc::now(),
        checksum,
    })
}

/// Runs the validation and analysis stages without building instructions.
///
/// Returns the enabled rules in position order together with their report.
///
/// # Errors
///
/// Same `InvalidRule` conditions as [`compile`].
pub fn check_policy(
    policy: &FilteringPolicy,
) -> Result<(Vec<CheckedRule>, ConflictReport), CompileError> {
    let mut problems = check_positions(policy);
    if policy.rules.len() > MAX_RULES {
        problems.push(format!(
            "policy has {} rules (max {MAX_RULES})",
            policy.rules.len()
        ));
    }

    let mut invalid: Vec<InvalidRuleError> = Vec::new();
    let mut checked = Vec::new();
    for rule in policy.ordered_rules().into_iter().filter(|r| r.enabled) {
        match validate(rule) {
            Ok(c) => checked.push(c),
            Err(e) => invalid.push(e),
        }
    }
    if !problems.is_empty() || !invalid.is_empty() {
        return Err(CompileError::invalid_rules(invalid, problems));
    }

    let report = analyze_checked(&checked);
    Ok((checked, report))
}

fn check_positions(policy: &FilteringPolicy) -> Vec<String> {
    let mut positions: Vec<u32> = policy.rules.iter().map(|r| r.position).collect();
    positions.sort_unstable();
    let mut problems = Vec::new();
    for (expected, window) in (1u32..).zip(positions.iter()) {
        if *window != expected {
            problems.push(format!(
                "rule positions must be unique and dense from 1; found {positions:?}"
            ));
            break;
        }
    }
    problems
}

/// SHA-256 over the canonical JSON encoding of `instructions`.
pub fn compute_checksum(instructions: &[Instruction]) -> String {
    let bytes = serde_json::to_vec(instructions).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!("{:x}", hasher.finalize())
}

/// Canonical network list: host bits already cleared by validation, sorted by
/// family, address and prefix, duplicates removed.
fn canonical_networks(networks: &[IpNetwork]) -> Vec<String> {
    let mut sorted: Vec<&IpNetwork> = networks.iter().collect();
    sorted.sort_by_key(|n| (AddressFamily::of(n), n.network(), n.prefix()));
    sorted.dedup();
    sorted.into_iter().map(ToString::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::CompileErrorKind;
    use crate::core::model::Rule;
    use crate::core::test_helpers::{allow_tcp, deny_tcp, policy_with};

    #[test]
    fn test_compile_is_deterministic() {
        let policy = policy_with(
            DefaultAction::Deny,
            vec![
                allow_tcp(1, &["10.0.0.0/8", "192.168.0.0/16"], &[443, 80]),
                deny_tcp(2, &[], &[22]),
            ],
        );
        let a = compile(&policy, 1).unwrap();
        let b = compile(&policy, 1).unwrap();
        assert_eq!(a.instructions, b.instructions);
        assert_eq!(a.checksum, b.checksum);
        assert_eq!(
            serde_json::to_vec(&a.instructions).unwrap(),
            serde_json::to_vec(&b.instructions).unwrap()
        );
    }

    #[test]
    fn test_empty_policy_compiles_to_catch_all() {
        let policy = policy_with(DefaultAction::Deny, vec![]);
        let compiled = compile(&policy, 1).unwrap();
        assert_eq!(compiled.instructions.len(), 1);
        let only = &compiled.instructions[0];
        assert!(only.is_catch_all());
        assert_eq!(only.position, 1);
        assert_eq!(only.action, Action::Deny);
        assert_eq!(only.protocol, Protocol::Any);
    }

    #[test]
    fn test_fatal_conflict_names_both_rules() {
        let r1 = deny_tcp(1, &["10.0.0.0/8"], &[]);
        let r2 = allow_tcp(2, &["10.0.0.0/16"], &[80]);
        let policy = policy_with(DefaultAction::Deny, vec![r1.clone(), r2.clone()]);

        let err = compile(&policy, 1).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::FatalConflict);
        assert_eq!(err.conflicts.len(), 1);
        assert_eq!(err.conflicts[0].shadowing_rule_id, r1.id);
        assert_eq!(err.conflicts[0].shadowed_rule_id, r2.id);
        let msg = err.to_string();
        assert!(msg.contains(&r1.id.to_string()));
        assert!(msg.contains(&r2.id.to_string()));
    }

    #[test]
    fn test_redundant_rule_is_pruned() {
        let r1 = allow_tcp(1, &["0.0.0.0/0"], &[443]);
        let r2 = allow_tcp(2, &["0.0.0.0/0"], &[443]);
        let policy = policy_with(DefaultAction::Deny, vec![r1.clone(), r2]);

        let compiled = compile(&policy, 1).unwrap();
        assert_eq!(compiled.instructions.len(), 2);
        assert_eq!(compiled.instructions[0].rule_id, Some(r1.id));
        assert!(compiled.instructions[1].is_catch_all());
        assert_eq!(compiled.instructions[1].position, 2);
    }

    #[test]
    fn test_disabled_rules_never_appear() {
        let r1 = deny_tcp(1, &[], &[]).disabled();
        let r2 = allow_tcp(2, &[], &[80]);
        let policy = policy_with(DefaultAction::Deny, vec![r1.clone(), r2.clone()]);

        let compiled = compile(&policy, 1).unwrap();
        assert!(compiled.instructions.iter().all(|i| i.rule_id != Some(r1.id)));
        assert_eq!(compiled.instructions[0].rule_id, Some(r2.id));
        assert_eq!(compiled.instructions[0].position, 1);
    }

    #[test]
    fn test_invalid_rules_report_every_violation() {
        let bad1 = Rule::new(1, Protocol::Tcp, Action::Allow).with_sources(["10.0.0.1/8"]);
        let bad2 = Rule::new(2, Protocol::Icmp, Action::Allow).with_sources(["nope"]);
        let policy = policy_with(DefaultAction::Deny, vec![bad1, bad2]);

        let err = compile(&policy, 1).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::InvalidRule);
        assert_eq!(err.invalid_rules.len(), 2);
    }

    #[test]
    fn test_disabled_invalid_rule_does_not_block() {
        let bad = Rule::new(1, Protocol::Tcp, Action::Allow)
            .with_sources(["bogus"])
            .disabled();
        let policy = policy_with(DefaultAction::Allow, vec![bad]);
        assert!(compile(&policy, 1).is_ok());
    }

    #[test]
    fn test_positions_must_be_dense() {
        let mut policy = policy_with(DefaultAction::Deny, vec![allow_tcp(1, &[], &[80])]);
        policy.rules.push(allow_tcp(3, &[], &[443]));
        let err = compile(&policy, 1).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::InvalidRule);
        assert!(err.details[0].contains("dense"));
    }

    #[test]
    fn test_instructions_are_canonical() {
        let rule = allow_tcp(1, &["192.168.0.0/16", "10.0.0.0/8", "10.0.0.0/8"], &[81, 80, 443]);
        let policy = policy_with(DefaultAction::Deny, vec![rule]);
        let compiled = compile(&policy, 1).unwrap();
        let first = &compiled.instructions[0];
        assert_eq!(first.sources, vec!["10.0.0.0/8", "192.168.0.0/16"]);
        assert_eq!(
            first.destination_ports,
            vec![
                PortSpan { start: 80, end: 81 },
                PortSpan {
                    start: 443,
                    end: 443
                }
            ]
        );
    }

    #[test]
    fn test_checksum_verification() {
        let policy = policy_with(DefaultAction::Deny, vec![allow_tcp(1, &[], &[80])]);
        let mut compiled = compile(&policy, 4).unwrap();
        assert!(compiled.verify_checksum());
        assert_eq!(compiled.checksum.len(), 64);
        assert_eq!(compiled.version.version, 4);
        compiled.instructions[0].action = Action::Deny;
        assert!(!compiled.verify_checksum());
    }

    #[test]
    fn test_delivery_order_puts_restrictive_first() {
        let policy = policy_with(
            DefaultAction::Deny,
            vec![
                allow_tcp(1, &[], &[80]),
                deny_tcp(2, &[], &[23]),
                allow_tcp(3, &[], &[443]),
            ],
        );
        let compiled = compile(&policy, 1).unwrap();
        let order: Vec<u32> = compiled.delivery_order().iter().map(|i| i.position).collect();
        assert_eq!(order, vec![2, 4, 1, 3]);
    }
}
