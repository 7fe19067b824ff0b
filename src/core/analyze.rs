//! Conflict and shadow analysis over an ordered rule list
//!
//! Rules are walked in position order while an accumulated covered space is
//! kept as disjoint regions, each owned by the first terminal rule that
//! matched it. For every enabled rule:
//!
//! - remaining = rule space − covered
//! - remaining empty: **full** shadow, reported against the earliest
//!   covering rule with every covering rule listed
//! - remaining non-empty but the rule touches covered space: **partial**
//!
//! Only terminal actions (`allow`, `deny`, `reject`) add to the covered space.
//! A `log` rule never hides later rules.

use crate::core::match_space::{MatchSpace, Partition, Region};
use crate::core::model::{Action, Rule};
use crate::core::validate::{CheckedRule, validate};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum OverlapKind {
    #[strum(serialize = "full")]
    Full,
    #[strum(serialize = "partial")]
    Partial,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Redundant rule, safe to prune
    #[strum(serialize = "info")]
    Info,
    /// Partial overlap, advisory only
    #[strum(serialize = "warning")]
    Warning,
    /// Rule can never fire and earlier rules act differently on its traffic
    #[strum(serialize = "error")]
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Earliest rule covering part of the shadowed rule
    pub shadowing_rule_id: Uuid,
    pub shadowed_rule_id: Uuid,
    /// Every rule owning part of the overlap, in position order
    pub covering_rule_ids: Vec<Uuid>,
    pub shadowing_position: u32,
    pub shadowed_position: u32,
    pub overlap: OverlapKind,
    pub severity: Severity,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.overlap {
            OverlapKind::Full => "is fully shadowed by",
            OverlapKind::Partial => "partially overlaps",
        };
        write!(
            f,
            "[{}] rule #{} ({}) {} rule #{} ({})",
            self.severity,
            self.shadowed_position,
            self.shadowed_rule_id,
            verb,
            self.shadowing_position,
            self.shadowing_rule_id
        )?;
        if self.covering_rule_ids.len() > 1 {
            write!(f, " and {} other rule(s)", self.covering_rule_ids.len() - 1)?;
        }
        Ok(())
    }
}

/// Result of analyzing a policy. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub findings: Vec<Finding>,
    /// Enabled rules that failed validation and were left out of the analysis
    pub skipped: Vec<Uuid>,
}

impl ConflictReport {
    pub fn errors(&self) -> impl Iterator<Item = &Finding> {
        self.by_severity(Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.by_severity(Severity::Warning)
    }

    /// Ids of fully shadowed rules that can be dropped without changing behavior.
    pub fn redundant(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.by_severity(Severity::Info).map(|f| f.shadowed_rule_id)
    }

    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty() && self.skipped.is_empty()
    }

    fn by_severity(&self, severity: Severity) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(move |f| f.severity == severity)
    }
}

/// Analyzes stored rules. Rules are ordered by position first; disabled
/// rules are ignored and invalid ones are listed in [`ConflictReport::skipped`].
pub fn analyze(rules: &[Rule]) -> ConflictReport {
    let mut ordered: Vec<&Rule> = rules.iter().filter(|r| r.enabled).collect();
    ordered.sort_by_key(|r| r.position);

    let mut skipped = Vec::new();
    let checked: Vec<CheckedRule> = ordered
        .into_iter()
        .filter_map(|r| match validate(r) {
            Ok(c) => Some(c),
            Err(_) => {
                skipped.push(r.id);
                None
            }
        })
        .collect();

    let mut report = analyze_checked(&checked);
    report.skipped = skipped;
    report
}

/// Analyzes rules that already passed validation, in the order given.
pub fn analyze_checked(rules: &[CheckedRule]) -> ConflictReport {
    let mut covered: Vec<(Partition, Region, usize)> = Vec::new();
    let mut findings = Vec::new();

    for (idx, rule) in rules.iter().enumerate() {
        if !rule.enabled {
            continue;
        }
        let space = MatchSpace::of(rule);

        let mut remaining = space.clone();
        let mut owners: Vec<usize> = Vec::new();
        for (partition, region, owner) in &covered {
            if space.overlaps_region(partition, region) {
                if !owners.contains(owner) {
                    owners.push(*owner);
                }
                remaining.subtract_region(partition, region);
            }
        }

        if !owners.is_empty() {
            owners.sort_unstable();
            let overlap = if remaining.is_empty() {
                OverlapKind::Full
            } else {
                OverlapKind::Partial
            };
            findings.push(finding(rules, idx, &owners, overlap));
        }

        if rule.action.is_terminal() {
            for (partition, region) in remaining.regions() {
                covered.push((*partition, region.clone(), idx));
            }
        }
    }

    ConflictReport {
        findings,
        skipped: Vec::new(),
    }
}

fn finding(rules: &[CheckedRule], idx: usize, owners: &[usize], overlap: OverlapKind) -> Finding {
    let shadowed = &rules[idx];
    let first = &rules[owners[0]];
    let severity = match overlap {
        OverlapKind::Partial => Severity::Warning,
        OverlapKind::Full if owners.iter().all(|&o| same_effect(rules[o].action, shadowed.action)) => {
            Severity::Info
        }
        OverlapKind::Full => Severity::Error,
    };
    Finding {
        shadowing_rule_id: first.id,
        shadowed_rule_id: shadowed.id,
        covering_rule_ids: owners.iter().map(|&o| rules[o].id).collect(),
        shadowing_position: first.position,
        shadowed_position: shadowed.position,
        overlap,
        severity,
    }
}

fn same_effect(covering: Action, shadowed: Action) -> bool {
    covering == shadowed
}
