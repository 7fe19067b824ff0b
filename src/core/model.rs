//! Firewall, policy and rule data structures
//!
//! This module defines the persisted domain entities the engine works on.
//!
//! # Rule Structure
//!
//! A [`Rule`] is the user-edited definition of a single match + action unit:
//! - Source and destination CIDR sets (empty = any address)
//! - Source and destination port range sets (empty = any port)
//! - Protocol (TCP, UDP, ICMP, or any)
//! - Action (allow, deny, log, reject)
//! - Position inside its policy (1-based, dense, first match wins)
//! - Enable/disable state
//!
//! Rules are stored as supplied: CIDRs stay strings and port bounds stay `u32`,
//! so that [`crate::core::validate::validate`] can report every problem at once
//! instead of failing at deserialization time.
//!
//! # Limits
//!
//! Policies are limited to [`MAX_RULES`] rules.
//!
//! # Example
//!
//! ```
//! use fireflow::core::model::{Action, PortRange, Protocol, Rule};
//!
//! let rule = Rule::new(1, Protocol::Tcp, Action::Allow)
//!     .with_sources(["10.0.0.0/8"])
//!     .with_destination_ports([PortRange::single(443)]);
//! assert!(rule.enabled);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum number of rules allowed in a single policy
///
/// Analysis is quadratic-ish in the rule count; a few thousand rules is the
/// intended ceiling.
pub const MAX_RULES: usize = 4000;

/// Network protocol matched by a rule
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Match all protocols
    #[default]
    #[strum(serialize = "any")]
    Any,
    /// Transmission Control Protocol
    #[strum(serialize = "tcp")]
    Tcp,
    /// User Datagram Protocol
    #[strum(serialize = "udp")]
    Udp,
    /// Internet Control Message Protocol (ICMPv6 on IPv6 addresses)
    #[strum(serialize = "icmp")]
    Icmp,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Any => "any",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }
}

/// Port range as supplied by the caller. Bounds are checked by the validator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PortRange {
    pub start: u32,
    pub end: u32,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: u32::from(port),
            end: u32::from(port),
        }
    }

    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start: u32::from(start),
            end: u32::from(end),
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Rule action
///
/// `allow`, `deny` and `reject` terminate evaluation. `log` records the packet
/// and lets evaluation continue with the next rule.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[default]
    #[strum(serialize = "allow")]
    Allow,
    #[strum(serialize = "deny")]
    Deny,
    #[strum(serialize = "log")]
    Log,
    /// Deny and answer with an ICMP unreachable / TCP reset
    #[strum(serialize = "reject")]
    Reject,
}

impl Action {
    pub const fn as_str(self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Deny => "deny",
            Action::Log => "log",
            Action::Reject => "reject",
        }
    }

    /// Returns `true` if a match ends rule evaluation.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Action::Log)
    }

    /// Returns `true` for actions that narrow what the firewall lets through.
    pub const fn is_restrictive(self) -> bool {
        matches!(self, Action::Deny | Action::Reject)
    }
}

/// Action applied when no rule matches
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum DefaultAction {
    #[strum(serialize = "allow")]
    Allow,
    #[default]
    #[strum(serialize = "deny")]
    Deny,
}

impl DefaultAction {
    pub const fn as_action(self) -> Action {
        match self {
            DefaultAction::Allow => Action::Allow,
            DefaultAction::Deny => Action::Deny,
        }
    }
}

/// Priority given to new policies; lower values rank first
pub const DEFAULT_POLICY_PRIORITY: u32 = 100;

fn default_priority() -> u32 {
    DEFAULT_POLICY_PRIORITY
}

/// Whether a policy may be compiled
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
pub enum PolicyStatus {
    #[default]
    #[strum(serialize = "active")]
    Active,
    #[strum(serialize = "inactive")]
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rule {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// 1-based position inside the policy; first match wins. Documents may
    /// leave it out (0) to use file order.
    #[serde(default)]
    pub position: u32,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub protocol: Protocol,
    /// Source CIDRs; empty means any address
    #[serde(default)]
    pub sources: Vec<String>,
    /// Destination CIDRs; empty means any address
    #[serde(default)]
    pub destinations: Vec<String>,
    #[serde(default)]
    pub source_ports: Vec<PortRange>,
    #[serde(default)]
    pub destination_ports: Vec<PortRange>,
    #[serde(default)]
    pub action: Action,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Rule {
    /// Creates an enabled rule matching everything for `protocol`.
    pub fn new(position: u32, protocol: Protocol, action: Action) -> Self {
        Self {
            id: Uuid::new_v4(),
            position,
            label: String::new(),
            protocol,
            sources: Vec::new(),
            destinations: Vec::new(),
            source_ports: Vec::new(),
            destination_ports: Vec::new(),
            action,
            enabled: true,
            created_at: Utc::now(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = sources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_destinations<I, S>(mut self, destinations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.destinations = destinations.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_source_ports(mut self, ports: impl IntoIterator<Item = PortRange>) -> Self {
        self.source_ports = ports.into_iter().collect();
        self
    }

    pub fn with_destination_ports(mut self, ports: impl IntoIterator<Item = PortRange>) -> Self {
        self.destination_ports = ports.into_iter().collect();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

fn default_true() -> bool {
    true
}

/// Deployment environment of a managed firewall
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[strum(serialize = "production")]
    Production,
    #[strum(serialize = "staging")]
    Staging,
    #[default]
    #[strum(serialize = "development")]
    Development,
}

/// Lifecycle of a managed firewall. Transitions live in [`crate::core::state`].
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "kebab-case")]
pub enum FirewallState {
    /// Never submitted
    #[default]
    #[strum(serialize = "draft")]
    Draft,
    /// A submitted version is queued or being applied
    #[strum(serialize = "pending-apply")]
    PendingApply,
    /// The latest submitted version is active
    #[strum(serialize = "applied")]
    Applied,
    /// Application failed and no known-good version could be restored
    #[strum(serialize = "failed")]
    Failed,
    /// Application failed; the previous version was re-applied and is active
    #[strum(serialize = "rolled-back")]
    RolledBack,
}

/// Reference to one immutable compiled version of a policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyVersion {
    pub policy_id: Uuid,
    pub version: u64,
}

impl PolicyVersion {
    pub fn new(policy_id: Uuid, version: u64) -> Self {
        Self { policy_id, version }
    }
}

impl fmt::Display for PolicyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.policy_id, self.version)
    }
}

/// Time-bounded exclusive right to run an application task on a firewall
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lease {
    pub owner: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Opaque identity of the caller, supplied by the auth layer for auditing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Principal(pub String);

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Principal used for work the engine does on its own (recovery, rollback).
    pub fn system() -> Self {
        Self("system".to_string())
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Firewall {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub state: FirewallState,
    /// Currently active compiled policy
    #[serde(default)]
    pub applied: Option<PolicyVersion>,
    /// Most recent version submitted for application
    #[serde(default)]
    pub latest_submission: Option<PolicyVersion>,
    #[serde(default)]
    pub lease: Option<Lease>,
    /// Optimistic-concurrency counter, bumped by the store on every save
    #[serde(default)]
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Firewall {
    pub fn new(name: impl Into<String>, environment: Environment, scope: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            environment,
            scope: scope.into(),
            description: None,
            state: FirewallState::Draft,
            applied: None,
            latest_submission: None,
            lease: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns `true` if a live lease is held by someone other than `owner`.
    pub fn is_leased_by_other(&self, owner: Uuid, now: DateTime<Utc>) -> bool {
        self.lease
            .is_some_and(|lease| lease.owner != owner && !lease.is_expired(now))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilteringPolicy {
    pub id: Uuid,
    pub firewall_id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Ordered rules; position order is significant
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub default_action: DefaultAction,
    /// Listing order among the firewall's policies, lowest first
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Inactive policies are kept but refused by the compiler entry point
    #[serde(default)]
    pub status: PolicyStatus,
    /// Optimistic-concurrency counter; compiled snapshots reference it
    #[serde(default)]
    pub revision: u64,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl FilteringPolicy {
    pub fn new(firewall_id: Uuid, name: impl Into<String>, default_action: DefaultAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            firewall_id,
            name: name.into(),
            description: None,
            rules: Vec::new(),
            default_action,
            priority: DEFAULT_POLICY_PRIORITY,
            status: PolicyStatus::Active,
            revision: 0,
            created_at: Utc::now(),
        }
    }

    /// Rules sorted by position. Compilation and analysis always read this order.
    pub fn ordered_rules(&self) -> Vec<&Rule> {
        let mut rules: Vec<&Rule> = self.rules.iter().collect();
        rules.sort_by_key(|r| r.position);
        rules
    }

    pub fn enabled_count(&self) -> usize {
        self.rules.iter().filter(|r| r.enabled).count()
    }

    /// Inserts `rule` at its position (clamped to the end), shifting later rules down.
    pub fn insert_rule(&mut self, mut rule: Rule) {
        self.renumber();
        let len = u32::try_from(self.rules.len()).unwrap_or(u32::MAX);
        let position = rule.position.clamp(1, len.saturating_add(1));
        for existing in &mut self.rules {
            if existing.position >= position {
                existing.position += 1;
            }
        }
        rule.position = position;
        self.rules.push(rule);
        self.renumber();
    }

    /// Removes a rule by id and closes the gap. Returns the removed rule.
    pub fn remove_rule(&mut self, rule_id: Uuid) -> Option<Rule> {
        let idx = self.rules.iter().position(|r| r.id == rule_id)?;
        let removed = self.rules.remove(idx);
        self.renumber();
        Some(removed)
    }

    /// Moves a rule to `new_position` (clamped), keeping positions dense.
    pub fn move_rule(&mut self, rule_id: Uuid, new_position: u32) -> bool {
        self.renumber();
        let Some(idx) = self.rules.iter().position(|r| r.id == rule_id) else {
            return false;
        };
        let rule = self.rules.remove(idx);
        let target = usize::try_from(new_position.max(1) - 1)
            .unwrap_or(usize::MAX)
            .min(self.rules.len());
        self.rules.insert(target, rule);
        for (i, r) in self.rules.iter_mut().enumerate() {
            r.position = u32::try_from(i + 1).unwrap_or(u32::MAX);
        }
        true
    }

    /// Sorts by position and rewrites positions as 1..=n.
    pub fn renumber(&mut self) {
        self.rules.sort_by_key(|r| r.position);
        for (i, r) in self.rules.iter_mut().enumerate() {
            r.position = u32::try_from(i + 1).unwrap_or(u32::MAX);
        }
    }
}
