//! nftables renderers for compiled instructions
//!
//! Both renderers build a single `inet fireflow` table with one filter chain
//! whose policy equals the catch-all action. Instructions are emitted in
//! position order whatever order they are passed in, so a target receiving
//! them in delivery order still installs the right sequence.
//!
//! nftables matches addresses per family (`ip saddr` / `ip6 saddr`), so an
//! instruction whose CIDR lists mix families expands to one nft rule per
//! family it can match.

use crate::core::compile::{CompiledPolicy, Instruction};
use crate::core::model::{Action, Protocol};
use crate::core::rule_constraints::AddressFamily;
use crate::core::validate::PortSpan;
use ipnetwork::IpNetwork;
use serde_json::{Value, json};
use std::fmt::{self, Write};

pub const TABLE_NAME: &str = "fireflow";
pub const CHAIN_NAME: &str = "filter";
const LOG_PREFIX: &str = "fireflow: ";

impl CompiledPolicy {
    pub fn to_nftables_json(&self) -> Value {
        instructions_to_json(&self.instructions)
    }

    pub fn to_nft_text(&self) -> String {
        instructions_to_text(&self.instructions)
    }
}

/// One family-specific expansion of an instruction
struct Expansion<'a> {
    family: Option<AddressFamily>,
    sources: Vec<&'a str>,
    destinations: Vec<&'a str>,
}

/// `None` for text that is not a network; such entries match no family.
fn family_of(cidr: &str) -> Option<AddressFamily> {
    cidr.parse::<IpNetwork>().ok().map(|network| AddressFamily::of(&network))
}

fn expand(instruction: &Instruction) -> Vec<Expansion<'_>> {
    if instruction.sources.is_empty() && instruction.destinations.is_empty() {
        return vec![Expansion {
            family: None,
            sources: Vec::new(),
            destinations: Vec::new(),
        }];
    }
    AddressFamily::ALL
        .into_iter()
        .filter_map(|family| {
            Some(Expansion {
                family: Some(family),
                sources: pick(&instruction.sources, family)?,
                destinations: pick(&instruction.destinations, family)?,
            })
        })
        .collect()
}

/// CIDRs of `list` in `family`; `None` when the list excludes the family.
fn pick(list: &[String], family: AddressFamily) -> Option<Vec<&str>> {
    if list.is_empty() {
        return Some(Vec::new());
    }
    let matching: Vec<&str> = list
        .iter()
        .map(String::as_str)
        .filter(|c| family_of(c) == Some(family))
        .collect();
    (!matching.is_empty()).then_some(matching)
}

fn sorted(instructions: &[Instruction]) -> Vec<&Instruction> {
    let mut ordered: Vec<&Instruction> = instructions.iter().collect();
    ordered.sort_by_key(|i| i.position);
    ordered
}

fn chain_policy(instructions: &[Instruction]) -> &'static str {
    match instructions.iter().find(|i| i.is_catch_all()).map(|i| i.action) {
        Some(Action::Allow) => "accept",
        _ => "drop",
    }
}

fn comment(instruction: &Instruction) -> String {
    match (instruction.rule_id, instruction.label.is_empty()) {
        (None, _) => format!("#{} default", instruction.position),
        (Some(_), true) => format!("#{}", instruction.position),
        (Some(_), false) => format!("#{} {}", instruction.position, instruction.label),
    }
}

fn addr_protocol(family: AddressFamily) -> &'static str {
    match family {
        AddressFamily::V4 => "ip",
        AddressFamily::V6 => "ip6",
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// JSON
// ═══════════════════════════════════════════════════════════════════════════

/// Creates a match expression for nft meta keys
fn meta_match(key: &str, value: impl serde::Serialize) -> Value {
    json!({
        "match": {
            "left": { "meta": { "key": key } },
            "op": "==",
            "right": value
        }
    })
}

fn payload_match(protocol: &str, field: &str, right: Value) -> Value {
    json!({
        "match": {
            "left": { "payload": { "protocol": protocol, "field": field } },
            "op": "==",
            "right": right
        }
    })
}

fn json_set<T: serde::Serialize>(values: &[T]) -> Value {
    if let [single] = values {
        json!(single)
    } else {
        json!({ "set": values })
    }
}

fn json_ports(spans: &[PortSpan]) -> Value {
    let values: Vec<Value> = spans
        .iter()
        .map(|s| {
            if s.is_single() {
                json!(s.start)
            } else {
                json!({ "range": [s.start, s.end] })
            }
        })
        .collect();
    json_set(&values)
}

fn protocol_json(protocol: Protocol, family: Option<AddressFamily>) -> Option<Value> {
    match (protocol, family) {
        (Protocol::Any, _) => None,
        (Protocol::Tcp | Protocol::Udp, _) => Some(meta_match("l4proto", protocol.as_str())),
        (Protocol::Icmp, Some(AddressFamily::V4)) => Some(meta_match("l4proto", "icmp")),
        (Protocol::Icmp, Some(AddressFamily::V6)) => Some(meta_match("l4proto", "ipv6-icmp")),
        (Protocol::Icmp, None) => Some(meta_match(
            "l4proto",
            json!({ "set": ["icmp", "ipv6-icmp"] }),
        )),
    }
}

fn verdict_json(action: Action) -> Value {
    match action {
        Action::Allow => json!({ "accept": null }),
        Action::Deny => json!({ "drop": null }),
        Action::Reject => json!({ "reject": null }),
        Action::Log => json!({ "log": { "prefix": LOG_PREFIX } }),
    }
}

fn add_instruction_json(nft: &mut Vec<Value>, instruction: &Instruction) {
    for expansion in expand(instruction) {
        let mut expr = Vec::with_capacity(7);
        if let Some(e) = protocol_json(instruction.protocol, expansion.family) {
            expr.push(e);
        }
        if let Some(family) = expansion.family {
            if !expansion.sources.is_empty() {
                expr.push(payload_match(
                    addr_protocol(family),
                    "saddr",
                    json_set(&expansion.sources),
                ));
            }
            if !expansion.destinations.is_empty() {
                expr.push(payload_match(
                    addr_protocol(family),
                    "daddr",
                    json_set(&expansion.destinations),
                ));
            }
        }
        if matches!(instruction.protocol, Protocol::Tcp | Protocol::Udp) {
            let proto = instruction.protocol.as_str();
            if !instruction.source_ports.is_empty() {
                expr.push(payload_match(proto, "sport", json_ports(&instruction.source_ports)));
            }
            if !instruction.destination_ports.is_empty() {
                expr.push(payload_match(
                    proto,
                    "dport",
                    json_ports(&instruction.destination_ports),
                ));
            }
        }
        expr.push(json!({ "counter": null }));
        expr.push(verdict_json(instruction.action));

        nft.push(json!({
            "add": {
                "rule": {
                    "family": "inet",
                    "table": TABLE_NAME,
                    "chain": CHAIN_NAME,
                    "expr": expr,
                    "comment": comment(instruction)
                }
            }
        }));
    }
}

/// Builds an nftables JSON batch that replaces the `fireflow` table.
pub fn instructions_to_json(instructions: &[Instruction]) -> Value {
    let mut nft = Vec::with_capacity(3 + instructions.len());
    nft.push(json!({ "add": { "table": { "family": "inet", "name": TABLE_NAME } } }));
    nft.push(json!({ "flush": { "table": { "family": "inet", "name": TABLE_NAME } } }));
    nft.push(json!({
        "add": {
            "chain": {
                "family": "inet",
                "table": TABLE_NAME,
                "name": CHAIN_NAME,
                "type": "filter",
                "hook": "input",
                "prio": 0,
                "policy": chain_policy(instructions)
            }
        }
    }));
    for instruction in sorted(instructions) {
        add_instruction_json(&mut nft, instruction);
    }
    json!({ "nftables": nft })
}

// ═══════════════════════════════════════════════════════════════════════════
// Text
// ═══════════════════════════════════════════════════════════════════════════

fn text_set<T: std::fmt::Display>(values: &[T]) -> String {
    match values {
        [single] => single.to_string(),
        _ => {
            let items: Vec<String> = values.iter().map(ToString::to_string).collect();
            format!("{{ {} }}", items.join(", "))
        }
    }
}

fn verdict_text(action: Action) -> String {
    match action {
        Action::Allow => "accept".to_string(),
        Action::Deny => "drop".to_string(),
        Action::Reject => "reject".to_string(),
        Action::Log => format!("log prefix \"{LOG_PREFIX}\""),
    }
}

/// Human-readable .nft preview, equivalent to [`instructions_to_json`].
pub fn instructions_to_text(instructions: &[Instruction]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "table inet {TABLE_NAME} {{");
    let _ = writeln!(out, "    chain {CHAIN_NAME} {{");
    let _ = writeln!(
        out,
        "        type filter hook input priority 0; policy {};",
        chain_policy(instructions)
    );

    for instruction in sorted(instructions) {
        for expansion in expand(instruction) {
            let _ = write!(out, "        ");
            match (instruction.protocol, expansion.family) {
                (Protocol::Any, _) => {}
                (Protocol::Tcp | Protocol::Udp, _) => {
                    let _ = write!(out, "meta l4proto {} ", instruction.protocol);
                }
                (Protocol::Icmp, Some(AddressFamily::V4)) => {
                    let _ = write!(out, "meta l4proto icmp ");
                }
                (Protocol::Icmp, Some(AddressFamily::V6)) => {
                    let _ = write!(out, "meta l4proto ipv6-icmp ");
                }
                (Protocol::Icmp, None) => {
                    let _ = write!(out, "meta l4proto {{ icmp, ipv6-icmp }} ");
                }
            }
            if let Some(family) = expansion.family {
                let proto = addr_protocol(family);
                if !expansion.sources.is_empty() {
                    let _ = write!(out, "{proto} saddr {} ", text_set(&expansion.sources));
                }
                if !expansion.destinations.is_empty() {
                    let _ = write!(out, "{proto} daddr {} ", text_set(&expansion.destinations));
                }
            }
            if matches!(instruction.protocol, Protocol::Tcp | Protocol::Udp) {
                if !instruction.source_ports.is_empty() {
                    let _ = write!(
                        out,
                        "{} sport {} ",
                        instruction.protocol,
                        text_set(&instruction.source_ports)
                    );
                }
                if !instruction.destination_ports.is_empty() {
                    let _ = write!(
                        out,
                        "{} dport {} ",
                        instruction.protocol,
                        text_set(&instruction.destination_ports)
                    );
                }
            }
            let _ = writeln!(
                out,
                "counter {} comment \"{}\"",
                verdict_text(instruction.action),
                comment(instruction)
            );
        }
    }

    let _ = writeln!(out, "    }}");
    let _ = writeln!(out, "}}");
    out
}

/// One line per instruction in position order, for terminal output.
pub fn instructions_summary(instructions: &[Instruction]) -> String {
    let mut out = String::new();
    for instruction in sorted(instructions) {
        let _ = writeln!(out, "{instruction}");
    }
    out
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let any = |list: &[String]| {
            if list.is_empty() {
                "any".to_string()
            } else {
                list.join(",")
            }
        };
        write!(f, "{:>4}. {:<6} ", self.position, self.action.as_str())?;
        if self.is_catch_all() {
            return f.write_str("everything else");
        }
        write!(
            f,
            "{} from {} to {}",
            self.protocol,
            any(&self.sources),
            any(&self.destinations)
        )?;
        if !self.source_ports.is_empty() {
            write!(f, " sport {}", join_spans(&self.source_ports))?;
        }
        if !self.destination_ports.is_empty() {
            write!(f, " dport {}", join_spans(&self.destination_ports))?;
        }
        if !self.label.is_empty() {
            write!(f, " ({})", self.label)?;
        }
        Ok(())
    }
}

fn join_spans(spans: &[PortSpan]) -> String {
    spans
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Line diff of two nft renderings, `None` when they are identical.
pub fn diff_nft(old: &CompiledPolicy, new: &CompiledPolicy) -> Option<String> {
    let old_text = old.to_nft_text();
    let new_text = new.to_nft_text();
    if old_text == new_text {
        return None;
    }

    let diff = similar::TextDiff::from_lines(&old_text, &new_text);
    let mut result = String::new();
    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            similar::ChangeTag::Delete => "- ",
            similar::ChangeTag::Insert => "+ ",
            similar::ChangeTag::Equal => "  ",
        };
        let _ = write!(result, "{sign}{change}");
    }
    Some(result)
}
