//! N-dimensional match space of a rule
//!
//! A rule matches a set of (protocol, source, destination, source port,
//! destination port) tuples. The space is partitioned by protocol class and
//! address family, and inside each partition it is a union of disjoint
//! [`Region`]s, each a product of four [`IntervalSet`]s.
//!
//! Subtracting one region from another splits the result dimension by
//! dimension, so every derived region stays disjoint from its siblings:
//!
//! ```text
//! A − B = (A.src − B.src) × A.dst × A.sp × A.dp
//!       ∪ (A.src ∩ B.src) × (A.dst − B.dst) × A.sp × A.dp
//!       ∪ (A.src ∩ B.src) × (A.dst ∩ B.dst) × (A.sp − B.sp) × A.dp
//!       ∪ (A.src ∩ B.src) × (A.dst ∩ B.dst) × (A.sp ∩ B.sp) × (A.dp − B.dp)
//! ```

use crate::core::interval::{Interval, IntervalSet};
use crate::core::model::Protocol;
use crate::core::rule_constraints::{AddressFamily, MAX_PORT, families_of, network_bounds};
use crate::core::validate::{CheckedRule, PortSpan};
use ipnetwork::IpNetwork;
use std::collections::BTreeMap;

/// Protocol class a packet falls into. `Other` covers everything a rule with
/// protocol `any` matches beyond TCP, UDP and ICMP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolClass {
    Tcp,
    Udp,
    Icmp,
    Other,
}

impl ProtocolClass {
    pub const ALL: [ProtocolClass; 4] = [
        ProtocolClass::Tcp,
        ProtocolClass::Udp,
        ProtocolClass::Icmp,
        ProtocolClass::Other,
    ];

    fn has_ports(self) -> bool {
        matches!(self, ProtocolClass::Tcp | ProtocolClass::Udp)
    }

    fn covered_by(protocol: Protocol) -> &'static [ProtocolClass] {
        match protocol {
            Protocol::Any => &Self::ALL,
            Protocol::Tcp => &[ProtocolClass::Tcp],
            Protocol::Udp => &[ProtocolClass::Udp],
            Protocol::Icmp => &[ProtocolClass::Icmp],
        }
    }
}

/// Key of one independent sub-space
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Partition {
    pub protocol: ProtocolClass,
    pub family: AddressFamily,
}

/// Product of four interval sets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub src: IntervalSet,
    pub dst: IntervalSet,
    pub src_ports: IntervalSet,
    pub dst_ports: IntervalSet,
}

impl Region {
    pub fn is_empty(&self) -> bool {
        self.src.is_empty()
            || self.dst.is_empty()
            || self.src_ports.is_empty()
            || self.dst_ports.is_empty()
    }

    pub fn intersection(&self, other: &Region) -> Region {
        Region {
            src: self.src.intersection(&other.src),
            dst: self.dst.intersection(&other.dst),
            src_ports: self.src_ports.intersection(&other.src_ports),
            dst_ports: self.dst_ports.intersection(&other.dst_ports),
        }
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        !self.intersection(other).is_empty()
    }

    /// Disjoint pieces covering `self − other`.
    pub fn subtract(&self, other: &Region) -> Vec<Region> {
        let common = self.intersection(other);
        if common.is_empty() {
            return vec![self.clone()];
        }

        let candidates = [
            Region {
                src: self.src.subtract(&other.src),
                ..self.clone()
            },
            Region {
                src: common.src.clone(),
                dst: self.dst.subtract(&other.dst),
                ..self.clone()
            },
            Region {
                src: common.src.clone(),
                dst: common.dst.clone(),
                src_ports: self.src_ports.subtract(&other.src_ports),
                dst_ports: self.dst_ports.clone(),
            },
            Region {
                src: common.src,
                dst: common.dst,
                src_ports: common.src_ports,
                dst_ports: self.dst_ports.subtract(&other.dst_ports),
            },
        ];
        candidates.into_iter().filter(|r| !r.is_empty()).collect()
    }
}

/// Union of disjoint regions per partition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchSpace {
    parts: BTreeMap<Partition, Vec<Region>>,
}

impl MatchSpace {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds the space matched by a checked rule.
    pub fn of(rule: &CheckedRule) -> Self {
        let families = families_of(&rule.sources).intersect(families_of(&rule.destinations));
        let mut parts = BTreeMap::new();

        for &protocol in ProtocolClass::covered_by(rule.protocol) {
            for family in AddressFamily::ALL {
                if !families.contains(family) {
                    continue;
                }
                let region = Region {
                    src: address_set(&rule.sources, family),
                    dst: address_set(&rule.destinations, family),
                    src_ports: port_set(protocol, &rule.source_ports),
                    dst_ports: port_set(protocol, &rule.destination_ports),
                };
                if !region.is_empty() {
                    parts.insert(Partition { protocol, family }, vec![region]);
                }
            }
        }
        Self { parts }
    }

    pub fn is_empty(&self) -> bool {
        self.parts.values().all(Vec::is_empty)
    }

    pub fn regions(&self) -> impl Iterator<Item = (&Partition, &Region)> {
        self.parts
            .iter()
            .flat_map(|(p, regions)| regions.iter().map(move |r| (p, r)))
    }

    /// Removes `region` (in `partition`) from this space.
    pub fn subtract_region(&mut self, partition: &Partition, region: &Region) {
        if let Some(regions) = self.parts.get_mut(partition) {
            let current = std::mem::take(regions);
            *regions = current
                .iter()
                .flat_map(|r| r.subtract(region))
                .collect();
        }
    }

    pub fn subtract(&self, other: &MatchSpace) -> MatchSpace {
        let mut out = self.clone();
        for (partition, region) in other.regions() {
            out.subtract_region(partition, region);
        }
        out.parts.retain(|_, regions| !regions.is_empty());
        out
    }

    pub fn overlaps_region(&self, partition: &Partition, region: &Region) -> bool {
        self.parts
            .get(partition)
            .is_some_and(|regions| regions.iter().any(|r| r.overlaps(region)))
    }

    pub fn overlaps(&self, other: &MatchSpace) -> bool {
        other
            .regions()
            .any(|(partition, region)| self.overlaps_region(partition, region))
    }

    /// Adds disjoint regions. Callers pass pieces already subtracted from `self`.
    pub fn extend_disjoint(&mut self, other: MatchSpace) {
        for (partition, regions) in other.parts {
            self.parts.entry(partition).or_default().extend(regions);
        }
    }
}

fn address_set(networks: &[IpNetwork], family: AddressFamily) -> IntervalSet {
    if networks.is_empty() {
        return IntervalSet::single(Interval::up_to(family.max_address()));
    }
    IntervalSet::from_intervals(
        networks
            .iter()
            .filter(|net| AddressFamily::of(net) == family)
            .filter_map(|net| {
                let (start, end) = network_bounds(net);
                Interval::new(start, end)
            }),
    )
}

fn port_set(protocol: ProtocolClass, spans: &[PortSpan]) -> IntervalSet {
    if !protocol.has_ports() || spans.is_empty() {
        return full_ports();
    }
    spans_to_set(spans)
}

pub(crate) fn full_ports() -> IntervalSet {
    IntervalSet::single(Interval::up_to(u128::from(MAX_PORT)))
}

/// Merges port spans into a normalized set.
pub(crate) fn spans_to_set(spans: &[PortSpan]) -> IntervalSet {
    IntervalSet::from_intervals(
        spans
            .iter()
            .filter_map(|s| Interval::new(u128::from(s.start), u128::from(s.end))),
    )
}

/// Converts a normalized port set back into spans.
pub(crate) fn set_to_spans(set: &IntervalSet) -> Vec<PortSpan> {
    set.intervals()
        .iter()
        .map(|i| PortSpan {
            start: u16::try_from(i.start()).unwrap_or(u16::MAX),
            end: u16::try_from(i.end()).unwrap_or(u16::MAX),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{Action, Rule};
    use crate::core::test_helpers::{allow_tcp, checked};
    use crate::core::validate::validate;

    fn space(rule: &Rule) -> MatchSpace {
        MatchSpace::of(&validate(rule).unwrap())
    }

    #[test]
    fn test_any_protocol_covers_every_partition() {
        let s = space(&Rule::new(1, Protocol::Any, Action::Deny));
        assert_eq!(s.regions().count(), 8);
    }

    #[test]
    fn test_v4_sources_limit_family() {
        let s = space(&allow_tcp(1, &["10.0.0.0/8"], &[80]));
        let partitions: Vec<Partition> = s.regions().map(|(p, _)| *p).collect();
        assert_eq!(
            partitions,
            vec![Partition {
                protocol: ProtocolClass::Tcp,
                family: AddressFamily::V4
            }]
        );
    }

    #[test]
    fn test_subset_rule_is_fully_covered() {
        let wide = space(&allow_tcp(1, &["10.0.0.0/8"], &[]));
        let narrow = space(&allow_tcp(2, &["10.1.0.0/16"], &[80, 443]));
        assert!(narrow.subtract(&wide).is_empty());
        assert!(!wide.subtract(&narrow).is_empty());
    }

    #[test]
    fn test_disjoint_ports_do_not_overlap() {
        let a = space(&allow_tcp(1, &[], &[80]));
        let b = space(&allow_tcp(2, &[], &[443]));
        assert!(!a.overlaps(&b));
        assert_eq!(a.subtract(&b), a);
    }

    #[test]
    fn test_partial_overlap_leaves_remainder() {
        let a = space(&allow_tcp(1, &["10.0.0.0/8"], &[]));
        let b = space(&allow_tcp(2, &["0.0.0.0/0"], &[22]));
        assert!(a.overlaps(&b));
        let rest = b.subtract(&a);
        assert!(!rest.is_empty());
        // What is left never intersects what was removed
        assert!(!rest.overlaps(&a));
    }

    #[test]
    fn test_union_of_two_rules_covers_third() {
        let low = space(&allow_tcp(1, &["10.0.0.0/9"], &[]));
        let high = space(&allow_tcp(2, &["10.128.0.0/9"], &[]));
        let all = space(&allow_tcp(3, &["10.0.0.0/8"], &[]));
        assert!(all.subtract(&low).subtract(&high).is_empty());
    }

    #[test]
    fn test_region_subtract_pieces_are_disjoint() {
        let rule = checked(&allow_tcp(1, &["10.0.0.0/8"], &[]));
        let hole = checked(&allow_tcp(2, &["10.0.0.0/16"], &[22]));
        let a = MatchSpace::of(&rule);
        let b = MatchSpace::of(&hole);
        let (_, ra) = a.regions().next().unwrap();
        let (_, rb) = b.regions().next().unwrap();
        let pieces = ra.subtract(rb);
        for (i, x) in pieces.iter().enumerate() {
            assert!(!x.overlaps(rb));
            for y in &pieces[i + 1..] {
                assert!(!x.overlaps(y));
            }
        }
    }

    #[test]
    fn test_spans_round_trip_merges() {
        let set = spans_to_set(&[
            PortSpan { start: 80, end: 80 },
            PortSpan { start: 81, end: 90 },
            PortSpan { start: 22, end: 22 },
        ]);
        assert_eq!(
            set_to_spans(&set),
            vec![PortSpan { start: 22, end: 22 }, PortSpan { start: 80, end: 90 }]
        );
    }
}
