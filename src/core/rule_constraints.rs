//! Rule constraint functions
//!
//! This module centralizes business logic about valid field combinations
//! for policy rules. The validator, the match-space builder and the
//! renderers all consult it so they agree on what a rule means.
//!
//! # Examples
//!
//! ```
//! use fireflow::core::model::Protocol;
//! use fireflow::core::rule_constraints::*;
//!
//! // Check if a protocol supports port filtering
//! assert!(protocol_supports_ports(Protocol::Tcp));
//! assert!(!protocol_supports_ports(Protocol::Icmp));
//!
//! // An empty CIDR list allows both families
//! assert_eq!(families_of(&[]), FamilySet::BOTH);
//! ```

use super::model::Protocol;
use ipnetwork::IpNetwork;

/// Highest valid port number
pub const MAX_PORT: u32 = 65_535;

// ═══════════════════════════════════════════════════════════════════════════
// Protocol Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// Returns `true` if the protocol supports port filtering.
///
/// Only TCP and UDP use ports. ICMP and "any" rules must leave both port
/// sets empty.
///
/// # Examples
///
/// ```
/// use fireflow::core::model::Protocol;
/// use fireflow::core::rule_constraints::protocol_supports_ports;
///
/// assert!(protocol_supports_ports(Protocol::Tcp));
/// assert!(protocol_supports_ports(Protocol::Udp));
/// assert!(!protocol_supports_ports(Protocol::Any));
/// assert!(!protocol_supports_ports(Protocol::Icmp));
/// ```
#[inline]
pub fn protocol_supports_ports(protocol: Protocol) -> bool {
    matches!(protocol, Protocol::Tcp | Protocol::Udp)
}

/// Returns `true` if a port bound is representable on the wire.
#[inline]
pub fn port_in_range(port: u32) -> bool {
    port <= MAX_PORT
}

// ═══════════════════════════════════════════════════════════════════════════
// Address Family Constraints
// ═══════════════════════════════════════════════════════════════════════════

/// IP address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display)]
pub enum AddressFamily {
    #[strum(serialize = "ipv4")]
    V4,
    #[strum(serialize = "ipv6")]
    V6,
}

impl AddressFamily {
    pub const ALL: [AddressFamily; 2] = [AddressFamily::V4, AddressFamily::V6];

    /// Largest address value in this family, as a `u128`.
    pub const fn max_address(self) -> u128 {
        match self {
            AddressFamily::V4 => u32::MAX as u128,
            AddressFamily::V6 => u128::MAX,
        }
    }

    pub fn of(network: &IpNetwork) -> Self {
        if network.is_ipv4() {
            AddressFamily::V4
        } else {
            AddressFamily::V6
        }
    }
}

/// Set of address families a CIDR list can match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilySet {
    pub v4: bool,
    pub v6: bool,
}

impl FamilySet {
    pub const BOTH: FamilySet = FamilySet { v4: true, v6: true };
    pub const NONE: FamilySet = FamilySet {
        v4: false,
        v6: false,
    };

    pub fn contains(self, family: AddressFamily) -> bool {
        match family {
            AddressFamily::V4 => self.v4,
            AddressFamily::V6 => self.v6,
        }
    }

    pub fn intersect(self, other: FamilySet) -> FamilySet {
        FamilySet {
            v4: self.v4 && other.v4,
            v6: self.v6 && other.v6,
        }
    }

    pub fn is_empty(self) -> bool {
        !self.v4 && !self.v6
    }
}

/// Returns the families a CIDR list matches. An empty list means any address.
///
/// # Examples
///
/// ```
/// use fireflow::core::rule_constraints::{families_of, FamilySet};
/// use ipnetwork::IpNetwork;
///
/// let v4: IpNetwork = "10.0.0.0/8".parse().unwrap();
/// assert_eq!(families_of(&[v4]), FamilySet { v4: true, v6: false });
/// ```
pub fn families_of(networks: &[IpNetwork]) -> FamilySet {
    if networks.is_empty() {
        return FamilySet::BOTH;
    }
    networks
        .iter()
        .fold(FamilySet::NONE, |acc, net| match AddressFamily::of(net) {
            AddressFamily::V4 => FamilySet { v4: true, ..acc },
            AddressFamily::V6 => FamilySet { v6: true, ..acc },
        })
}

/// Returns `true` if the network address has no host bits set beyond the prefix.
///
/// # Examples
///
/// ```
/// use fireflow::core::rule_constraints::is_normalized;
/// use ipnetwork::IpNetwork;
///
/// assert!(is_normalized(&"10.0.0.0/8".parse::<IpNetwork>().unwrap()));
/// assert!(!is_normalized(&"10.0.0.1/8".parse::<IpNetwork>().unwrap()));
/// ```
#[inline]
pub fn is_normalized(network: &IpNetwork) -> bool {
    network.network() == network.ip()
}

/// Returns the canonical (host bits cleared) form of a network.
pub fn canonical_network(network: &IpNetwork) -> IpNetwork {
    IpNetwork::new(network.network(), network.prefix()).unwrap_or(*network)
}

/// Inclusive numeric address range covered by a network.
pub fn network_bounds(network: &IpNetwork) -> (u128, u128) {
    match network {
        IpNetwork::V4(net) => {
            let start = u32::from(net.network());
            let host = u32::MAX.checked_shr(u32::from(net.prefix())).unwrap_or(0);
            (u128::from(start), u128::from(start | host))
        }
        IpNetwork::V6(net) => {
            let start = u128::from(net.network());
            let host = u128::MAX.checked_shr(u32::from(net.prefix())).unwrap_or(0);
            (start, start | host)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn test_protocol_supports_ports() {
        assert!(protocol_supports_ports(Protocol::Tcp));
        assert!(protocol_supports_ports(Protocol::Udp));
        assert!(!protocol_supports_ports(Protocol::Any));
        assert!(!protocol_supports_ports(Protocol::Icmp));
    }

    #[test]
    fn test_port_bounds() {
        assert!(port_in_range(0));
        assert!(port_in_range(65_535));
        assert!(!port_in_range(65_536));
    }

    #[test]
    fn test_families_of_mixed_list() {
        let set = families_of(&[net("10.0.0.0/8"), net("2001:db8::/32")]);
        assert_eq!(set, FamilySet::BOTH);
        assert!(!families_of(&[net("2001:db8::/32")]).contains(AddressFamily::V4));
    }

    #[test]
    fn test_family_intersection_can_be_empty() {
        let v4 = families_of(&[net("10.0.0.0/8")]);
        let v6 = families_of(&[net("2001:db8::/32")]);
        assert!(v4.intersect(v6).is_empty());
        assert!(!v4.intersect(FamilySet::BOTH).is_empty());
    }

    #[test]
    fn test_bare_address_is_host_route() {
        let host = net("192.168.1.10");
        assert_eq!(host.prefix(), 32);
        assert!(is_normalized(&host));
        let (start, end) = network_bounds(&host);
        assert_eq!(start, end);
    }

    #[test]
    fn test_network_bounds_v4() {
        let (start, end) = network_bounds(&net("10.0.0.0/8"));
        assert_eq!(start, u128::from(u32::from(std::net::Ipv4Addr::new(10, 0, 0, 0))));
        assert_eq!(end, u128::from(u32::from(std::net::Ipv4Addr::new(10, 255, 255, 255))));
    }

    #[test]
    fn test_network_bounds_full_ranges() {
        assert_eq!(network_bounds(&net("0.0.0.0/0")), (0, u128::from(u32::MAX)));
        assert_eq!(network_bounds(&net("::/0")), (0, u128::MAX));
    }

    #[test]
    fn test_canonical_network_clears_host_bits() {
        assert_eq!(canonical_network(&net("10.1.2.3/8")).to_string(), "10.0.0.0/8");
        assert_eq!(
            canonical_network(&net("2001:db8::1/32")).to_string(),
            "2001:db8::/32"
        );
    }
}
