//! RFC 6724 destination address ordering.
//!
//! When a hostname resolves to a mix of IPv4 and IPv6 addresses, the
//! caller wants them in the order it should try them. RFC 6724 section 6
//! defines that order in terms of the source address the host would use
//! to reach each destination. This module implements the rule subset
//! that matters for a resolver that has no interface configuration of
//! its own: unusable destinations last (rule 1), matching scope (rule
//! 2), matching label (rule 5), higher precedence (rule 6), smaller
//! scope (rule 8), longest matching prefix (rule 9), and stable order
//! for equal keys (rule 10).
//!
//! Discovering the source address for a destination is a question only
//! the host can answer; [`SourceAddrLookup`] is the seam. The system
//! implementation connects a UDP socket, which selects a route and a
//! source address without sending a single packet.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::cmp::Ordering;
use std::net::{IpAddr, Ipv6Addr, SocketAddr, UdpSocket};

use tracing::trace;

//------------ SourceAddrLookup ----------------------------------------------

/// Answers which local address would be used to reach a destination.
pub trait SourceAddrLookup: Send + Sync {
    /// Returns the source address for a destination, if it is reachable
    /// at all.
    fn source_addr_for(&self, dest: &SocketAddr) -> Option<IpAddr>;
}

//------------ SystemSourceAddrLookup ----------------------------------------

/// Source address discovery through the host routing table.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemSourceAddrLookup;

impl SourceAddrLookup for SystemSourceAddrLookup {
    fn source_addr_for(&self, dest: &SocketAddr) -> Option<IpAddr> {
        let bind_addr: SocketAddr = if dest.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).ok()?;
        socket.connect(dest).ok()?;
        socket.local_addr().ok().map(|addr| addr.ip())
    }
}

//------------ sort_destinations ---------------------------------------------

/// Orders destinations by RFC 6724 preference, most preferred first.
///
/// The sort is stable: destinations with equal keys keep their input
/// order.
pub fn sort_destinations(
    addrs: &mut Vec<SocketAddr>,
    lookup: &dyn SourceAddrLookup,
) {
    trace!(input = ?addrs, "sorting resolved addresses");
    let mut sortable: Vec<Sortable> = addrs
        .iter()
        .enumerate()
        .map(|(index, dest)| Sortable {
            dest: *dest,
            index,
            source: lookup.source_addr_for(dest),
        })
        .collect();
    sortable.sort_by(compare);
    *addrs = sortable.into_iter().map(|item| item.dest).collect();
    trace!(output = ?addrs, "sorted resolved addresses");
}

/// One destination with everything its ordering depends on.
struct Sortable {
    /// The destination address.
    dest: SocketAddr,

    /// Its position in the input, for the rule 10 tiebreak.
    index: usize,

    /// The source address the host would use, if any.
    source: Option<IpAddr>,
}

/// The RFC 6724 comparison chain.
fn compare(a: &Sortable, b: &Sortable) -> Ordering {
    // Rule 1: avoid unusable destinations.
    match (a.source.is_some(), b.source.is_some()) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        (false, false) => return a.index.cmp(&b.index),
        (true, true) => {}
    }
    let a_source = a.source.expect("checked above");
    let b_source = b.source.expect("checked above");

    // Rule 2: prefer matching scope.
    let a_matches = scope_of(&a.dest.ip()) == scope_of(&a_source);
    let b_matches = scope_of(&b.dest.ip()) == scope_of(&b_source);
    match (a_matches, b_matches) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }

    // Rule 5: prefer matching label.
    let a_matches = label_of(&a.dest.ip()) == label_of(&a_source);
    let b_matches = label_of(&b.dest.ip()) == label_of(&b_source);
    match (a_matches, b_matches) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        _ => {}
    }

    // Rule 6: prefer higher precedence.
    match precedence_of(&b.dest.ip()).cmp(&precedence_of(&a.dest.ip())) {
        Ordering::Equal => {}
        order => return order,
    }

    // Rule 8: prefer smaller scope.
    match (scope_of(&a.dest.ip()) as u8).cmp(&(scope_of(&b.dest.ip()) as u8))
    {
        Ordering::Equal => {}
        order => return order,
    }

    // Rule 9: use longest matching prefix, for native IPv6 only.
    if a.dest.is_ipv6() && b.dest.is_ipv6() {
        let a_len = common_prefix_len(&a.dest.ip(), &a_source);
        let b_len = common_prefix_len(&b.dest.ip(), &b_source);
        match b_len.cmp(&a_len) {
            Ordering::Equal => {}
            order => return order,
        }
    }

    // Rule 10: otherwise leave the order alone.
    a.index.cmp(&b.index)
}

//------------ Scope ---------------------------------------------------------

/// The RFC 6724 notion of an address's scope.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Scope {
    /// Link-local, including loopback.
    LinkLocal = 1,

    /// The deprecated IPv6 site-local range.
    SiteLocal = 2,

    /// Everything else.
    Global = 3,
}

/// Classifies an address's scope.
fn scope_of(addr: &IpAddr) -> Scope {
    match addr {
        IpAddr::V4(addr) => {
            if addr.is_loopback() || addr.is_link_local() {
                Scope::LinkLocal
            } else {
                Scope::Global
            }
        }
        IpAddr::V6(addr) => {
            if addr.is_loopback() || is_unicast_link_local(addr) {
                Scope::LinkLocal
            } else if is_site_local(addr) {
                Scope::SiteLocal
            } else {
                Scope::Global
            }
        }
    }
}

/// Returns whether an IPv6 address is in `fe80::/10`.
fn is_unicast_link_local(addr: &Ipv6Addr) -> bool {
    addr.segments()[0] & 0xffc0 == 0xfe80
}

/// Returns whether an IPv6 address is in `fec0::/10`.
fn is_site_local(addr: &Ipv6Addr) -> bool {
    addr.segments()[0] & 0xffc0 == 0xfec0
}

//------------ Policy table --------------------------------------------------

/// One row of the RFC 6724 section 2.1 policy table.
struct Policy {
    /// The prefix the row covers.
    prefix: Ipv6Addr,

    /// The prefix length in bits.
    prefix_len: u8,

    /// The row's precedence value.
    precedence: u8,

    /// The row's label value.
    label: u8,
}

/// The default policy table of RFC 6724 section 2.1.
const POLICY_TABLE: &[Policy] = &[
    Policy {
        prefix: Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1),
        prefix_len: 128,
        precedence: 50,
        label: 0,
    },
    Policy {
        prefix: Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0, 0),
        prefix_len: 96,
        precedence: 35,
        label: 4,
    },
    Policy {
        prefix: Ipv6Addr::new(0x2002, 0, 0, 0, 0, 0, 0, 0),
        prefix_len: 16,
        precedence: 30,
        label: 2,
    },
    Policy {
        prefix: Ipv6Addr::new(0x2001, 0, 0, 0, 0, 0, 0, 0),
        prefix_len: 32,
        precedence: 5,
        label: 5,
    },
    Policy {
        prefix: Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0),
        prefix_len: 7,
        precedence: 3,
        label: 13,
    },
    Policy {
        prefix: Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0),
        prefix_len: 96,
        precedence: 1,
        label: 3,
    },
    Policy {
        prefix: Ipv6Addr::new(0xfec0, 0, 0, 0, 0, 0, 0, 0),
        prefix_len: 10,
        precedence: 1,
        label: 11,
    },
    Policy {
        prefix: Ipv6Addr::new(0x3ffe, 0, 0, 0, 0, 0, 0, 0),
        prefix_len: 16,
        precedence: 1,
        label: 12,
    },
    Policy {
        prefix: Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0),
        prefix_len: 0,
        precedence: 40,
        label: 1,
    },
];

/// Finds the longest-prefix policy row for an address.
fn policy_of(addr: &IpAddr) -> &'static Policy {
    let addr = as_v6(addr);
    POLICY_TABLE
        .iter()
        .filter(|row| {
            prefix_bits_match(&addr, &row.prefix, row.prefix_len)
        })
        .max_by_key(|row| row.prefix_len)
        .expect("the ::/0 row matches everything")
}

/// Returns an address's policy label.
fn label_of(addr: &IpAddr) -> u8 {
    policy_of(addr).label
}

/// Returns an address's policy precedence.
fn precedence_of(addr: &IpAddr) -> u8 {
    policy_of(addr).precedence
}

/// Maps to the IPv6 view RFC 6724 works in.
fn as_v6(addr: &IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(addr) => addr.to_ipv6_mapped(),
        IpAddr::V6(addr) => *addr,
    }
}

/// Returns whether the first `len` bits of two addresses agree.
fn prefix_bits_match(addr: &Ipv6Addr, prefix: &Ipv6Addr, len: u8) -> bool {
    common_prefix_bits(addr, prefix) >= u32::from(len)
}

/// Counts the leading bits two addresses share.
fn common_prefix_bits(a: &Ipv6Addr, b: &Ipv6Addr) -> u32 {
    let a = a.octets();
    let b = b.octets();
    let mut bits = 0;
    for (a, b) in a.iter().zip(b.iter()) {
        if a == b {
            bits += 8;
        } else {
            bits += (a ^ b).leading_zeros();
            break;
        }
    }
    bits
}

/// CommonPrefixLen of a destination and its source address.
fn common_prefix_len(dest: &IpAddr, source: &IpAddr) -> u32 {
    common_prefix_bits(&as_v6(dest), &as_v6(source))
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// A lookup backed by a fixed table.
    struct TableLookup(HashMap<IpAddr, IpAddr>);

    impl TableLookup {
        fn new(entries: &[(&str, &str)]) -> Self {
            TableLookup(
                entries
                    .iter()
                    .map(|(dest, source)| {
                        (dest.parse().unwrap(), source.parse().unwrap())
                    })
                    .collect(),
            )
        }
    }

    impl SourceAddrLookup for TableLookup {
        fn source_addr_for(&self, dest: &SocketAddr) -> Option<IpAddr> {
            self.0.get(&dest.ip()).copied()
        }
    }

    fn addrs(input: &[&str]) -> Vec<SocketAddr> {
        input.iter().map(|addr| addr.parse().unwrap()).collect()
    }

    #[test]
    fn ipv6_outranks_ipv4_on_dual_stack() {
        let lookup = TableLookup::new(&[
            ("10.0.0.1", "10.0.0.99"),
            ("10.0.0.2", "10.0.0.99"),
            ("2001:db8::1", "2001:db8::99"),
        ]);
        let mut dests =
            addrs(&["10.0.0.1:8080", "10.0.0.2:8080", "[2001:db8::1]:8080"]);
        sort_destinations(&mut dests, &lookup);
        assert_eq!(
            dests,
            addrs(&["[2001:db8::1]:8080", "10.0.0.1:8080", "10.0.0.2:8080"])
        );
    }

    #[test]
    fn unreachable_destinations_sort_last() {
        let lookup = TableLookup::new(&[("10.0.0.2", "10.0.0.99")]);
        let mut dests = addrs(&["[2001:db8::1]:53", "10.0.0.2:53"]);
        sort_destinations(&mut dests, &lookup);
        assert_eq!(dests, addrs(&["10.0.0.2:53", "[2001:db8::1]:53"]));
    }

    #[test]
    fn equal_keys_keep_input_order() {
        let lookup = TableLookup::new(&[
            ("10.0.0.3", "10.0.0.99"),
            ("10.0.0.1", "10.0.0.99"),
            ("10.0.0.2", "10.0.0.99"),
        ]);
        let mut dests = addrs(&["10.0.0.3:80", "10.0.0.1:80", "10.0.0.2:80"]);
        sort_destinations(&mut dests, &lookup);
        assert_eq!(
            dests,
            addrs(&["10.0.0.3:80", "10.0.0.1:80", "10.0.0.2:80"])
        );
    }

    #[test]
    fn loopback_outranks_global() {
        let lookup = TableLookup::new(&[
            ("::1", "::1"),
            ("2001:db8::1", "2001:db8::99"),
        ]);
        let mut dests = addrs(&["[2001:db8::1]:443", "[::1]:443"]);
        sort_destinations(&mut dests, &lookup);
        assert_eq!(dests, addrs(&["[::1]:443", "[2001:db8::1]:443"]));
    }

    #[test]
    fn matching_scope_outranks_mismatched_scope() {
        // Both global-precedence IPv6, but one would go out through a
        // link-local source.
        let lookup = TableLookup::new(&[
            ("2001:db8::1", "fe80::1"),
            ("2001:db8::2", "2001:db8::99"),
        ]);
        let mut dests = addrs(&["[2001:db8::1]:80", "[2001:db8::2]:80"]);
        sort_destinations(&mut dests, &lookup);
        assert_eq!(dests, addrs(&["[2001:db8::2]:80", "[2001:db8::1]:80"]));
    }

    #[test]
    fn longer_shared_prefix_wins_between_equals() {
        let lookup = TableLookup::new(&[
            ("2001:db8:1::1", "2001:db8:1::99"),
            ("2001:db8:ffff::1", "2001:db8:1::99"),
        ]);
        let mut dests =
            addrs(&["[2001:db8:ffff::1]:80", "[2001:db8:1::1]:80"]);
        sort_destinations(&mut dests, &lookup);
        assert_eq!(
            dests,
            addrs(&["[2001:db8:1::1]:80", "[2001:db8:ffff::1]:80"])
        );
    }

    #[test]
    fn policy_table_rows() {
        assert_eq!(precedence_of(&"::1".parse().unwrap()), 50);
        assert_eq!(precedence_of(&"1.2.3.4".parse().unwrap()), 35);
        assert_eq!(label_of(&"1.2.3.4".parse().unwrap()), 4);
        assert_eq!(precedence_of(&"2001:db8::1".parse().unwrap()), 40);
        assert_eq!(precedence_of(&"2001::1".parse().unwrap()), 5);
        assert_eq!(precedence_of(&"2002::1".parse().unwrap()), 30);
        assert_eq!(precedence_of(&"fc00::1".parse().unwrap()), 3);
    }
}
