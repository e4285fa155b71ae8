// IPv4 arithmetic shared by the bridge bootstrap and the IP allocator.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

/// First (network base) and last (broadcast) address of a network.
pub fn network_range(net: &Ipv4Net) -> (Ipv4Addr, Ipv4Addr) {
    (net.network(), net.broadcast())
}

/// True iff either network's first address lies inside the other.
pub fn networks_overlap(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    b.contains(&a.network()) || a.contains(&b.network())
}

/// Big-endian conversion of an address into a 32-bit integer.
///
/// The cursor of the IP allocator is an `i32`, so the conversions are too;
/// wrap-around is well defined for the private ranges handled here.
pub fn ip_to_int(ip: Ipv4Addr) -> i32 {
    u32::from(ip) as i32
}

/// Inverse of [`ip_to_int`].
pub fn int_to_ip(n: i32) -> Ipv4Addr {
    Ipv4Addr::from(n as u32)
}

/// Number of addresses covered by the network's mask: `(!mask) + 1`.
pub fn network_size(net: &Ipv4Net) -> i32 {
    (!u32::from(net.netmask()) as i32).wrapping_add(1)
}
