// Bridge bootstrap: pick a collision-free private subnet, create the bridge
// link, and masquerade its egress. Runs once, during manager construction,
// when the configured bridge does not exist yet.

use ipnet::Ipv4Net;

use crate::cidr::networks_overlap;
use crate::config::DaemonConfig;
use crate::error::{NetworkError, NetworkResult};
use crate::firewall;
use crate::netlink::NetlinkHandle;
use crate::resolv;

// Candidate bridge addresses, tried in order. The gateway stays at .42.1
// even for the /16 entries: those widen /24 ranges that predate them, and
// deployments have scripts relying on the old gateway addresses.
const BRIDGE_ADDR_CANDIDATES: &[&str] = &[
    "172.17.42.1/16", // don't use 172.16.0.0/16, it conflicts with EC2 DNS 172.16.0.23
    "10.0.42.1/16",   // don't even try using the entire /8, that's too intrusive
    "10.1.42.1/16",
    "10.42.42.1/16",
    "172.16.42.1/24",
    "172.16.43.1/24",
    "172.16.44.1/24",
    "10.0.42.1/24",
    "10.0.43.1/24",
    "192.168.42.1/24",
    "192.168.43.1/24",
    "192.168.44.1/24",
];

/// Create the bridge link named in the config, addressed with the first
/// candidate subnet that collides with neither a host route nor a
/// nameserver. Returns the chosen network.
pub async fn create_bridge_iface(
    config: &DaemonConfig,
    nl: &NetlinkHandle,
) -> NetworkResult<Ipv4Net> {
    let routes = nl.ipv4_routes().await?;
    let nameservers = resolv::nameservers_as_cidr();

    let candidates: Vec<Ipv4Net> = BRIDGE_ADDR_CANDIDATES
        .iter()
        .map(|addr| addr.parse().expect("candidate list is well-formed"))
        .collect();

    let Some(network) = select_bridge_network(&candidates, &routes, &nameservers) else {
        return Err(NetworkError::SubnetSelection(format!(
            "could not find a free IP address range for interface '{}', \
             please configure its address manually",
            config.bridge_iface
        )));
    };
    tracing::debug!(
        "creating bridge {} with network {}",
        config.bridge_iface,
        network
    );

    let index = nl.ensure_bridge(&config.bridge_iface).await?;
    nl.add_ipv4(index, network).await?;
    nl.set_link_up(index).await?;

    if config.enable_iptables {
        firewall::ensure_masquerade(&network).await?;
    }

    tracing::info!("bridge {} up with address {}", config.bridge_iface, network);
    Ok(network)
}

/// First candidate whose subnet overlaps neither a route nor a nameserver.
fn select_bridge_network(
    candidates: &[Ipv4Net],
    routes: &[Ipv4Net],
    nameservers: &[Ipv4Net],
) -> Option<Ipv4Net> {
    candidates
        .iter()
        .find(|candidate| {
            let routed = routes.iter().find(|route| networks_overlap(candidate, route));
            if let Some(route) = routed {
                tracing::debug!("{}: already routed ({})", candidate, route);
                return false;
            }
            let shadowed = nameservers
                .iter()
                .find(|ns| networks_overlap(candidate, ns));
            if let Some(ns) = shadowed {
                tracing::debug!("{}: overlaps nameserver {}", candidate, ns);
                return false;
            }
            true
        })
        .copied()
}
