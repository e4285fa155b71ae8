// Kernel-facing link and route operations, scoped to what the bridge
// bootstrap and the manager need: bring a bridge up with an address, read
// an existing bridge's address back, and dump the IPv4 routing table.

use std::net::Ipv4Addr;

use futures::TryStreamExt;
use ipnet::Ipv4Net;
use netlink_packet_route::address::nlas::Nla as AddressNla;
use netlink_packet_route::route::nlas::Nla as RouteNla;

use crate::error::{NetworkError, NetworkResult};

/// Persistent netlink handle, one per manager, reused for every call.
pub struct NetlinkHandle {
    handle: rtnetlink::Handle,
    // Keep the connection task alive
    _conn_task: tokio::task::JoinHandle<()>,
}

impl NetlinkHandle {
    pub fn new() -> NetworkResult<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        let conn_task = tokio::spawn(conn);
        Ok(Self {
            handle,
            _conn_task: conn_task,
        })
    }

    /// Create a bridge link if it is not already there, returning its
    /// ifindex either way.
    pub async fn ensure_bridge(&self, name: &str) -> NetworkResult<u32> {
        if let Ok(index) = self.link_index(name).await {
            return Ok(index);
        }

        let created = self
            .handle
            .link()
            .add()
            .bridge(name.to_string())
            .execute()
            .await;
        // A concurrent create racing us is as good as ours succeeding.
        if let Err(e) = created {
            if !already_exists(&e) {
                return Err(NetworkError::Netlink(e));
            }
        }

        self.link_index(name).await
    }

    /// Assign `network` (address + prefix) to a link. Idempotent.
    pub async fn add_ipv4(&self, link_index: u32, network: Ipv4Net) -> NetworkResult<()> {
        let result = self
            .handle
            .address()
            .add(
                link_index,
                std::net::IpAddr::V4(network.addr()),
                network.prefix_len(),
            )
            .execute()
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if already_exists(&e) => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    pub async fn set_link_up(&self, index: u32) -> NetworkResult<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    /// First IPv4 address assigned to a link, as a network (address +
    /// prefix). A link carrying several v4 addresses keeps its first one
    /// here, with a warning, so a restarted daemon adopts a stable subnet.
    pub async fn get_link_ipv4(&self, name: &str) -> NetworkResult<Ipv4Net> {
        let index = self.link_index(name).await?;

        let mut addrs = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();

        let mut found: Vec<Ipv4Net> = Vec::new();
        while let Some(msg) = addrs.try_next().await.map_err(NetworkError::Netlink)? {
            let prefix_len = msg.header.prefix_len;
            for nla in &msg.nlas {
                let AddressNla::Address(bytes) = nla else {
                    continue;
                };
                if let Some(addr) = ipv4_from_bytes(bytes) {
                    if let Ok(network) = Ipv4Net::new(addr, prefix_len) {
                        found.push(network);
                    }
                }
            }
        }

        match found.as_slice() {
            [] => Err(NetworkError::NotFound(format!(
                "link {} has no IPv4 address",
                name
            ))),
            [only] => Ok(*only),
            [first, ..] => {
                tracing::warn!(
                    "link {} has {} IPv4 addresses, using {}",
                    name,
                    found.len(),
                    first
                );
                Ok(*first)
            }
        }
    }

    /// All IPv4 networks currently routed on the host.
    ///
    /// The default route carries no destination and is skipped; it would
    /// otherwise veto every bridge subnet candidate.
    pub async fn ipv4_routes(&self) -> NetworkResult<Vec<Ipv4Net>> {
        let mut routes = self.handle.route().get(rtnetlink::IpVersion::V4).execute();
        let mut networks = Vec::new();

        while let Some(route) = routes.try_next().await.map_err(NetworkError::Netlink)? {
            let prefix_len = route.header.destination_prefix_length;
            if prefix_len == 0 {
                continue;
            }
            for nla in &route.nlas {
                let RouteNla::Destination(bytes) = nla else {
                    continue;
                };
                if let Some(dest) = ipv4_from_bytes(bytes) {
                    if let Ok(network) = Ipv4Net::new(dest, prefix_len) {
                        networks.push(network);
                    }
                }
            }
        }

        Ok(networks)
    }

    async fn link_index(&self, name: &str) -> NetworkResult<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(msg.header.index),
            Ok(None) => Err(NetworkError::NotFound(format!("link {}", name))),
            // rtnetlink reports "not found" as an error on some kernels
            Err(e) if e.to_string().contains("No such device") => {
                Err(NetworkError::NotFound(format!("link {}", name)))
            }
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }
}

fn already_exists(e: &rtnetlink::Error) -> bool {
    e.to_string().contains("File exists")
}

fn ipv4_from_bytes(bytes: &[u8]) -> Option<Ipv4Addr> {
    let octets: [u8; 4] = bytes.try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}
