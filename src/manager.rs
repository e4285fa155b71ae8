// Network manager: composes the bridge bootstrap, the IP allocator, the two
// port allocators and the port mapper behind a per-container interface API.
// Only one manager per host machine should be used.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use ipnet::Ipv4Net;
use tokio::sync::Mutex;

use crate::bridge::create_bridge_iface;
use crate::cidr::ip_to_int;
use crate::config::DaemonConfig;
use crate::error::{NetworkError, NetworkResult};
use crate::firewall::{self, Chain};
use crate::ip_allocator::IpAllocator;
use crate::netlink::NetlinkHandle;
use crate::port_allocator::PortAllocator;
use crate::port_mapping::PortMapper;

/// Name of the nat chain holding this crate's DNAT rules.
const PORT_MAPPING_CHAIN: &str = "BOXNET";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Requested host side of a published port. A zero port means "any
/// ephemeral port"; a missing IP means the daemon default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortBinding {
    pub host_ip: Option<Ipv4Addr>,
    pub host_port: u16,
}

/// A published port: the container side and the host side it landed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nat {
    pub proto: Protocol,
    pub container_port: u16,
    pub host_ip: Ipv4Addr,
    pub host_port: u16,
}

impl fmt::Display for Nat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}/{}",
            self.host_ip, self.host_port, self.container_port, self.proto
        )
    }
}

// Everything a live interface needs from its manager.
struct Shared {
    bridge_network: Ipv4Net,
    ip_allocator: IpAllocator,
    tcp_port_allocator: PortAllocator,
    udp_port_allocator: PortAllocator,
    // Map/unmap are externally serialized per host port by the allocators;
    // the mutex serializes the map bookkeeping itself.
    port_mapper: Mutex<PortMapper>,
}

impl Shared {
    fn port_allocator(&self, proto: Protocol) -> &PortAllocator {
        match proto {
            Protocol::Tcp => &self.tcp_port_allocator,
            Protocol::Udp => &self.udp_port_allocator,
        }
    }
}

pub struct NetworkManager {
    bridge_iface: String,
    shared: Option<Arc<Shared>>,
}

impl NetworkManager {
    /// Build the manager: adopt (or bootstrap) the bridge, apply the
    /// inter-container policy, prepare the nat chain and the allocators.
    pub async fn new(config: &DaemonConfig) -> NetworkResult<Self> {
        if config.network_disabled() {
            tracing::info!("container networking is disabled");
            return Ok(Self {
                bridge_iface: config.bridge_iface.clone(),
                shared: None,
            });
        }

        let nl = NetlinkHandle::new()?;
        let bridge_network = match nl.get_link_ipv4(&config.bridge_iface).await {
            Ok(network) => network,
            Err(NetworkError::NotFound(_)) => {
                // Bridge missing; bootstrap it and read the address back.
                create_bridge_iface(config, &nl).await?;
                nl.get_link_ipv4(&config.bridge_iface).await?
            }
            Err(e) => return Err(e),
        };

        if config.enable_iptables {
            firewall::set_inter_container_communication(
                &config.bridge_iface,
                config.inter_container_communication,
            )
            .await?;
        }

        // A previous run may have left its chain behind.
        firewall::remove_existing_chain(PORT_MAPPING_CHAIN).await;
        let chain = if config.enable_iptables {
            Some(Chain::new(PORT_MAPPING_CHAIN, &config.bridge_iface).await?)
        } else {
            None
        };

        Ok(Self {
            bridge_iface: config.bridge_iface.clone(),
            shared: Some(Arc::new(Shared {
                bridge_network,
                ip_allocator: IpAllocator::new(bridge_network),
                tcp_port_allocator: PortAllocator::new(),
                udp_port_allocator: PortAllocator::new(),
                port_mapper: Mutex::new(PortMapper::new(chain, config.default_ip)),
            })),
        })
    }

    // Test seam: an active manager over a given network, with no bridge,
    // no netlink and no firewall behind it.
    #[cfg(test)]
    fn with_network(bridge_network: Ipv4Net, default_ip: Ipv4Addr) -> Self {
        Self {
            bridge_iface: "testbr0".to_string(),
            shared: Some(Arc::new(Shared {
                bridge_network,
                ip_allocator: IpAllocator::new(bridge_network),
                tcp_port_allocator: PortAllocator::new(),
                udp_port_allocator: PortAllocator::new(),
                port_mapper: Mutex::new(PortMapper::new(None, default_ip)),
            })),
        }
    }

    pub fn bridge_iface(&self) -> &str {
        &self.bridge_iface
    }

    pub fn is_disabled(&self) -> bool {
        self.shared.is_none()
    }

    /// Allocate the networking stack of one container.
    pub async fn allocate(&self) -> NetworkResult<Interface> {
        let Some(shared) = &self.shared else {
            return Ok(Interface::disabled());
        };

        let mut ip = shared.ip_allocator.acquire().await?;

        // /24 deployments that predate the /16 ranges used the first host
        // address as the gateway. That slot is kept off-limits for
        // compatibility, even when the bridge's own address sits elsewhere;
        // the discarded address deliberately stays marked in use.
        let legacy_gateway = ip_to_int(shared.bridge_network.network()) + 1;
        if ip_to_int(ip) == legacy_gateway {
            ip = shared.ip_allocator.acquire().await?;
        }

        Ok(Interface {
            ipnet: Ipv4Net::new(ip, shared.bridge_network.prefix_len())
                .expect("prefix comes from a valid network"),
            gateway: shared.bridge_network.addr(),
            shared: Some(Arc::clone(shared)),
            ext_ports: Vec::new(),
        })
    }

    /// Shut the allocators down. All three are attempted; the first error
    /// wins.
    pub async fn close(&self) -> NetworkResult<()> {
        let Some(shared) = &self.shared else {
            return Ok(());
        };
        let tcp = shared.tcp_port_allocator.close().await;
        let udp = shared.udp_port_allocator.close().await;
        let ip = shared.ip_allocator.close().await;
        tcp.and(udp).and(ip)
    }
}

/// The networking stack of one container: its address on the bridge subnet
/// and the host ports published for it.
pub struct Interface {
    ipnet: Ipv4Net,
    gateway: Ipv4Addr,
    shared: Option<Arc<Shared>>,
    ext_ports: Vec<Nat>,
}

impl Interface {
    fn disabled() -> Self {
        Self {
            ipnet: Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0).expect("/0 is valid"),
            gateway: Ipv4Addr::UNSPECIFIED,
            shared: None,
            ext_ports: Vec::new(),
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ipnet.addr()
    }

    pub fn ipnet(&self) -> Ipv4Net {
        self.ipnet
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub fn is_disabled(&self) -> bool {
        self.shared.is_none()
    }

    /// Ports currently published for this container.
    pub fn ext_ports(&self) -> &[Nat] {
        &self.ext_ports
    }

    /// Publish a container port on the host: acquire a host port from the
    /// matching allocator, then map it onto `(interface IP, container
    /// port)`. The returned Nat carries the host port that was assigned.
    pub async fn allocate_port(
        &mut self,
        container_port: u16,
        proto: Protocol,
        binding: PortBinding,
    ) -> NetworkResult<Nat> {
        let Some(shared) = &self.shared else {
            return Err(NetworkError::Disabled(format!(
                "cannot allocate port {}/{} on a disabled interface",
                proto, container_port
            )));
        };

        let allocator = shared.port_allocator(proto);
        let ext_port = allocator.acquire(binding.host_port).await?;

        let backend = SocketAddrV4::new(self.ipnet.addr(), container_port);
        let mut mapper = shared.port_mapper.lock().await;
        let host_ip = binding.host_ip.unwrap_or_else(|| mapper.default_ip());
        if let Err(e) = mapper.map(host_ip, ext_port, backend, proto).await {
            drop(mapper);
            allocator.release(ext_port);
            return Err(e);
        }
        drop(mapper);

        let nat = Nat {
            proto,
            container_port,
            host_ip,
            host_port: ext_port,
        };
        self.ext_ports.push(nat);
        Ok(nat)
    }

    /// Tear down everything held by this interface: every published port,
    /// then the address itself. Per-port failures are logged and the loop
    /// keeps going, so one bad port cannot strand the rest.
    pub async fn release(&mut self) {
        let Some(shared) = self.shared.take() else {
            return;
        };

        for nat in self.ext_ports.drain(..) {
            tracing::debug!("unmapping {}", nat);
            let mut mapper = shared.port_mapper.lock().await;
            if let Err(e) = mapper.unmap(nat.host_ip, nat.host_port, nat.proto).await {
                tracing::error!("unable to unmap port {}: {}", nat, e);
            }
            drop(mapper);
            shared.port_allocator(nat.proto).release(nat.host_port);
        }

        shared.ip_allocator.release(self.ipnet.addr()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port_allocator::PORT_RANGE_START;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn disabled_manager_hands_out_disabled_interfaces() {
        let config = DaemonConfig {
            bridge_iface: "none".to_string(),
            ..Default::default()
        };
        let manager = NetworkManager::new(&config).await.unwrap();
        assert!(manager.is_disabled());

        let mut iface = manager.allocate().await.unwrap();
        assert!(iface.is_disabled());

        let result = iface
            .allocate_port(80, Protocol::Tcp, PortBinding::default())
            .await;
        assert!(matches!(result, Err(NetworkError::Disabled(_))));

        iface.release().await; // no-op
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn wide_bridge_skips_the_legacy_gateway_slot() {
        // On 172.17.42.1/16 the first cursor hit is 172.17.0.1, the gateway
        // of the historic /24 scheme; the manager draws again.
        let manager = NetworkManager::with_network(
            net("172.17.42.1/16"),
            Ipv4Addr::UNSPECIFIED,
        );
        let iface = manager.allocate().await.unwrap();
        assert_eq!(iface.ip(), Ipv4Addr::new(172, 17, 0, 2));
        assert_eq!(iface.gateway(), Ipv4Addr::new(172, 17, 42, 1));
        assert_eq!(iface.ipnet().prefix_len(), 16);
    }

    #[tokio::test]
    async fn narrow_bridge_allocates_sequentially() {
        // With the gateway at .1 the legacy slot and the gateway coincide,
        // so the extra draw never fires.
        let manager =
            NetworkManager::with_network(net("192.0.2.1/29"), Ipv4Addr::UNSPECIFIED);
        let first = manager.allocate().await.unwrap();
        let second = manager.allocate().await.unwrap();
        assert_eq!(first.ip(), Ipv4Addr::new(192, 0, 2, 2));
        assert_eq!(second.ip(), Ipv4Addr::new(192, 0, 2, 3));
    }

    #[tokio::test]
    async fn interfaces_never_share_an_address() {
        let manager =
            NetworkManager::with_network(net("10.60.0.1/24"), Ipv4Addr::UNSPECIFIED);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            let iface = manager.allocate().await.unwrap();
            assert!(seen.insert(iface.ip()), "{} issued twice", iface.ip());
        }
    }

    #[tokio::test]
    async fn released_interface_address_is_recycled() {
        // Small subnet: .1 is both the gateway and the legacy slot, so the
        // five addresses .2 through .6 are usable.
        let manager =
            NetworkManager::with_network(net("192.0.2.1/29"), Ipv4Addr::UNSPECIFIED);

        let mut held = Vec::new();
        loop {
            match manager.allocate().await {
                Ok(iface) => held.push(iface),
                Err(NetworkError::NoAvailableIps) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(held.len(), 5);

        let freed_ip = held[0].ip();
        held.remove(0).release().await;
        let again = manager.allocate().await.unwrap();
        assert_eq!(again.ip(), freed_ip);
    }

    #[tokio::test]
    async fn allocate_port_assigns_an_ephemeral_host_port() {
        // A dedicated loopback address keeps parallel tests off this port.
        let bind_ip = Ipv4Addr::new(127, 0, 61, 1);
        let manager = NetworkManager::with_network(net("10.61.0.1/24"), bind_ip);
        let mut iface = manager.allocate().await.unwrap();

        let nat = iface
            .allocate_port(80, Protocol::Tcp, PortBinding::default())
            .await
            .unwrap();
        assert!(nat.host_port >= PORT_RANGE_START);
        assert!(nat.host_port < 65535);
        assert_eq!(nat.container_port, 80);
        assert_eq!(nat.host_ip, bind_ip);
        assert_eq!(iface.ext_ports().len(), 1);
    }

    #[tokio::test]
    async fn allocate_port_honors_an_explicit_binding() {
        let manager =
            NetworkManager::with_network(net("10.62.0.1/24"), Ipv4Addr::UNSPECIFIED);
        let mut iface = manager.allocate().await.unwrap();

        let binding = PortBinding {
            host_ip: Some(Ipv4Addr::LOCALHOST),
            host_port: 50700,
        };
        let nat = iface
            .allocate_port(8080, Protocol::Tcp, binding)
            .await
            .unwrap();
        assert_eq!(nat.host_port, 50700);
        assert_eq!(nat.host_ip, Ipv4Addr::LOCALHOST);

        // The same host port cannot be published twice.
        let mut other = manager.allocate().await.unwrap();
        let result = other.allocate_port(8080, Protocol::Tcp, binding).await;
        assert!(matches!(result, Err(NetworkError::PortInUse(50700))));
    }

    #[tokio::test]
    async fn failed_mapping_releases_the_host_port() {
        let manager =
            NetworkManager::with_network(net("10.63.0.1/24"), Ipv4Addr::UNSPECIFIED);
        let mut iface = manager.allocate().await.unwrap();

        // Occupy the host port so the proxy bind fails inside map().
        let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = blocker.local_addr().unwrap().port();

        let binding = PortBinding {
            host_ip: Some(Ipv4Addr::LOCALHOST),
            host_port: taken,
        };
        let result = iface.allocate_port(80, Protocol::Tcp, binding).await;
        assert!(result.is_err());
        assert!(iface.ext_ports().is_empty());

        // The allocator got the port back.
        drop(blocker);
        let nat = iface.allocate_port(80, Protocol::Tcp, binding).await.unwrap();
        assert_eq!(nat.host_port, taken);
    }

    #[tokio::test]
    async fn release_unwinds_ports_and_address() {
        let bind_ip = Ipv4Addr::new(127, 0, 64, 1);
        let manager = NetworkManager::with_network(net("10.64.0.1/24"), bind_ip);
        let mut iface = manager.allocate().await.unwrap();

        let tcp = iface
            .allocate_port(80, Protocol::Tcp, PortBinding::default())
            .await
            .unwrap();
        let udp = iface
            .allocate_port(53, Protocol::Udp, PortBinding::default())
            .await
            .unwrap();
        iface.release().await;

        // Both host ports are acquirable again.
        let shared = manager.shared.as_ref().unwrap();
        assert_eq!(
            shared
                .port_allocator(Protocol::Tcp)
                .acquire(tcp.host_port)
                .await
                .unwrap(),
            tcp.host_port
        );
        assert_eq!(
            shared
                .port_allocator(Protocol::Udp)
                .acquire(udp.host_port)
                .await
                .unwrap(),
            udp.host_port
        );
        // And the mappings are gone.
        let mapper = shared.port_mapper.lock().await;
        assert!(mapper.backend(tcp.host_port, Protocol::Tcp).is_none());
        assert!(mapper.backend(udp.host_port, Protocol::Udp).is_none());
    }

    #[tokio::test]
    async fn close_shuts_every_allocator_down() {
        let manager =
            NetworkManager::with_network(net("10.65.0.1/24"), Ipv4Addr::UNSPECIFIED);
        manager.close().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let shared = manager.shared.as_ref().unwrap();
        assert!(shared.ip_allocator.acquire().await.is_err());
    }

    #[test]
    fn nat_display_format() {
        let nat = Nat {
            proto: Protocol::Tcp,
            container_port: 80,
            host_ip: Ipv4Addr::new(192, 168, 1, 5),
            host_port: 49153,
        };
        assert_eq!(nat.to_string(), "192.168.1.5:49153:80/tcp");
    }
}
