// Port mapper: one DNAT rule plus one userspace proxy per published port.
//
// Callers never race on the same (protocol, port): the allocators hand each
// host port to a single owner, and the manager serializes access behind a
// mutex. The maps here are therefore plain HashMaps.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::{NetworkError, NetworkResult};
use crate::firewall::{Action, Chain};
use crate::manager::Protocol;
use crate::proxy::{Proxy, ProxyHandle};

pub struct PortMapper {
    tcp_mapping: HashMap<u16, SocketAddrV4>,
    tcp_proxies: HashMap<u16, ProxyHandle>,
    udp_mapping: HashMap<u16, SocketAddrV4>,
    udp_proxies: HashMap<u16, ProxyHandle>,

    chain: Option<Chain>,
    default_ip: Ipv4Addr,
}

impl PortMapper {
    pub fn new(chain: Option<Chain>, default_ip: Ipv4Addr) -> Self {
        Self {
            tcp_mapping: HashMap::new(),
            tcp_proxies: HashMap::new(),
            udp_mapping: HashMap::new(),
            udp_proxies: HashMap::new(),
            chain,
            default_ip,
        }
    }

    /// Host IP used when a binding does not name one.
    pub fn default_ip(&self) -> Ipv4Addr {
        self.default_ip
    }

    /// Publish `backend` on `ip:port`: firewall rule first, then the
    /// mapping record, then the proxy. A proxy that fails to come up
    /// unwinds the first two steps before the error is surfaced.
    pub async fn map(
        &mut self,
        ip: Ipv4Addr,
        port: u16,
        backend: SocketAddrV4,
        proto: Protocol,
    ) -> NetworkResult<()> {
        if let Some(chain) = &self.chain {
            chain.forward(Action::Add, ip, port, proto, backend).await?;
        }
        self.mapping_mut(proto).insert(port, backend);

        let proxy = match Proxy::new(proto, SocketAddrV4::new(ip, port), backend).await {
            Ok(proxy) => proxy,
            Err(e) => {
                if let Err(unmap_err) = self.unmap(ip, port, proto).await {
                    tracing::warn!(
                        "rollback of half-mapped port {}/{} failed: {}",
                        proto,
                        port,
                        unmap_err
                    );
                }
                return Err(NetworkError::Io(e));
            }
        };
        self.proxies_mut(proto).insert(port, proxy.spawn());

        tracing::info!("mapped {}:{}/{} -> {}", ip, port, proto, backend);
        Ok(())
    }

    /// Withdraw the mapping for `port`: stop the proxy, remove the
    /// firewall rule, drop the record.
    pub async fn unmap(&mut self, ip: Ipv4Addr, port: u16, proto: Protocol) -> NetworkResult<()> {
        let backend = match self.mapping_mut(proto).get(&port) {
            Some(backend) => *backend,
            None => return Err(NetworkError::PortNotMapped { proto, port }),
        };

        if let Some(proxy) = self.proxies_mut(proto).remove(&port) {
            proxy.close();
        }

        if let Some(chain) = &self.chain {
            chain
                .forward(Action::Delete, ip, port, proto, backend)
                .await?;
        }

        self.mapping_mut(proto).remove(&port);
        tracing::info!("unmapped {}:{}/{}", ip, port, proto);
        Ok(())
    }

    /// Backend published on `port`, if any.
    pub fn backend(&self, port: u16, proto: Protocol) -> Option<SocketAddrV4> {
        let mapping = match proto {
            Protocol::Tcp => &self.tcp_mapping,
            Protocol::Udp => &self.udp_mapping,
        };
        mapping.get(&port).copied()
    }

    fn mapping_mut(&mut self, proto: Protocol) -> &mut HashMap<u16, SocketAddrV4> {
        match proto {
            Protocol::Tcp => &mut self.tcp_mapping,
            Protocol::Udp => &mut self.udp_mapping,
        }
    }

    fn proxies_mut(&mut self, proto: Protocol) -> &mut HashMap<u16, ProxyHandle> {
        match proto {
            Protocol::Tcp => &mut self.tcp_proxies,
            Protocol::Udp => &mut self.udp_proxies,
        }
    }
}
