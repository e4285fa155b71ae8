// boxnet - container network management for a Linux container runtime.
//
// One software bridge per host with a collision-free private subnet,
// per-container IP leases out of that subnet, ephemeral host-port leases,
// and published ports wired up with kernel DNAT rules plus userspace
// proxies. The container lifecycle manager drives everything through
// NetworkManager and the Interface values it hands out.

pub mod bridge;
pub mod cidr;
pub mod config;
pub mod error;
pub mod firewall;
pub mod ip_allocator;
pub mod manager;
pub mod netlink;
pub mod port_allocator;
pub mod port_mapping;
pub mod proxy;
pub mod resolv;

pub use config::{DaemonConfig, DEFAULT_NETWORK_BRIDGE, DISABLE_NETWORK_BRIDGE};
pub use error::{NetworkError, NetworkResult};
pub use manager::{Interface, Nat, NetworkManager, PortBinding, Protocol};
