use std::net::Ipv4Addr;

/// Name of the bridge created when nothing is configured.
pub const DEFAULT_NETWORK_BRIDGE: &str = "docker0";

/// Sentinel bridge name that disables networking entirely.
pub const DISABLE_NETWORK_BRIDGE: &str = "none";

/// Daemon-level networking configuration.
///
/// The daemon's CLI and config-file loader live outside this crate; whatever
/// they parse ends up here.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Bridge link name; `"none"` disables networking.
    pub bridge_iface: String,
    /// Gate for all firewall rule installation.
    pub enable_iptables: bool,
    /// When false, a FORWARD DROP rule isolates containers from each other.
    pub inter_container_communication: bool,
    /// Host IP used when a port binding does not name one.
    pub default_ip: Ipv4Addr,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bridge_iface: DEFAULT_NETWORK_BRIDGE.to_string(),
            enable_iptables: true,
            inter_container_communication: true,
            default_ip: Ipv4Addr::UNSPECIFIED,
        }
    }
}

impl DaemonConfig {
    /// Build a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `BOXNET_BRIDGE`: bridge link name (default: docker0, "none" disables)
    /// - `BOXNET_ENABLE_IPTABLES`: "0"/"false" to skip all firewall rules
    /// - `BOXNET_ICC`: "0"/"false" to isolate containers from each other
    /// - `BOXNET_DEFAULT_IP`: default host IP for port bindings
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let bridge_iface =
            std::env::var("BOXNET_BRIDGE").unwrap_or(defaults.bridge_iface);
        let enable_iptables = std::env::var("BOXNET_ENABLE_IPTABLES")
            .map(|v| parse_bool(&v))
            .unwrap_or(defaults.enable_iptables);
        let inter_container_communication = std::env::var("BOXNET_ICC")
            .map(|v| parse_bool(&v))
            .unwrap_or(defaults.inter_container_communication);
        let default_ip = std::env::var("BOXNET_DEFAULT_IP")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.default_ip);

        Self {
            bridge_iface,
            enable_iptables,
            inter_container_communication,
            default_ip,
        }
    }

    /// True when the sentinel bridge name turns networking off.
    pub fn network_disabled(&self) -> bool {
        self.bridge_iface == DISABLE_NETWORK_BRIDGE
    }
}

fn parse_bool(v: &str) -> bool {
    !matches!(v.trim(), "0" | "false" | "no" | "off")
}
