use std::fmt;

use crate::manager::Protocol;

/// Error type for all bridge, allocator and port-mapping operations
#[derive(Debug)]
pub enum NetworkError {
    /// Netlink operation failed
    Netlink(rtnetlink::Error),
    /// System I/O error
    Io(std::io::Error),
    /// Firewall command execution failed
    Command { cmd: String, stderr: String },
    /// No candidate subnet was free, or bridge setup failed
    SubnetSelection(String),
    /// The bridge subnet has no unallocated IP left
    NoAvailableIps,
    /// A specific host port was requested but is already taken
    PortInUse(u16),
    /// Unmap was called for a port that was never mapped
    PortNotMapped { proto: Protocol, port: u16 },
    /// Resource not found (link, address, mapping)
    NotFound(String),
    /// Operation on an interface whose networking is disabled
    Disabled(String),
    /// An allocator was closed while a request was in flight
    ChannelClosed(&'static str),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Netlink(e) => write!(f, "netlink error: {}", e),
            NetworkError::Io(e) => write!(f, "io error: {}", e),
            NetworkError::Command { cmd, stderr } => {
                write!(f, "command '{}' failed: {}", cmd, stderr)
            }
            NetworkError::SubnetSelection(msg) => write!(f, "subnet selection: {}", msg),
            NetworkError::NoAvailableIps => write!(f, "no unallocated IP available"),
            NetworkError::PortInUse(port) => write!(f, "port already in use: {}", port),
            NetworkError::PortNotMapped { proto, port } => {
                write!(f, "port {}/{} is not mapped", proto, port)
            }
            NetworkError::NotFound(msg) => write!(f, "not found: {}", msg),
            NetworkError::Disabled(msg) => write!(f, "networking disabled: {}", msg),
            NetworkError::ChannelClosed(what) => write!(f, "{} closed unexpectedly", what),
        }
    }
}

impl std::error::Error for NetworkError {}

impl From<rtnetlink::Error> for NetworkError {
    fn from(e: rtnetlink::Error) -> Self {
        NetworkError::Netlink(e)
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(e: std::io::Error) -> Self {
        NetworkError::Io(e)
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;
