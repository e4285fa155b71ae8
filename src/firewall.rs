// iptables plumbing for the port mapper and the bridge bootstrap. All rule
// installation is gated by DaemonConfig::enable_iptables at the call sites;
// nothing here checks it again.

use std::net::{Ipv4Addr, SocketAddrV4};

use ipnet::Ipv4Net;

use crate::error::{NetworkError, NetworkResult};
use crate::manager::Protocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Delete,
}

impl Action {
    fn flag(self) -> &'static str {
        match self {
            Action::Add => "-A",
            Action::Delete => "-D",
        }
    }
}

/// A named chain in the nat table holding the per-mapping DNAT rules.
///
/// Locally destined traffic is routed into the chain from PREROUTING and
/// OUTPUT, so published ports are reachable from remote hosts and from the
/// host itself.
#[derive(Debug)]
pub struct Chain {
    name: String,
    bridge: String,
}

impl Chain {
    /// Create the chain and inject it into PREROUTING and OUTPUT.
    pub async fn new(name: &str, bridge: &str) -> NetworkResult<Self> {
        raw(&["-t", "nat", "-N", name]).await?;
        let chain = Self {
            name: name.to_string(),
            bridge: bridge.to_string(),
        };

        chain
            .prerouting(Action::Add, &["-m", "addrtype", "--dst-type", "LOCAL"])
            .await?;
        chain
            .output(
                Action::Add,
                &["-m", "addrtype", "--dst-type", "LOCAL", "!", "--dst", "127.0.0.0/8"],
            )
            .await?;

        tracing::debug!("created nat chain {} for bridge {}", name, bridge);
        Ok(chain)
    }

    /// Install or remove the DNAT rule publishing `dest` on `ip:port`.
    pub async fn forward(
        &self,
        action: Action,
        ip: Ipv4Addr,
        port: u16,
        proto: Protocol,
        dest: SocketAddrV4,
    ) -> NetworkResult<()> {
        let args = forward_args(&self.name, &self.bridge, action, ip, port, proto, dest);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        raw(&args).await
    }

    async fn prerouting(&self, action: Action, args: &[&str]) -> NetworkResult<()> {
        let mut cmd = vec!["-t", "nat", action.flag(), "PREROUTING"];
        cmd.extend_from_slice(args);
        cmd.extend_from_slice(&["-j", &self.name]);
        raw(&cmd).await
    }

    async fn output(&self, action: Action, args: &[&str]) -> NetworkResult<()> {
        let mut cmd = vec!["-t", "nat", action.flag(), "OUTPUT"];
        cmd.extend_from_slice(args);
        cmd.extend_from_slice(&["-j", &self.name]);
        raw(&cmd).await
    }

    /// Unlink, flush and delete the chain. Errors are ignored; the chain
    /// may never have been set up.
    pub async fn remove(&self) {
        let _ = self
            .prerouting(Action::Delete, &["-m", "addrtype", "--dst-type", "LOCAL"])
            .await;
        let _ = self
            .output(
                Action::Delete,
                &["-m", "addrtype", "--dst-type", "LOCAL", "!", "--dst", "127.0.0.0/8"],
            )
            .await;
        let _ = raw(&["-t", "nat", "-F", &self.name]).await;
        let _ = raw(&["-t", "nat", "-X", &self.name]).await;
    }
}

fn forward_args(
    chain: &str,
    bridge: &str,
    action: Action,
    ip: Ipv4Addr,
    port: u16,
    proto: Protocol,
    dest: SocketAddrV4,
) -> Vec<String> {
    // An unspecified bind IP publishes the port on every host address.
    let daddr = if ip.is_unspecified() {
        "0/0".to_string()
    } else {
        ip.to_string()
    };
    [
        "-t",
        "nat",
        action.flag(),
        chain,
        "-p",
        proto.as_str(),
        "-d",
        &daddr,
        "--dport",
        &port.to_string(),
        "!",
        "-i",
        bridge,
        "-j",
        "DNAT",
        "--to-destination",
        &dest.to_string(),
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

/// Best-effort removal of a chain left behind by a previous run.
pub async fn remove_existing_chain(name: &str) {
    let chain = Chain {
        name: name.to_string(),
        bridge: String::new(),
    };
    chain.remove().await;
}

/// Masquerade traffic leaving the bridge subnet, so containers reach the
/// outside world with the host's address.
pub async fn ensure_masquerade(network: &Ipv4Net) -> NetworkResult<()> {
    let net = network.to_string();
    let args = [
        "-t",
        "nat",
        "POSTROUTING",
        "-s",
        &net,
        "!",
        "-d",
        &net,
        "-j",
        "MASQUERADE",
    ];
    if exists(&args).await {
        return Ok(());
    }
    raw(&insert_args("-A", &args)).await
}

/// Apply the inter-container communication policy on the bridge: a FORWARD
/// DROP between the bridge and itself when communication is off, removal of
/// that rule when it is on.
pub async fn set_inter_container_communication(
    bridge: &str,
    enabled: bool,
) -> NetworkResult<()> {
    let args = ["FORWARD", "-i", bridge, "-o", bridge, "-j", "DROP"];
    if !enabled {
        tracing::debug!("disabling inter-container communication on {}", bridge);
        if exists(&args).await {
            return Ok(());
        }
        raw(&insert_args("-A", &args)).await
    } else {
        tracing::debug!("enabling inter-container communication on {}", bridge);
        let _ = raw(&insert_args("-D", &args)).await;
        Ok(())
    }
}

/// Check whether a rule exists (`iptables -C`). The args are the rule
/// specification without an action flag, table flags first when not filter.
pub async fn exists(args: &[&str]) -> bool {
    let check: Vec<&str> = insert_args("-C", args);
    tokio::process::Command::new("iptables")
        .args(&check)
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Run iptables with the given arguments.
pub async fn raw(args: &[&str]) -> NetworkResult<()> {
    let output = tokio::process::Command::new("iptables")
        .args(args)
        .output()
        .await
        .map_err(NetworkError::Io)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(NetworkError::Command {
            cmd: format!("iptables {}", args.join(" ")),
            stderr: stderr.to_string(),
        });
    }
    Ok(())
}

// Splice an action flag in after any leading "-t <table>" pair.
fn insert_args<'a>(action: &'a str, args: &[&'a str]) -> Vec<&'a str> {
    let mut out: Vec<&str> = Vec::with_capacity(args.len() + 1);
    let split = if args.first() == Some(&"-t") { 2 } else { 0 };
    out.extend_from_slice(&args[..split]);
    out.push(action);
    out.extend_from_slice(&args[split..]);
    out
}
