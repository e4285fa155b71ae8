// Best-effort read of the host resolver configuration. The bridge bootstrap
// refuses subnets that would shadow a nameserver; a host without a readable
// resolv.conf simply has nothing to protect.

use std::net::Ipv4Addr;
use std::path::Path;

use ipnet::Ipv4Net;

const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Nameservers from the system resolver config, as /32 networks.
///
/// A missing or unreadable file is not an error and yields an empty list.
pub fn nameservers_as_cidr() -> Vec<Ipv4Net> {
    nameservers_from_path(Path::new(RESOLV_CONF))
}

pub fn nameservers_from_path(path: &Path) -> Vec<Ipv4Net> {
    match std::fs::read_to_string(path) {
        Ok(contents) => nameservers_from(&contents),
        Err(e) => {
            tracing::debug!("skipping resolver config {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

fn nameservers_from(contents: &str) -> Vec<Ipv4Net> {
    let mut nameservers = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut fields = line.split_whitespace();
        if fields.next() != Some("nameserver") {
            continue;
        }
        // IPv6 nameservers fail the parse and are skipped; this subsystem
        // only manages IPv4.
        if let Some(addr) = fields.next().and_then(|f| f.parse::<Ipv4Addr>().ok()) {
            nameservers.push(Ipv4Net::new(addr, 32).expect("/32 is always valid"));
        }
    }
    nameservers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nameserver_lines() {
        let contents = "\
# generated by resolvconf
nameserver 8.8.8.8
nameserver 192.168.1.1
search example.com
";
        let ns = nameservers_from(contents);
        assert_eq!(ns.len(), 2);
        assert_eq!(ns[0], "8.8.8.8/32".parse().unwrap());
        assert_eq!(ns[1], "192.168.1.1/32".parse().unwrap());
    }

    #[test]
    fn skips_comments_and_ipv6() {
        let contents = "\
; comment
#nameserver 1.1.1.1
nameserver 2001:4860:4860::8888
nameserver 10.0.0.53
";
        let ns = nameservers_from(contents);
        assert_eq!(ns, vec!["10.0.0.53/32".parse().unwrap()]);
    }

    #[test]
    fn missing_file_is_empty() {
        let ns = nameservers_from_path(Path::new("/nonexistent/resolv.conf"));
        assert!(ns.is_empty());
    }
}
