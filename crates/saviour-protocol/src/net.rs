//! Local address selection.
//!
//! Agents only ever advertise an address inside the configured private
//! ranges; loopback is never registered. The address is found with the
//! UDP-connect trick: no packet is sent, the kernel just picks the
//! outbound interface for the probe destination.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Candidate probe destinations, one per supported private range.
const PROBE_TARGETS: &[Ipv4Addr] = &[
    Ipv4Addr::new(192, 168, 1, 255),
    Ipv4Addr::new(10, 0, 0, 255),
];

pub fn ip_in_prefixes(ip: &IpAddr, prefixes: &[String]) -> bool {
    if ip.is_loopback() {
        return false;
    }
    let text = ip.to_string();
    prefixes.iter().any(|p| text.starts_with(p.as_str()))
}

/// The local address the kernel would source traffic to `target` from.
fn local_addr_towards(target: Ipv4Addr) -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect((target, 1)).ok()?;
    Some(socket.local_addr().ok()?.ip())
}

/// Find an address of this host inside one of `prefixes`, or None.
pub fn find_private_ip(prefixes: &[String]) -> Option<IpAddr> {
    for target in PROBE_TARGETS {
        if let Some(ip) = local_addr_towards(*target) {
            if ip_in_prefixes(&ip, prefixes) {
                return Some(ip);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefixes() -> Vec<String> {
        crate::PRIVATE_IP_PREFIXES
            .iter()
            .map(|p| p.to_string())
            .collect()
    }

    #[test]
    fn test_loopback_never_accepted() {
        let lo: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(!ip_in_prefixes(&lo, &prefixes()));
        // Even when a prefix would textually match.
        assert!(!ip_in_prefixes(&lo, &["127.".to_string()]));
    }

    #[test]
    fn test_prefix_match() {
        let ip: IpAddr = "10.0.0.57".parse().unwrap();
        assert!(ip_in_prefixes(&ip, &prefixes()));
        let ip: IpAddr = "192.168.1.12".parse().unwrap();
        assert!(ip_in_prefixes(&ip, &prefixes()));
        let ip: IpAddr = "172.16.0.4".parse().unwrap();
        assert!(!ip_in_prefixes(&ip, &prefixes()));
    }
}
