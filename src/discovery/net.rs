//! Interface selection and multicast sockets

use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::DiscoveryError;

/// Interface name fragments of tunnels and virtual adapters receivers can't reach
const SKIPPED_INTERFACES: &[&str] = &[
    "wintun", "wireguard", "tailscale", "zerotier", "vpn", "tun", "tap", "docker", "veth",
    "virbr", "vmnet", "vboxnet",
];

/// Pick the IPv4 address to scan from and to advertise the stream on.
///
/// An explicit override always wins.
pub fn select_interface(preferred: Option<Ipv4Addr>) -> Result<Ipv4Addr, DiscoveryError> {
    if let Some(ip) = preferred {
        return Ok(ip);
    }

    let ifaces = get_if_addrs::get_if_addrs()?;
    let candidates = rank_candidates(ifaces.into_iter().map(|iface| {
        let ip = iface.ip();
        (iface.name, ip)
    }));

    match candidates.first() {
        Some(ip) => {
            tracing::info!("Using interface address {}", ip);
            Ok(*ip)
        }
        None => Err(DiscoveryError::NoInterface),
    }
}

/// Usable IPv4 addresses, best first: private LAN ranges, then anything else
pub fn rank_candidates(ifaces: impl IntoIterator<Item = (String, IpAddr)>) -> Vec<Ipv4Addr> {
    let mut out: Vec<Ipv4Addr> = ifaces
        .into_iter()
        .filter(|(name, _)| {
            let name = name.to_ascii_lowercase();
            !SKIPPED_INTERFACES.iter().any(|skip| name.contains(skip))
        })
        .filter_map(|(_, ip)| match ip {
            IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_link_local() => Some(ip),
            _ => None,
        })
        .collect();

    out.sort_by_key(|ip| (private_rank(*ip), *ip));
    out.dedup();
    out
}

fn private_rank(ip: Ipv4Addr) -> u8 {
    let [a, b, _, _] = ip.octets();
    if a == 192 && b == 168 {
        0
    } else if a == 10 {
        1
    } else if a == 172 && (16..=31).contains(&b) {
        2
    } else {
        3
    }
}

/// UDP socket bound to `local_ip` on an ephemeral port, multicasting from it
pub fn bind_multicast_socket(local_ip: Ipv4Addr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    // not every platform lets us set these
    let _ = socket.set_multicast_ttl_v4(255);
    let _ = socket.set_multicast_if_v4(&local_ip);
    socket.bind(&SocketAddrV4::new(local_ip, 0).into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, ip: [u8; 4]) -> (String, IpAddr) {
        (name.to_string(), IpAddr::V4(Ipv4Addr::from(ip)))
    }

    #[test]
    fn test_prefers_home_lan() {
        let ranked = rank_candidates(vec![
            iface("eth1", [203, 0, 113, 5]),
            iface("eth0", [10, 1, 2, 3]),
            iface("wlan0", [192, 168, 1, 20]),
        ]);
        assert_eq!(
            ranked,
            vec![
                Ipv4Addr::new(192, 168, 1, 20),
                Ipv4Addr::new(10, 1, 2, 3),
                Ipv4Addr::new(203, 0, 113, 5),
            ]
        );
    }

    #[test]
    fn test_skips_unusable_interfaces() {
        let ranked = rank_candidates(vec![
            iface("lo", [127, 0, 0, 1]),
            iface("eth0", [169, 254, 3, 4]),
            iface("docker0", [172, 17, 0, 1]),
            iface("tailscale0", [100, 64, 0, 2]),
            ("eth0".to_string(), "fe80::1".parse().unwrap()),
        ]);
        assert!(ranked.is_empty());
    }

    #[test]
    fn test_override_wins() {
        let ip = Ipv4Addr::new(192, 168, 50, 2);
        assert_eq!(select_interface(Some(ip)).unwrap(), ip);
    }
}
