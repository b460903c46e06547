//! Conversions between socket addresses and their wire fields.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Raw octets of an address: 4 bytes for IPv4, 16 for IPv6.
pub fn ip_octets(ip: IpAddr) -> Vec<u8> {
    match ip.to_canonical() {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

pub fn parse_ip(octets: &[u8]) -> Option<IpAddr> {
    if let Ok(v4) = <[u8; 4]>::try_from(octets) {
        return Some(IpAddr::V4(Ipv4Addr::from(v4)));
    }
    <[u8; 16]>::try_from(octets)
        .ok()
        .map(|v6| IpAddr::V6(Ipv6Addr::from(v6)).to_canonical())
}

pub fn parse_port(port: i32) -> Option<u16> {
    u16::try_from(port).ok()
}

pub fn socket_addr(octets: &[u8], port: i32) -> Option<SocketAddr> {
    Some(SocketAddr::new(parse_ip(octets)?, parse_port(port)?))
}

/// Whether two addresses name the same host, ignoring IPv4-mapped IPv6 forms.
pub fn same_host(a: IpAddr, b: IpAddr) -> bool {
    a.to_canonical() == b.to_canonical()
}
