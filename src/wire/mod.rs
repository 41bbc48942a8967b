//! Bit-exact wire formats: Ethernet, ARP, IPv4, ICMP, TCP and UDP headers
//! plus the Internet checksum.
//!
//! Parsers read fields without judging them; validation (checksums,
//! lengths, versions) and its counters belong to the protocol layers.

pub mod arp;
pub mod checksum;
pub mod ether;
pub mod icmp;
pub mod ipv4;
pub mod tcp;
pub mod udp;

pub use checksum::{internet_checksum, pseudo_header_checksum, Checksum};
pub use ether::{EtherHeader, BROADCAST_MAC, ETH_ARP, ETH_HLEN, ETH_IPV4, ETH_IPV6};
pub use ipv4::{Ipv4Header, IPV4_HEADER_LEN, IP_DF, IP_MF, IP_OFFMASK};
pub use tcp::{TcpFlags, TcpHeader, TCP_HEADER_LEN};
pub use udp::{UdpHeader, UDP_HEADER_LEN};

pub const IP_ICMP: u8 = 1;
pub const IP_TCP: u8 = 6;
pub const IP_UDP: u8 = 17;

pub(crate) fn be16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

pub(crate) fn be32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}
