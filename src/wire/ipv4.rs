use std::net::Ipv4Addr;

use super::checksum::internet_checksum;

pub const IPV4_HEADER_LEN: usize = 20;

/// Don't Fragment.
pub const IP_DF: u16 = 0x4000;
/// More Fragments.
pub const IP_MF: u16 = 0x2000;
/// Fragment offset in 8-byte units.
pub const IP_OFFMASK: u16 = 0x1FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    /// Header length in bytes, options included.
    pub hlen: usize,
    pub tos: u8,
    pub total_len: u16,
    pub id: u16,
    /// Flags and fragment offset as carried on the wire.
    pub frag: u16,
    pub ttl: u8,
    pub proto: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Header for a datagram the engine originates.
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, ttl: u8, payload_len: usize) -> Self {
        Ipv4Header {
            version: 4,
            hlen: IPV4_HEADER_LEN,
            tos: 0,
            total_len: (IPV4_HEADER_LEN + payload_len) as u16,
            id: 0,
            frag: 0,
            ttl,
            proto,
            checksum: 0,
            src,
            dst,
        }
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < IPV4_HEADER_LEN {
            return None;
        }
        Some(Ipv4Header {
            version: data[0] >> 4,
            hlen: usize::from(data[0] & 0x0F) * 4,
            tos: data[1],
            total_len: super::be16(data, 2),
            id: super::be16(data, 4),
            frag: super::be16(data, 6),
            ttl: data[8],
            proto: data[9],
            checksum: super::be16(data, 10),
            src: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            dst: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        })
    }

    /// Fragment offset in bytes.
    pub fn frag_offset(&self) -> usize {
        usize::from(self.frag & IP_OFFMASK) * 8
    }

    pub fn more_fragments(&self) -> bool {
        self.frag & IP_MF != 0
    }

    pub fn dont_fragment(&self) -> bool {
        self.frag & IP_DF != 0
    }

    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.frag & IP_OFFMASK != 0
    }

    /// Write a 20-byte header (no options) and fill in its checksum.
    pub fn write(&self, out: &mut [u8]) {
        out[0] = 0x45; // Version 4, IHL 5
        out[1] = self.tos;
        out[2..4].copy_from_slice(&self.total_len.to_be_bytes());
        out[4..6].copy_from_slice(&self.id.to_be_bytes());
        out[6..8].copy_from_slice(&self.frag.to_be_bytes());
        out[8] = self.ttl;
        out[9] = self.proto;
        out[10..12].copy_from_slice(&[0, 0]);
        out[12..16].copy_from_slice(&self.src.octets());
        out[16..20].copy_from_slice(&self.dst.octets());
        let cksum = internet_checksum(&out[..IPV4_HEADER_LEN]);
        out[10..12].copy_from_slice(&cksum.to_be_bytes());
    }
}

/// Rewrite the header checksum of the (possibly option-bearing) header at
/// the start of `datagram`.
pub fn refresh_checksum(datagram: &mut [u8], hlen: usize) {
    datagram[10] = 0;
    datagram[11] = 0;
    let cksum = internet_checksum(&datagram[..hlen]);
    datagram[10..12].copy_from_slice(&cksum.to_be_bytes());
}

/// Class D (multicast) or class E (reserved) address.
pub fn is_class_d_or_e(addr: Ipv4Addr) -> bool {
    addr.octets()[0] >= 224
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_parse() {
        let mut h = Ipv4Header::new(
            Ipv4Addr::new(10, 0, 2, 2),
            Ipv4Addr::new(10, 0, 2, 15),
            17,
            64,
            100,
        );
        h.id = 0x1234;
        h.frag = IP_MF | 3;
        let mut buf = [0u8; 20];
        h.write(&mut buf);
        assert_eq!(internet_checksum(&buf), 0);

        let p = Ipv4Header::parse(&buf).unwrap();
        assert_eq!(p.version, 4);
        assert_eq!(p.hlen, 20);
        assert_eq!(p.total_len, 120);
        assert_eq!(p.frag_offset(), 24);
        assert!(p.more_fragments());
        assert!(p.is_fragment());
        assert!(!p.dont_fragment());
        assert_eq!(p.src, h.src);
    }

    #[test]
    fn test_address_classes() {
        assert!(is_class_d_or_e(Ipv4Addr::new(224, 0, 0, 1)));
        assert!(is_class_d_or_e(Ipv4Addr::new(255, 255, 255, 255)));
        assert!(!is_class_d_or_e(Ipv4Addr::new(10, 0, 2, 2)));
    }
}
