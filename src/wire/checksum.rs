use std::net::Ipv4Addr;

/// Internet checksum (RFC 1071): ones-complement sum of 16-bit words.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut c = Checksum::new();
    c.add_bytes(data);
    c.finish()
}

/// TCP/UDP checksum over the IPv4 pseudo-header and `segment`
/// (RFC 793 / RFC 768).
pub fn pseudo_header_checksum(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, segment: &[u8]) -> u16 {
    let mut c = Checksum::new();
    c.add_bytes(&src.octets());
    c.add_bytes(&dst.octets());
    c.add_u16(u16::from(proto));
    c.add_u16(segment.len() as u16);
    c.add_bytes(segment);
    c.finish()
}

/// Incremental ones-complement accumulator. Every `add_bytes` call except
/// the last must cover an even number of bytes.
#[derive(Default)]
pub struct Checksum {
    sum: u64,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes(&mut self, data: &[u8]) {
        let mut chunks = data.chunks_exact(2);
        for w in &mut chunks {
            self.sum += u64::from(u16::from_be_bytes([w[0], w[1]]));
        }
        if let [last] = chunks.remainder() {
            self.sum += u64::from(*last) << 8;
        }
    }

    pub fn add_u16(&mut self, v: u16) {
        self.sum += u64::from(v);
    }

    pub fn finish(&self) -> u16 {
        let mut sum = self.sum;
        while sum > 0xFFFF {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        !(sum as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc1071_example() {
        // Example from RFC 1071 section 3.
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(internet_checksum(&data), !0xddf2);
    }

    #[test]
    fn test_checksum_verifies_to_zero() {
        let mut hdr = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        let c = internet_checksum(&hdr);
        hdr[10..12].copy_from_slice(&c.to_be_bytes());
        assert_eq!(c, 0xb861);
        assert_eq!(internet_checksum(&hdr), 0);
    }

    #[test]
    fn test_odd_length() {
        assert_eq!(internet_checksum(&[0x01]), !0x0100);
    }
}
