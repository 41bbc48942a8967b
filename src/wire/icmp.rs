pub const ICMP_MINLEN: usize = 8;

pub const ICMP_ECHOREPLY: u8 = 0;
pub const ICMP_UNREACH: u8 = 3;
pub const ICMP_SOURCEQUENCH: u8 = 4;
pub const ICMP_REDIRECT: u8 = 5;
pub const ICMP_ECHO: u8 = 8;
pub const ICMP_TIMXCEED: u8 = 11;
pub const ICMP_PARAMPROB: u8 = 12;

pub const ICMP_UNREACH_NET: u8 = 0;
pub const ICMP_UNREACH_HOST: u8 = 1;
pub const ICMP_UNREACH_PROTOCOL: u8 = 2;
pub const ICMP_UNREACH_PORT: u8 = 3;
pub const ICMP_UNREACH_NEEDFRAG: u8 = 4;

pub const ICMP_TIMXCEED_INTRANS: u8 = 0;
pub const ICMP_TIMXCEED_REASS: u8 = 1;

/// Bytes of the offending datagram's payload quoted in an error (RFC 792).
pub const ICMP_ERROR_QUOTE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    /// Identifier for echo messages.
    pub ident: u16,
    /// Sequence number for echo messages.
    pub seq: u16,
}

impl IcmpHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < ICMP_MINLEN {
            return None;
        }
        Some(IcmpHeader {
            icmp_type: data[0],
            code: data[1],
            checksum: super::be16(data, 2),
            ident: super::be16(data, 4),
            seq: super::be16(data, 6),
        })
    }

    pub fn write(&self, out: &mut [u8]) {
        out[0] = self.icmp_type;
        out[1] = self.code;
        out[2..4].copy_from_slice(&self.checksum.to_be_bytes());
        out[4..6].copy_from_slice(&self.ident.to_be_bytes());
        out[6..8].copy_from_slice(&self.seq.to_be_bytes());
    }
}

/// Whether `icmp_type` reports an error (as opposed to a query).
pub fn is_error_type(icmp_type: u8) -> bool {
    matches!(
        icmp_type,
        ICMP_UNREACH | ICMP_SOURCEQUENCH | ICMP_REDIRECT | ICMP_TIMXCEED | ICMP_PARAMPROB
    )
}

/// Recompute the checksum of a complete ICMP message in place.
pub fn refresh_checksum(msg: &mut [u8]) {
    msg[2] = 0;
    msg[3] = 0;
    let cksum = super::internet_checksum(msg);
    msg[2..4].copy_from_slice(&cksum.to_be_bytes());
}
