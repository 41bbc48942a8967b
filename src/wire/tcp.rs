use bitflags::bitflags;

pub const TCP_HEADER_LEN: usize = 20;

/// TCP option kinds we understand.
pub const TCPOPT_EOL: u8 = 0;
pub const TCPOPT_NOP: u8 = 1;
pub const TCPOPT_MAXSEG: u8 = 2;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    /// Header length in bytes, options included.
    pub hlen: usize,
    pub flags: TcpFlags,
    pub win: u16,
    pub checksum: u16,
    pub urp: u16,
}

impl TcpHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < TCP_HEADER_LEN {
            return None;
        }
        Some(TcpHeader {
            sport: super::be16(data, 0),
            dport: super::be16(data, 2),
            seq: super::be32(data, 4),
            ack: super::be32(data, 8),
            hlen: usize::from(data[12] >> 4) * 4,
            flags: TcpFlags::from_bits_truncate(data[13]),
            win: super::be16(data, 14),
            checksum: super::be16(data, 16),
            urp: super::be16(data, 18),
        })
    }

    /// Write the fixed header (checksum zeroed). `hlen` must already account
    /// for options the caller places after it.
    pub fn write(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.sport.to_be_bytes());
        out[2..4].copy_from_slice(&self.dport.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq.to_be_bytes());
        out[8..12].copy_from_slice(&self.ack.to_be_bytes());
        out[12] = ((self.hlen / 4) as u8) << 4;
        out[13] = self.flags.bits();
        out[14..16].copy_from_slice(&self.win.to_be_bytes());
        out[16..18].copy_from_slice(&[0, 0]);
        out[18..20].copy_from_slice(&self.urp.to_be_bytes());
    }
}

/// Extract the MSS option from a SYN's option bytes.
pub fn parse_mss(options: &[u8]) -> Option<u16> {
    let mut pos = 0;
    while pos < options.len() {
        match options[pos] {
            TCPOPT_EOL => return None,
            TCPOPT_NOP => pos += 1,
            kind => {
                let len = usize::from(*options.get(pos + 1)?);
                if len < 2 || pos + len > options.len() {
                    return None;
                }
                if kind == TCPOPT_MAXSEG && len == 4 {
                    return Some(u16::from_be_bytes([options[pos + 2], options[pos + 3]]));
                }
                pos += len;
            }
        }
    }
    None
}

/// MSS option bytes.
pub fn mss_option(mss: u16) -> [u8; 4] {
    let b = mss.to_be_bytes();
    [TCPOPT_MAXSEG, 4, b[0], b[1]]
}
