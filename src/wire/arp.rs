use std::net::Ipv4Addr;

pub const ARP_LEN: usize = 28;

pub const ARP_REQUEST: u16 = 1;
pub const ARP_REPLY: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub opcode: u16,
    pub sender_mac: [u8; 6],
    pub sender_ip: Ipv4Addr,
    pub target_mac: [u8; 6],
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    /// Parse an Ethernet/IPv4 ARP packet; anything else is `None`.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < ARP_LEN {
            return None;
        }

        let hw_type = u16::from_be_bytes([data[0], data[1]]);
        let proto_type = u16::from_be_bytes([data[2], data[3]]);
        let hw_len = data[4];
        let proto_len = data[5];

        if hw_type != 1 || proto_type != 0x0800 || hw_len != 6 || proto_len != 4 {
            return None;
        }

        let mut sender_mac = [0u8; 6];
        let mut target_mac = [0u8; 6];
        sender_mac.copy_from_slice(&data[8..14]);
        target_mac.copy_from_slice(&data[18..24]);
        Some(ArpPacket {
            opcode: u16::from_be_bytes([data[6], data[7]]),
            sender_mac,
            sender_ip: Ipv4Addr::new(data[14], data[15], data[16], data[17]),
            target_mac,
            target_ip: Ipv4Addr::new(data[24], data[25], data[26], data[27]),
        })
    }

    pub fn write(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&1u16.to_be_bytes()); // HW type: Ethernet
        out[2..4].copy_from_slice(&0x0800u16.to_be_bytes()); // Proto type: IPv4
        out[4] = 6; // HW len
        out[5] = 4; // Proto len
        out[6..8].copy_from_slice(&self.opcode.to_be_bytes());
        out[8..14].copy_from_slice(&self.sender_mac);
        out[14..18].copy_from_slice(&self.sender_ip.octets());
        out[18..24].copy_from_slice(&self.target_mac);
        out[24..28].copy_from_slice(&self.target_ip.octets());
    }
}
