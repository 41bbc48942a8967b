//! ARP: answers for every address except the guest's own (proxy ARP with
//! the gateway MAC) and remembers what the guest tells us about itself.

use std::net::Ipv4Addr;

use log::trace;

use crate::engine::{Context, TxClass};
use crate::wire::arp::{ArpPacket, ARP_LEN, ARP_REPLY, ARP_REQUEST};
use crate::wire::{EtherHeader, ETH_ARP, ETH_HLEN};

const ARP_TABLE_SIZE: usize = 16;

/// Small IP to MAC table, oldest entry replaced first.
#[derive(Debug, Default)]
pub struct ArpTable {
    entries: Vec<(Ipv4Addr, [u8; 6])>,
}

impl ArpTable {
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<[u8; 6]> {
        self.entries.iter().find(|(a, _)| *a == ip).map(|(_, mac)| *mac)
    }

    pub fn update(&mut self, ip: Ipv4Addr, mac: [u8; 6]) {
        if ip.is_unspecified() || mac == [0; 6] {
            return;
        }
        if let Some(entry) = self.entries.iter_mut().find(|(a, _)| *a == ip) {
            entry.1 = mac;
            return;
        }
        if self.entries.len() == ARP_TABLE_SIZE {
            self.entries.remove(0);
        }
        self.entries.push((ip, mac));
    }
}

impl Context {
    pub(crate) fn arp_input(&mut self, data: &[u8]) {
        let Some(arp) = ArpPacket::parse(data) else {
            trace!("malformed ARP packet");
            return;
        };
        if self.cfg.in_subnet(arp.sender_ip) {
            self.arp.update(arp.sender_ip, arp.sender_mac);
        }

        if arp.opcode != ARP_REQUEST {
            return;
        }
        // Gratuitous ARP, or a probe for the guest's own address.
        if arp.target_ip == arp.sender_ip || arp.target_ip == self.cfg.guest {
            return;
        }

        let mut frame = vec![0u8; ETH_HLEN + ARP_LEN];
        EtherHeader {
            dst: arp.sender_mac,
            src: self.cfg.gateway_mac,
            ethertype: ETH_ARP,
        }
        .write(&mut frame);
        ArpPacket {
            opcode: ARP_REPLY,
            sender_mac: self.cfg.gateway_mac,
            sender_ip: arp.target_ip,
            target_mac: arp.sender_mac,
            target_ip: arp.sender_ip,
        }
        .write(&mut frame[ETH_HLEN..]);
        self.emit(frame, TxClass::Normal);
    }
}
