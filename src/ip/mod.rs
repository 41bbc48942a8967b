//! IPv4 input and output.
//!
//! Input validates the datagram, applies the NAT routing decision (traffic
//! leaving the virtual subnet loses a hop of TTL, or earns a time-exceeded
//! reply), reassembles fragments and dispatches on protocol. Output builds
//! the header in the buffer's leading space and fragments to the link MTU.

pub mod reass;

use std::net::Ipv4Addr;

use log::trace;

use crate::engine::{Context, Engine, TxClass};
use crate::mbuf::{Mbuf, MAX_HEADROOM};
use crate::wire::icmp::{ICMP_TIMXCEED, ICMP_TIMXCEED_INTRANS, ICMP_UNREACH, ICMP_UNREACH_PROTOCOL};
use crate::wire::ipv4::{is_class_d_or_e, refresh_checksum};
use crate::wire::{internet_checksum, Ipv4Header, IPV4_HEADER_LEN, IP_ICMP, IP_MF, IP_TCP, IP_UDP};

impl Engine {
    /// Process one IPv4 datagram from the guest (Ethernet header removed).
    pub(crate) fn ip_input(&mut self, mut m: Mbuf) {
        let stats = &mut self.cx.stats.ip;
        stats.total += 1;

        let Some(mut hdr) = Ipv4Header::parse(m.data()) else {
            stats.tooshort += 1;
            return;
        };
        if hdr.version != 4 {
            stats.badvers += 1;
            return;
        }
        if hdr.hlen < IPV4_HEADER_LEN || hdr.hlen > m.len() {
            stats.badhlen += 1;
            return;
        }
        if internet_checksum(&m.data()[..hdr.hlen]) != 0 {
            stats.badsum += 1;
            return;
        }
        let total = usize::from(hdr.total_len);
        if total < hdr.hlen {
            stats.badlen += 1;
            return;
        }
        if m.len() < total {
            stats.tooshort += 1;
            return;
        }
        // Drop link-layer padding.
        m.truncate(total);

        let cfg = &self.cx.cfg;
        if hdr.src.is_broadcast()
            || is_class_d_or_e(hdr.src)
            || hdr.src == cfg.subnet_broadcast()
            || (hdr.src.is_unspecified() && hdr.proto != IP_UDP)
        {
            stats.badaddr += 1;
            return;
        }
        if is_class_d_or_e(hdr.dst) && !hdr.dst.is_broadcast() {
            stats.badaddr += 1;
            return;
        }

        if !cfg.in_subnet(hdr.dst) && !hdr.dst.is_broadcast() {
            if hdr.ttl <= 1 {
                stats.ttl_expired += 1;
                self.cx.icmp_error(m.data(), ICMP_TIMXCEED, ICMP_TIMXCEED_INTRANS);
                return;
            }
            hdr.ttl -= 1;
            let data = m.data_mut();
            data[8] = hdr.ttl;
            refresh_checksum(data, hdr.hlen);
        }

        if hdr.is_fragment() {
            stats.fragments += 1;
            let Some(full) = self.cx.ipq.insert(&hdr, m, &mut self.cx.stats.ip) else {
                return;
            };
            m = full;
            let Some(whole) = Ipv4Header::parse(m.data()) else {
                return;
            };
            hdr = whole;
        }

        self.cx.stats.ip.delivered += 1;
        match hdr.proto {
            IP_TCP => self.tcp_input(m, &hdr),
            IP_UDP => self.udp_input(m, &hdr),
            IP_ICMP => self.cx.icmp_input(m, &hdr),
            proto => {
                trace!("no handler for IP protocol {proto}");
                self.cx.stats.ip.noproto += 1;
                self.cx.icmp_error(m.data(), ICMP_UNREACH, ICMP_UNREACH_PROTOCOL);
            }
        }
    }
}

impl Context {
    /// Send `m` (a transport segment) to the guest from `src`.
    pub fn ip_output(&mut self, m: Mbuf, src: Ipv4Addr, dst: Ipv4Addr, proto: u8, class: TxClass) {
        let mut hdr = Ipv4Header::new(src, dst, proto, self.cfg.ttl, m.len());
        hdr.id = self.next_ip_id();
        self.ip_send(hdr, m, class);
    }

    fn ip_send(&mut self, hdr: Ipv4Header, mut m: Mbuf, class: TxClass) {
        self.stats.ip.output += 1;
        let mtu = self.cfg.mtu;
        if IPV4_HEADER_LEN + m.len() <= mtu {
            hdr.write(m.prepend(IPV4_HEADER_LEN));
            self.if_output(m, hdr.dst, class);
            return;
        }
        if hdr.dont_fragment() {
            self.stats.ip.cant_frag += 1;
            return;
        }

        // Every fragment but the last carries a multiple of 8 bytes.
        let chunk = (mtu - IPV4_HEADER_LEN) & !7;
        let payload = m.data();
        let mut off = 0;
        while off < payload.len() {
            let end = (off + chunk).min(payload.len());
            let mut frag = hdr;
            frag.total_len = (IPV4_HEADER_LEN + end - off) as u16;
            frag.frag = (hdr.frag & !crate::wire::IP_OFFMASK) | (off / 8) as u16;
            if end < payload.len() {
                frag.frag |= IP_MF;
            }
            let mut piece = Mbuf::from_slice(MAX_HEADROOM, &payload[off..end]);
            frag.write(piece.prepend(IPV4_HEADER_LEN));
            self.if_output(piece, hdr.dst, class.clone());
            off = end;
        }
        self.stats.ip.fragmented += 1;
    }
}
