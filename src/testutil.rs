//! Frame builders and an engine harness shared by the unit tests.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::mpsc::Receiver;

use crate::config::NetConfig;
use crate::delivery::{self, Frame};
use crate::engine::Engine;
use crate::wire::arp::{ArpPacket, ARP_LEN, ARP_REQUEST};
use crate::wire::icmp::{refresh_checksum, ICMP_ECHO};
use crate::wire::tcp::mss_option;
use crate::wire::{
    ipv4, pseudo_header_checksum, EtherHeader, Ipv4Header, TcpFlags, TcpHeader, UdpHeader, BROADCAST_MAC, ETH_ARP,
    ETH_HLEN, ETH_IPV4, IPV4_HEADER_LEN, IP_ICMP, IP_TCP, IP_UDP, TCP_HEADER_LEN, UDP_HEADER_LEN,
};

/// An engine with both delivery queues captured.
pub struct Harness {
    pub engine: Engine,
    normal: Receiver<Frame>,
    urgent: Receiver<Frame>,
}

impl Harness {
    pub fn new() -> Self {
        let cfg = NetConfig {
            dns_servers: vec![Ipv4Addr::LOCALHOST],
            ..NetConfig::default()
        };
        Self::with_config(cfg)
    }

    pub fn with_config(cfg: NetConfig) -> Self {
        let (outbox, normal, urgent) = delivery::outbox();
        let engine = Engine::new(cfg, outbox).expect("engine");
        Harness { engine, normal, urgent }
    }

    /// Everything queued for the guest so far, regular frames first.
    pub fn frames(&mut self) -> Vec<Vec<u8>> {
        let mut out: Vec<Vec<u8>> = self.normal.try_iter().map(|f| f.data).collect();
        out.extend(self.urgent.try_iter().map(|f| f.data));
        out
    }

    /// Frames queued on the urgent channel only.
    pub fn urgent_frames(&mut self) -> Vec<Vec<u8>> {
        self.urgent.try_iter().map(|f| f.data).collect()
    }
}

fn ether(cfg: &NetConfig, ethertype: u16, dst: [u8; 6], body: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; ETH_HLEN + body.len()];
    EtherHeader {
        dst,
        src: cfg.guest_mac,
        ethertype,
    }
    .write(&mut frame);
    frame[ETH_HLEN..].copy_from_slice(body);
    frame
}

/// A guest-originated IPv4 datagram (no Ethernet header).
pub fn ip_datagram(cfg: &NetConfig, dst: Ipv4Addr, proto: u8, payload: &[u8]) -> Vec<u8> {
    let mut dgram = vec![0u8; IPV4_HEADER_LEN + payload.len()];
    let mut hdr = Ipv4Header::new(cfg.guest, dst, proto, 64, payload.len());
    hdr.id = 0x4242;
    hdr.write(&mut dgram);
    dgram[IPV4_HEADER_LEN..].copy_from_slice(payload);
    dgram
}

/// The same datagram framed for the gateway.
pub fn ip_frame(cfg: &NetConfig, dst: Ipv4Addr, proto: u8, payload: &[u8]) -> Vec<u8> {
    ether(cfg, ETH_IPV4, cfg.gateway_mac, &ip_datagram(cfg, dst, proto, payload))
}

pub fn udp_frame(cfg: &NetConfig, sport: u16, dst: Ipv4Addr, dport: u16, payload: &[u8]) -> Vec<u8> {
    let mut seg = vec![0u8; UDP_HEADER_LEN + payload.len()];
    UdpHeader {
        sport,
        dport,
        len: seg.len() as u16,
        checksum: 0,
    }
    .write(&mut seg);
    seg[UDP_HEADER_LEN..].copy_from_slice(payload);
    let mut cksum = pseudo_header_checksum(cfg.guest, dst, IP_UDP, &seg);
    if cksum == 0 {
        cksum = 0xffff;
    }
    seg[6..8].copy_from_slice(&cksum.to_be_bytes());
    ip_frame(cfg, dst, IP_UDP, &seg)
}

pub fn icmp_echo(cfg: &NetConfig, dst: Ipv4Addr, ident: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut msg = vec![ICMP_ECHO, 0];
    msg.extend_from_slice(&[0, 0]);
    msg.extend_from_slice(&ident.to_be_bytes());
    msg.extend_from_slice(&seq.to_be_bytes());
    msg.extend_from_slice(payload);
    refresh_checksum(&mut msg);
    ip_frame(cfg, dst, IP_ICMP, &msg)
}

pub fn arp_request(cfg: &NetConfig, target: Ipv4Addr) -> Vec<u8> {
    let mut body = [0u8; ARP_LEN];
    ArpPacket {
        opcode: ARP_REQUEST,
        sender_mac: cfg.guest_mac,
        sender_ip: cfg.guest,
        target_mac: [0; 6],
        target_ip: target,
    }
    .write(&mut body);
    ether(cfg, ETH_ARP, BROADCAST_MAC, &body)
}

/// Rewrite the TTL of an Ethernet-framed datagram.
pub fn set_ttl(frame: &mut [u8], ttl: u8) {
    let ip = &mut frame[ETH_HLEN..];
    ip[8] = ttl;
    let hlen = usize::from(ip[0] & 0x0f) * 4;
    ipv4::refresh_checksum(ip, hlen);
}

/// IP header and payload of an Ethernet frame sent to the guest.
pub fn split_ip(frame: &[u8]) -> (Ipv4Header, &[u8]) {
    let ip = Ipv4Header::parse(&frame[ETH_HLEN..]).expect("ip header");
    let end = ETH_HLEN + usize::from(ip.total_len);
    (ip, &frame[ETH_HLEN + ip.hlen..end])
}

pub fn split_tcp(frame: &[u8]) -> (Ipv4Header, TcpHeader, &[u8]) {
    let (ip, seg) = split_ip(frame);
    assert_eq!(ip.proto, IP_TCP);
    let th = TcpHeader::parse(seg).expect("tcp header");
    (ip, th, &seg[th.hlen..])
}

/// Builds TCP segments from one guest endpoint to one remote endpoint.
pub struct GuestTcp {
    pub cfg: NetConfig,
    pub sport: u16,
    pub dst: SocketAddrV4,
    pub win: u16,
}

impl GuestTcp {
    pub fn new(cfg: &NetConfig, sport: u16, dst: SocketAddrV4) -> Self {
        GuestTcp {
            cfg: cfg.clone(),
            sport,
            dst,
            win: 65535,
        }
    }

    pub fn guest(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.cfg.guest, self.sport)
    }

    pub fn syn(&self, seq: u32, mss: u16) -> Vec<u8> {
        self.build(seq, 0, TcpFlags::SYN, &mss_option(mss), &[])
    }

    pub fn frame(&self, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> Vec<u8> {
        self.build(seq, ack, flags, &[], payload)
    }

    fn build(&self, seq: u32, ack: u32, flags: TcpFlags, opts: &[u8], payload: &[u8]) -> Vec<u8> {
        let hlen = TCP_HEADER_LEN + opts.len();
        let mut seg = vec![0u8; hlen + payload.len()];
        TcpHeader {
            sport: self.sport,
            dport: self.dst.port(),
            seq,
            ack,
            hlen,
            flags,
            win: self.win,
            checksum: 0,
            urp: 0,
        }
        .write(&mut seg);
        seg[TCP_HEADER_LEN..hlen].copy_from_slice(opts);
        seg[hlen..].copy_from_slice(payload);
        let cksum = pseudo_header_checksum(self.cfg.guest, *self.dst.ip(), IP_TCP, &seg);
        seg[16..18].copy_from_slice(&cksum.to_be_bytes());
        ip_frame(&self.cfg, *self.dst.ip(), IP_TCP, &seg)
    }
}
