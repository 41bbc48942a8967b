use std::net::{Ipv4Addr, UdpSocket};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use unet::wire::arp::{ArpPacket, ARP_LEN, ARP_REPLY, ARP_REQUEST};
use unet::wire::icmp::{refresh_checksum, IcmpHeader, ICMP_ECHO, ICMP_ECHOREPLY};
use unet::wire::{
    internet_checksum, pseudo_header_checksum, EtherHeader, Ipv4Header, UdpHeader, BROADCAST_MAC, ETH_ARP,
    ETH_HLEN, ETH_IPV4, IPV4_HEADER_LEN, IP_ICMP, IP_UDP, UDP_HEADER_LEN,
};
use unet::{Backpressure, ForwardRule, NetConfig, NetDevice, NetError, NetStack};

struct ChannelDevice(Sender<Vec<u8>>);

impl NetDevice for ChannelDevice {
    fn deliver(&mut self, frame: &[u8]) -> Result<(), Backpressure> {
        self.0.send(frame.to_vec()).map_err(|_| Backpressure::Closed)
    }
}

fn start() -> (NetStack, Receiver<Vec<u8>>, NetConfig) {
    let cfg = NetConfig {
        dns_servers: vec![Ipv4Addr::LOCALHOST],
        ..NetConfig::default()
    };
    let (tx, rx) = mpsc::channel();
    let stack = NetStack::spawn(cfg.clone(), ChannelDevice(tx)).unwrap();
    (stack, rx, cfg)
}

fn ether(cfg: &NetConfig, dst: [u8; 6], ethertype: u16, body: &[u8]) -> Vec<u8> {
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

fn ipv4(cfg: &NetConfig, dst: Ipv4Addr, proto: u8, payload: &[u8]) -> Vec<u8> {
    let mut dgram = vec![0u8; IPV4_HEADER_LEN + payload.len()];
    Ipv4Header::new(cfg.guest, dst, proto, 64, payload.len()).write(&mut dgram);
    dgram[IPV4_HEADER_LEN..].copy_from_slice(payload);
    ether(cfg, cfg.gateway_mac, ETH_IPV4, &dgram)
}

/// Wait for the first delivered frame `pick` accepts.
fn wait_for<T>(rx: &Receiver<Vec<u8>>, mut pick: impl FnMut(&[u8]) -> Option<T>) -> T {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let frame = rx.recv_timeout(left).expect("no matching frame delivered");
        if let Some(v) = pick(&frame) {
            return v;
        }
    }
}

fn ip_payload(frame: &[u8], proto: u8) -> Option<(Ipv4Header, Vec<u8>)> {
    let eth = EtherHeader::parse(frame)?;
    if eth.ethertype != ETH_IPV4 {
        return None;
    }
    let ip = Ipv4Header::parse(&frame[ETH_HLEN..])?;
    if ip.proto != proto {
        return None;
    }
    let end = ETH_HLEN + usize::from(ip.total_len);
    Some((ip, frame[ETH_HLEN + ip.hlen..end].to_vec()))
}

#[test]
fn test_arp_and_ping_the_gateway() {
    let (stack, rx, cfg) = start();
    let handle = stack.handle();

    let mut arp = [0u8; ARP_LEN];
    ArpPacket {
        opcode: ARP_REQUEST,
        sender_mac: cfg.guest_mac,
        sender_ip: cfg.guest,
        target_mac: [0; 6],
        target_ip: cfg.gateway,
    }
    .write(&mut arp);
    handle.send_frame(&ether(&cfg, BROADCAST_MAC, ETH_ARP, &arp)).unwrap();
    let reply = wait_for(&rx, |f| {
        let eth = EtherHeader::parse(f)?;
        (eth.ethertype == ETH_ARP).then(|| ArpPacket::parse(&f[ETH_HLEN..])).flatten()
    });
    assert_eq!(reply.opcode, ARP_REPLY);
    assert_eq!((reply.sender_ip, reply.sender_mac), (cfg.gateway, cfg.gateway_mac));

    let mut echo = vec![ICMP_ECHO, 0, 0, 0, 0x12, 0x34, 0, 1];
    echo.extend_from_slice(b"unet ping");
    refresh_checksum(&mut echo);
    handle.send_frame(&ipv4(&cfg, cfg.gateway, IP_ICMP, &echo)).unwrap();

    let (ip, msg) = wait_for(&rx, |f| ip_payload(f, IP_ICMP));
    assert_eq!((ip.src, ip.dst), (cfg.gateway, cfg.guest));
    let icmp = IcmpHeader::parse(&msg).unwrap();
    assert_eq!(icmp.icmp_type, ICMP_ECHOREPLY);
    assert_eq!((icmp.ident, icmp.seq), (0x1234, 1));
    assert_eq!(&msg[8..], b"unet ping");
    assert_eq!(internet_checksum(&msg), 0);

    let stats = handle.stats().unwrap();
    assert_eq!(stats.icmp.reflected, 1);
    stack.shutdown().unwrap();
}

#[test]
fn test_udp_round_trip_through_host_loopback() {
    let (stack, rx, cfg) = start();
    let handle = stack.handle();
    let server = UdpSocket::bind("127.0.0.1:0").unwrap();
    server.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let port = server.local_addr().unwrap().port();

    let mut seg = vec![0u8; UDP_HEADER_LEN + 5];
    UdpHeader {
        sport: 5555,
        dport: port,
        len: seg.len() as u16,
        checksum: 0,
    }
    .write(&mut seg);
    seg[UDP_HEADER_LEN..].copy_from_slice(b"hello");
    let sum = pseudo_header_checksum(cfg.guest, cfg.gateway, IP_UDP, &seg);
    seg[6..8].copy_from_slice(&sum.to_be_bytes());
    handle.send_frame(&ipv4(&cfg, cfg.gateway, IP_UDP, &seg)).unwrap();

    let mut buf = [0u8; 64];
    let (n, from) = server.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello");
    server.send_to(b"world", from).unwrap();

    let (ip, data) = wait_for(&rx, |f| ip_payload(f, IP_UDP));
    assert_eq!((ip.src, ip.dst), (cfg.gateway, cfg.guest));
    let udp = UdpHeader::parse(&data).unwrap();
    assert_eq!((udp.sport, udp.dport), (port, 5555));
    assert_eq!(&data[UDP_HEADER_LEN..], b"world");
    stack.shutdown().unwrap();
}

#[test]
fn test_control_requests_and_shutdown() {
    let (stack, _rx, _cfg) = start();
    let handle = stack.handle();
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let rule = ForwardRule::tcp(port, 22);

    handle.add_forward(rule).unwrap();
    assert!(matches!(handle.add_forward(rule), Err(NetError::Forward(_))));
    assert_eq!(handle.with_engine(|e| e.forwards()).unwrap(), vec![rule]);
    handle.remove_forward(rule).unwrap();

    assert_eq!(handle.resolve("127.0.0.1").unwrap(), vec![Ipv4Addr::LOCALHOST]);
    if let Ok(addrs) = handle.resolve("localhost") {
        assert!(addrs.iter().all(|a| a.is_loopback()));
    }

    stack.shutdown().unwrap();
    assert!(handle.send_frame(&[0u8; 64]).is_err());
    assert!(handle.stats().is_err());
    assert!(handle.resolve("127.0.0.1").is_err());
}
