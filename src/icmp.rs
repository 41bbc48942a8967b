//! ICMP: echo service for the engine's own addresses, an echo proxy for
//! everything else, and error generation.
//!
//! Echo requests to external hosts go out through one host ICMP socket
//! (unprivileged datagram socket, raw socket as a fallback). Each proxied
//! request leaves an Echo Tracking Entry so the asynchronous reply, matched
//! on `(type, identifier, sequence)` and the remote address, can be turned
//! back into a reply to the guest. Datagram sockets pin the identifier to
//! their local port, so each request also gets a sequence number of its own
//! on the host side.

use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use socket2::{Protocol, Type};

use crate::engine::{Context, TxClass};
use crate::mbuf::{Mbuf, MAX_HEADROOM};
use crate::socket::{host_socket, recv_from_v4};
use crate::wire::icmp::{
    is_error_type, refresh_checksum, IcmpHeader, ICMP_ECHO, ICMP_ECHOREPLY, ICMP_ERROR_QUOTE, ICMP_MINLEN,
    ICMP_TIMXCEED, ICMP_UNREACH, ICMP_UNREACH_HOST, ICMP_UNREACH_NET,
};
use crate::wire::ipv4::is_class_d_or_e;
use crate::wire::{internet_checksum, Ipv4Header, IPV4_HEADER_LEN, IP_ICMP};

#[derive(Debug, Clone)]
struct EchoEntry {
    /// Identifier on the host side (ours, or the one the kernel chose).
    host_ident: u16,
    host_seq: u16,
    guest_ident: u16,
    guest_seq: u16,
    remote: Ipv4Addr,
    guest: Ipv4Addr,
    /// Guest datagram header plus 8 bytes, quoted in translated errors.
    quote: Vec<u8>,
    deadline: Instant,
}

/// Host ICMP socket and the Echo Tracking cache.
pub struct EchoProxy {
    sock: Option<socket2::Socket>,
    /// The socket hands us whole IP datagrams.
    raw: bool,
    tried: bool,
    entries: VecDeque<EchoEntry>,
    capacity: usize,
    timeout: Duration,
    next_ident: u16,
    next_seq: u16,
}

impl EchoProxy {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        EchoProxy {
            sock: None,
            raw: false,
            tried: false,
            entries: VecDeque::new(),
            capacity,
            timeout,
            next_ident: 0x4000,
            next_seq: 0,
        }
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.sock.as_ref().map(|s| s.as_raw_fd())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Open the host socket on first use. Returns whether proxying works.
    pub fn ensure_open(&mut self) -> bool {
        if self.tried {
            return self.sock.is_some();
        }
        self.tried = true;
        match host_socket(Type::DGRAM, Protocol::ICMPV4, None) {
            Ok(s) => {
                debug!("ICMP proxy using a datagram socket");
                self.sock = Some(s);
            }
            Err(dgram_err) => match host_socket(Type::RAW, Protocol::ICMPV4, None) {
                Ok(s) => {
                    debug!("ICMP proxy using a raw socket");
                    self.sock = Some(s);
                    self.raw = true;
                }
                Err(raw_err) => warn!(
                    "ICMP proxy disabled: datagram socket: {dgram_err}; raw socket: {raw_err}; \
                     pings to external hosts will go unanswered"
                ),
            },
        }
        self.sock.is_some()
    }

    fn send(&mut self, msg: &[u8], remote: Ipv4Addr) -> io::Result<u16> {
        let Some(sock) = self.sock.as_ref() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        sock.send_to(msg, &SocketAddrV4::new(remote, 0).into())?;
        let sent = u16::from_be_bytes([msg[4], msg[5]]);
        if self.raw {
            return Ok(sent);
        }
        // Datagram ICMP sockets may replace the identifier with the
        // socket's local port.
        let port = sock
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket_ipv4())
            .map(|a| a.port())
            .unwrap_or(0);
        Ok(if port != 0 { port } else { sent })
    }

    fn alloc_ident(&mut self) -> u16 {
        self.next_ident = self.next_ident.wrapping_add(1);
        self.next_ident
    }

    /// Next host-side sequence number not held by a live entry.
    fn alloc_seq(&mut self) -> u16 {
        loop {
            self.next_seq = self.next_seq.wrapping_add(1);
            let seq = self.next_seq;
            if !self.entries.iter().any(|e| e.host_seq == seq) {
                return seq;
            }
        }
    }

    /// Record an in-flight echo. Returns whether an older entry had to be
    /// evicted to make room.
    fn track(&mut self, entry: EchoEntry) -> bool {
        let evicted = self.entries.len() >= self.capacity;
        if evicted {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        evicted
    }

    fn take(&mut self, host_ident: u16, seq: u16, remote: Ipv4Addr) -> Option<EchoEntry> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.host_ident == host_ident && e.host_seq == seq && e.remote == remote)?;
        self.entries.remove(idx)
    }

    /// Drop entries whose reply never came. Returns how many expired.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.deadline > now);
        before - self.entries.len()
    }
}

/// Strip an IPv4 header if the host socket delivered one.
fn icmp_payload(packet: &[u8]) -> &[u8] {
    if packet.len() >= IPV4_HEADER_LEN && packet[0] >> 4 == 4 && packet[9] == IP_ICMP {
        let hlen = usize::from(packet[0] & 0x0f) * 4;
        if hlen >= IPV4_HEADER_LEN && hlen <= packet.len() {
            return &packet[hlen..];
        }
    }
    packet
}

impl Context {
    /// ICMP from the guest; `m` holds the whole datagram.
    pub(crate) fn icmp_input(&mut self, m: Mbuf, ip: &Ipv4Header) {
        self.stats.icmp.received += 1;
        let msg = &m.data()[ip.hlen..];
        if msg.len() < ICMP_MINLEN {
            self.stats.icmp.tooshort += 1;
            return;
        }
        if internet_checksum(msg) != 0 {
            self.stats.icmp.badsum += 1;
            return;
        }
        let Some(icmp) = IcmpHeader::parse(msg) else {
            return;
        };
        if icmp.icmp_type != ICMP_ECHO {
            trace!("ignoring ICMP type {} from guest", icmp.icmp_type);
            return;
        }

        if self.cfg.is_alias(ip.dst) {
            self.icmp_reflect(&m, ip);
        } else if self.cfg.in_subnet(ip.dst) || ip.dst.is_broadcast() {
            trace!("echo to {} has no host behind it", ip.dst);
        } else {
            self.echo_proxy(&m, ip, icmp);
        }
    }

    /// Answer an echo request in place: swap the addresses, flip the type
    /// and recompute the checksum.
    pub(crate) fn icmp_reflect(&mut self, m: &Mbuf, ip: &Ipv4Header) {
        let mut reply = Mbuf::from_slice(MAX_HEADROOM, &m.data()[ip.hlen..]);
        let msg = reply.data_mut();
        msg[0] = ICMP_ECHOREPLY;
        refresh_checksum(msg);
        self.stats.icmp.reflected += 1;
        self.ip_output(reply, ip.dst, ip.src, IP_ICMP, TxClass::Normal);
    }

    fn echo_proxy(&mut self, m: &Mbuf, ip: &Ipv4Header, icmp: IcmpHeader) {
        if !self.echo.ensure_open() {
            self.stats.icmp.proxy_failed += 1;
            return;
        }
        let mut msg = m.data()[ip.hlen..].to_vec();
        let ident = self.echo.alloc_ident();
        let host_seq = self.echo.alloc_seq();
        msg[4..6].copy_from_slice(&ident.to_be_bytes());
        msg[6..8].copy_from_slice(&host_seq.to_be_bytes());
        refresh_checksum(&mut msg);

        let host_ident = match self.echo.send(&msg, ip.dst) {
            Ok(id) => id,
            Err(e) => {
                debug!("ICMP proxy: sendto {} failed: {e}", ip.dst);
                self.stats.icmp.proxy_failed += 1;
                let code = match e.raw_os_error() {
                    Some(libc::ENETUNREACH) => Some(ICMP_UNREACH_NET),
                    Some(libc::EHOSTUNREACH) => Some(ICMP_UNREACH_HOST),
                    _ => None,
                };
                if let Some(code) = code {
                    self.icmp_error(m.data(), ICMP_UNREACH, code);
                }
                return;
            }
        };

        let quote_len = (ip.hlen + ICMP_ERROR_QUOTE).min(m.len());
        let entry = EchoEntry {
            host_ident,
            host_seq,
            guest_ident: icmp.ident,
            guest_seq: icmp.seq,
            remote: ip.dst,
            guest: ip.src,
            quote: m.data()[..quote_len].to_vec(),
            deadline: self.now + self.echo.timeout,
        };
        if self.echo.track(entry) {
            self.stats.icmp.echo_evicted += 1;
        }
        self.stats.icmp.proxied += 1;
    }

    /// Drain the host ICMP socket.
    pub(crate) fn icmp_host_input(&mut self) {
        let Some(fd) = self.echo.raw_fd() else {
            return;
        };
        let mut buf = vec![0u8; 65536];
        loop {
            let (n, from) = match recv_from_v4(fd, &mut buf) {
                Ok(r) => r,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("ICMP proxy: recv failed: {e}");
                    break;
                }
            };
            let msg = icmp_payload(&buf[..n]).to_vec();
            self.echo_reply_input(&msg, *from.ip());
        }
    }

    fn echo_reply_input(&mut self, msg: &[u8], from: Ipv4Addr) {
        let Some(icmp) = IcmpHeader::parse(msg) else {
            return;
        };
        match icmp.icmp_type {
            ICMP_ECHOREPLY => {
                let Some(entry) = self.echo.take(icmp.ident, icmp.seq, from) else {
                    return;
                };
                let mut reply = Mbuf::from_slice(MAX_HEADROOM, msg);
                let out = reply.data_mut();
                out[4..6].copy_from_slice(&entry.guest_ident.to_be_bytes());
                out[6..8].copy_from_slice(&entry.guest_seq.to_be_bytes());
                refresh_checksum(out);
                self.stats.icmp.replies += 1;
                self.ip_output(reply, entry.remote, entry.guest, IP_ICMP, TxClass::Normal);
            }
            ICMP_UNREACH | ICMP_TIMXCEED => {
                // The error quotes our echo: its IP header, then the echo.
                let quoted = &msg[ICMP_MINLEN..];
                let Some(inner) = Ipv4Header::parse(quoted) else {
                    return;
                };
                let Some(echo) = quoted.get(inner.hlen..).and_then(IcmpHeader::parse) else {
                    return;
                };
                if inner.proto != IP_ICMP || echo.icmp_type != ICMP_ECHO {
                    return;
                }
                let Some(entry) = self.echo.take(echo.ident, echo.seq, inner.dst) else {
                    return;
                };
                self.icmp_error_from(from, &entry.quote, icmp.icmp_type, icmp.code);
            }
            _ => {}
        }
    }

    /// Report a problem with the guest datagram `orig` back to its sender,
    /// from the gateway address.
    pub fn icmp_error(&mut self, orig: &[u8], icmp_type: u8, code: u8) {
        let gateway = self.cfg.gateway;
        self.icmp_error_from(gateway, orig, icmp_type, code);
    }

    fn icmp_error_from(&mut self, src: Ipv4Addr, orig: &[u8], icmp_type: u8, code: u8) {
        let Some(oh) = Ipv4Header::parse(orig) else {
            return;
        };
        if oh.hlen < IPV4_HEADER_LEN || oh.hlen > orig.len() {
            return;
        }
        // Never answer fragments past the first, broadcasts or ICMP errors.
        let suppress = oh.frag_offset() != 0
            || oh.dst.is_broadcast()
            || is_class_d_or_e(oh.dst)
            || oh.dst == self.cfg.subnet_broadcast()
            || oh.src.is_unspecified()
            || oh.src.is_broadcast()
            || (oh.proto == IP_ICMP && orig.get(oh.hlen).is_some_and(|&t| is_error_type(t)));
        if suppress {
            self.stats.icmp.errors_suppressed += 1;
            return;
        }

        let quote_len = (oh.hlen + ICMP_ERROR_QUOTE).min(orig.len());
        let mut m = Mbuf::with_headroom(MAX_HEADROOM, ICMP_MINLEN + quote_len);
        m.append(&[icmp_type, code, 0, 0, 0, 0, 0, 0]);
        m.append(&orig[..quote_len]);
        refresh_checksum(m.data_mut());
        self.stats.icmp.errors_sent += 1;
        self.ip_output(m, src, oh.src, IP_ICMP, TxClass::Normal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, Harness};
    use crate::wire::icmp::ICMP_UNREACH_PORT;
    use crate::wire::IP_UDP;

    fn entry(seq: u16, deadline: Instant) -> EchoEntry {
        EchoEntry {
            host_ident: 77,
            host_seq: seq,
            guest_ident: 5,
            guest_seq: seq + 100,
            remote: Ipv4Addr::new(192, 0, 2, 9),
            guest: Ipv4Addr::new(10, 0, 2, 15),
            quote: Vec::new(),
            deadline,
        }
    }

    #[test]
    fn test_echo_to_gateway_is_reflected() {
        let mut h = Harness::new();
        let cfg = h.engine.cx.cfg.clone();
        let ping = testutil::icmp_echo(&cfg, cfg.gateway, 0x1234, 7, b"abcdefgh");
        h.engine.input(Mbuf::from_slice(0, &ping));

        let frames = h.frames();
        assert_eq!(frames.len(), 1);
        let (ip, msg) = testutil::split_ip(&frames[0]);
        assert_eq!(ip.src, cfg.gateway);
        assert_eq!(ip.dst, cfg.guest);
        assert_eq!(internet_checksum(msg), 0);
        let icmp = IcmpHeader::parse(msg).unwrap();
        assert_eq!(icmp.icmp_type, ICMP_ECHOREPLY);
        assert_eq!((icmp.ident, icmp.seq), (0x1234, 7));
        assert_eq!(&msg[8..], b"abcdefgh");
        assert_eq!(h.engine.stats().icmp.reflected, 1);
    }

    #[test]
    fn test_error_quotes_header_and_eight_bytes() {
        let mut h = Harness::new();
        let cfg = h.engine.cx.cfg.clone();
        let frame = testutil::udp_frame(&cfg, 5000, Ipv4Addr::new(192, 0, 2, 1), 9, &[0xaa; 100]);
        let orig = &frame[crate::wire::ETH_HLEN..];
        h.engine.cx.icmp_error(orig, ICMP_UNREACH, ICMP_UNREACH_PORT);

        let frames = h.frames();
        assert_eq!(frames.len(), 1);
        let (ip, msg) = testutil::split_ip(&frames[0]);
        assert_eq!(ip.src, cfg.gateway);
        assert_eq!(ip.dst, cfg.guest);
        assert_eq!(msg.len(), ICMP_MINLEN + IPV4_HEADER_LEN + ICMP_ERROR_QUOTE);
        assert_eq!(&msg[ICMP_MINLEN..], &orig[..IPV4_HEADER_LEN + ICMP_ERROR_QUOTE]);
        assert_eq!(internet_checksum(msg), 0);
    }

    #[test]
    fn test_error_loop_prevention() {
        let mut h = Harness::new();
        let cfg = h.engine.cx.cfg.clone();

        // An ICMP error is never answered with another.
        let unreach = testutil::ip_datagram(&cfg, Ipv4Addr::new(192, 0, 2, 1), IP_ICMP, &[3, 1, 0, 0, 0, 0, 0, 0]);
        h.engine.cx.icmp_error(&unreach, ICMP_UNREACH, ICMP_UNREACH_HOST);

        // Nor a broadcast.
        let bcast = testutil::ip_datagram(&cfg, Ipv4Addr::BROADCAST, IP_UDP, &[0; 8]);
        h.engine.cx.icmp_error(&bcast, ICMP_UNREACH, ICMP_UNREACH_PORT);

        // Nor a trailing fragment.
        let mut frag = testutil::ip_datagram(&cfg, Ipv4Addr::new(192, 0, 2, 1), IP_UDP, &[0; 8]);
        frag[6..8].copy_from_slice(&2u16.to_be_bytes());
        h.engine.cx.icmp_error(&frag, ICMP_UNREACH, ICMP_UNREACH_PORT);

        assert!(h.frames().is_empty());
        assert_eq!(h.engine.stats().icmp.errors_suppressed, 3);

        // An echo request is fine to complain about.
        let echo = testutil::ip_datagram(&cfg, Ipv4Addr::new(192, 0, 2, 1), IP_ICMP, &[8, 0, 0, 0, 0, 1, 0, 1]);
        h.engine.cx.icmp_error(&echo, ICMP_UNREACH, ICMP_UNREACH_HOST);
        assert_eq!(h.frames().len(), 1);
    }

    #[test]
    fn test_tracking_cache_is_bounded() {
        let now = Instant::now();
        let mut proxy = EchoProxy::new(2, Duration::from_secs(10));
        assert!(!proxy.track(entry(1, now)));
        assert!(!proxy.track(entry(2, now)));
        assert!(proxy.track(entry(3, now)));
        assert!(proxy.take(77, 1, Ipv4Addr::new(192, 0, 2, 9)).is_none());
        assert!(proxy.take(77, 3, Ipv4Addr::new(192, 0, 2, 8)).is_none());
        assert!(proxy.take(77, 3, Ipv4Addr::new(192, 0, 2, 9)).is_some());
        assert_eq!(proxy.len(), 1);
    }

    #[test]
    fn test_tracking_entries_expire() {
        let now = Instant::now();
        let mut proxy = EchoProxy::new(8, Duration::from_secs(10));
        proxy.track(entry(1, now + Duration::from_secs(1)));
        proxy.track(entry(2, now + Duration::from_secs(5)));
        assert_eq!(proxy.expire(now), 0);
        assert_eq!(proxy.expire(now + Duration::from_secs(2)), 1);
        assert_eq!(proxy.expire(now + Duration::from_secs(6)), 1);
        assert!(proxy.is_empty());
    }

    #[test]
    fn test_host_reply_is_translated_for_the_guest() {
        let mut h = Harness::new();
        let cfg = h.engine.cx.cfg.clone();
        let remote = Ipv4Addr::new(192, 0, 2, 9);
        let now = h.engine.cx.now;
        h.engine.cx.echo.track(entry(3, now + Duration::from_secs(10)));

        let mut reply = vec![ICMP_ECHOREPLY, 0, 0, 0, 0, 77, 0, 3, b'p', b'o', b'n', b'g'];
        refresh_checksum(&mut reply);
        h.engine.cx.echo_reply_input(&reply, remote);

        let frames = h.frames();
        assert_eq!(frames.len(), 1);
        let (ip, msg) = testutil::split_ip(&frames[0]);
        assert_eq!((ip.src, ip.dst), (remote, cfg.guest));
        let icmp = IcmpHeader::parse(msg).unwrap();
        assert_eq!((icmp.ident, icmp.seq), (5, 103));
        assert_eq!(internet_checksum(msg), 0);
        assert!(h.engine.cx.echo.is_empty());

        // A second copy matches nothing.
        h.engine.cx.echo_reply_input(&reply, remote);
        assert!(h.frames().is_empty());
    }

    #[test]
    fn test_pings_sharing_a_sequence_are_told_apart() {
        let mut h = Harness::new();
        let cfg = h.engine.cx.cfg.clone();
        let remote = Ipv4Addr::new(192, 0, 2, 9);
        let deadline = h.engine.cx.now + Duration::from_secs(10);
        let echo = &mut h.engine.cx.echo;
        let (first, second) = (echo.alloc_seq(), echo.alloc_seq());
        assert_ne!(first, second);
        for (host_seq, guest_ident) in [(first, 5), (second, 6)] {
            let mut e = entry(9, deadline);
            e.host_seq = host_seq;
            e.guest_ident = guest_ident;
            e.guest_seq = 9;
            echo.track(e);
        }
        // A live entry's sequence is never handed out again.
        echo.next_seq = first - 1;
        assert_ne!(echo.alloc_seq(), first);

        for host_seq in [second, first] {
            let mut reply = vec![ICMP_ECHOREPLY, 0, 0, 0, 0, 77];
            reply.extend_from_slice(&host_seq.to_be_bytes());
            refresh_checksum(&mut reply);
            h.engine.cx.echo_reply_input(&reply, remote);
        }
        let idents: Vec<(u16, u16)> = h
            .frames()
            .iter()
            .map(|f| {
                let (ip, msg) = testutil::split_ip(f);
                assert_eq!(ip.dst, cfg.guest);
                let icmp = IcmpHeader::parse(msg).unwrap();
                (icmp.ident, icmp.seq)
            })
            .collect();
        assert_eq!(idents, vec![(6, 9), (5, 9)]);
        assert!(h.engine.cx.echo.is_empty());
    }

    #[test]
    fn test_ping_loopback_through_host_socket() {
        let mut h = Harness::new();
        if !h.engine.cx.echo.ensure_open() {
            // No datagram or raw ICMP socket on this host.
            return;
        }
        let cfg = h.engine.cx.cfg.clone();
        for ident in [0x1111, 0x2222] {
            let ping = testutil::icmp_echo(&cfg, Ipv4Addr::LOCALHOST, ident, 7, b"loopback");
            h.engine.input(Mbuf::from_slice(0, &ping));
        }
        if h.engine.stats().icmp.proxy_failed > 0 {
            return;
        }
        assert_eq!(h.engine.stats().icmp.proxied, 2);

        let mut replies = Vec::new();
        for _ in 0..200 {
            h.engine.cx.icmp_host_input();
            for f in h.frames() {
                let (ip, msg) = testutil::split_ip(&f);
                assert_eq!((ip.src, ip.dst), (Ipv4Addr::LOCALHOST, cfg.guest));
                assert_eq!(internet_checksum(msg), 0);
                let icmp = IcmpHeader::parse(msg).unwrap();
                assert_eq!(icmp.icmp_type, ICMP_ECHOREPLY);
                assert_eq!(&msg[ICMP_MINLEN..], b"loopback");
                replies.push((icmp.ident, icmp.seq));
            }
            if replies.len() == 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        replies.sort();
        assert_eq!(replies, vec![(0x1111, 7), (0x2222, 7)]);
        assert!(h.engine.cx.echo.is_empty());
    }

    #[test]
    fn test_payload_detection() {
        let echo = [0u8, 0, 0, 0, 0, 1, 0, 1];
        assert_eq!(icmp_payload(&echo), &echo);
        let mut with_ip = vec![0x45, 0, 0, 28, 0, 0, 0, 0, 64, 1, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2];
        with_ip.extend_from_slice(&echo);
        assert_eq!(icmp_payload(&with_ip), &echo);
    }
}
