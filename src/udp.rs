//! UDP pseudo-connections.
//!
//! Each guest endpoint `(address, port)` gets one Virtual Socket backed by a
//! host datagram socket, created on its first datagram and torn down after
//! an idle period (short for port 53, where one question gets one answer).
//! Outbound destinations go through the same NAT mapping as TCP; replies
//! have their source mapped back to the address the guest used.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Instant;

use log::{debug, trace};
use socket2::{Protocol, Type};

use crate::engine::{Context, Engine, TxClass};
use crate::mbuf::{Mbuf, MAX_HEADROOM};
use crate::socket::{host_socket, recv_from_v4, SockHandle, SockProto, Socket};
use crate::tcp::subr::host_target;
use crate::wire::icmp::{ICMP_UNREACH, ICMP_UNREACH_HOST, ICMP_UNREACH_NET, ICMP_UNREACH_PORT};
use crate::wire::{pseudo_header_checksum, Ipv4Header, UdpHeader, IP_UDP, UDP_HEADER_LEN};

/// Port whose flows use the short DNS idle timeout.
pub const DNS_PORT: u16 = 53;
/// BOOTP/DHCP server port; lease handling is not done here.
const BOOTP_SERVER: u16 = 67;
/// Frames a socket may have waiting in delivery before its reads pause.
pub const MAX_QUEUED: usize = 4;

/// ICMP unreachable code for a failed host `sendto`, if the failure is
/// worth reporting.
fn unreach_code(err: &io::Error) -> Option<u8> {
    match err.raw_os_error() {
        Some(libc::ENETUNREACH) => Some(ICMP_UNREACH_NET),
        Some(libc::EHOSTUNREACH) | Some(libc::EHOSTDOWN) => Some(ICMP_UNREACH_HOST),
        Some(libc::ECONNREFUSED) => Some(ICMP_UNREACH_PORT),
        _ => None,
    }
}

impl Engine {
    /// UDP datagram from the guest; `m` holds the whole datagram.
    pub(crate) fn udp_input(&mut self, mut m: Mbuf, ip: &Ipv4Header) {
        let stats = &mut self.cx.stats.udp;
        stats.received += 1;

        let Some(uh) = UdpHeader::parse(&m.data()[ip.hlen..]) else {
            stats.tooshort += 1;
            return;
        };
        let ulen = usize::from(uh.len);
        let avail = m.len() - ip.hlen;
        if ulen < UDP_HEADER_LEN || ulen > avail {
            stats.badlen += 1;
            return;
        }
        m.truncate(ip.hlen + ulen);
        if uh.checksum != 0 && pseudo_header_checksum(ip.src, ip.dst, IP_UDP, &m.data()[ip.hlen..]) != 0 {
            stats.badsum += 1;
            return;
        }

        if uh.dport == BOOTP_SERVER {
            trace!("udp: ignoring BOOTP request from {}:{}", ip.src, uh.sport);
            return;
        }
        if ip.dst.is_broadcast() || ip.dst == self.cx.cfg.subnet_broadcast() {
            trace!("udp: dropping broadcast to port {}", uh.dport);
            return;
        }

        let guest = SocketAddrV4::new(ip.src, uh.sport);
        let remote = SocketAddrV4::new(ip.dst, uh.dport);
        let Some(h) = self.udp_lookup(guest).or_else(|| self.udp_attach(guest, remote)) else {
            return;
        };
        self.udp_last = Some(h);
        let Some(so) = self.udb.get_mut(h) else {
            return;
        };
        self.cx.udp_output(so, &m, ip, remote);
    }

    fn udp_lookup(&self, guest: SocketAddrV4) -> Option<SockHandle> {
        self.udp_last
            .filter(|h| self.udb.get(*h).is_some_and(|so| so.guest == guest))
            .or_else(|| self.udb.find(|so| so.guest == guest))
    }

    /// New pseudo-connection for a guest endpoint.
    fn udp_attach(&mut self, guest: SocketAddrV4, remote: SocketAddrV4) -> Option<SockHandle> {
        let fd = match host_socket(Type::DGRAM, Protocol::UDP, self.cx.cfg.bind_addr) {
            Ok(fd) => fd,
            Err(e) => {
                debug!("udp: no host socket for {guest}: {e}");
                self.cx.stats.udp.host_errors += 1;
                return None;
            }
        };
        let mut so = Socket::new(SockProto::Udp, guest, remote, 0);
        so.fd = Some(fd);
        so.isfconnected();
        trace!("udp: new socket for {guest}");
        Some(self.udb.insert(so))
    }

    /// Host datagrams waiting on a UDP socket.
    pub(crate) fn udp_host_input(&mut self, h: SockHandle) {
        let Some(so) = self.udb.get_mut(h) else {
            return;
        };
        self.cx.udp_recv(so);
    }

    /// Tear down pseudo-connections idle past their deadline. Forwarded
    /// sockets carry no deadline and stay.
    pub fn udp_expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        for h in self.udb.handles() {
            let Some(so) = self.udb.get_mut(h) else {
                continue;
            };
            if so.expire.is_some_and(|t| t <= now) {
                trace!("udp: {} idle, closing", so.guest);
                so.mark_for_free();
                expired += 1;
            }
        }
        self.cx.stats.udp.expired += expired as u64;
        self.udb.sweep();
        expired
    }
}

impl Context {
    /// Idle deadline for a flow to `port`, measured from now.
    fn udp_deadline(&self, port: u16) -> Instant {
        let idle = if port == DNS_PORT {
            self.cfg.dns_timeout
        } else {
            self.cfg.udp_timeout
        };
        self.now + idle
    }

    /// Send the guest datagram held in `m` through the socket.
    fn udp_output(&mut self, so: &mut Socket, m: &Mbuf, ip: &Ipv4Header, remote: SocketAddrV4) {
        let payload = &m.data()[ip.hlen + UDP_HEADER_LEN..];
        let target = match host_target(&self.cfg, *remote.ip()) {
            Ok(addr) => SocketAddrV4::new(addr, remote.port()),
            Err(e) => {
                trace!("udp: {remote} unreachable: {e}");
                self.stats.udp.host_errors += 1;
                self.icmp_error(m.data(), ICMP_UNREACH, ICMP_UNREACH_HOST);
                return;
            }
        };
        let Some(fd) = so.fd.as_ref() else {
            return;
        };
        match fd.send_to(payload, &target.into()) {
            Ok(_) => {
                self.stats.udp.sent += 1;
                so.remote = remote;
                if so.forward.is_none() {
                    so.expire = Some(self.udp_deadline(remote.port()));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!("udp: host send buffer full, dropping datagram to {target}");
            }
            Err(e) => {
                debug!("udp: sendto {target} failed: {e}");
                self.stats.udp.host_errors += 1;
                if let Some(code) = unreach_code(&e) {
                    self.icmp_error(m.data(), ICMP_UNREACH, code);
                }
            }
        }
    }

    /// Map a host datagram's source back to what the guest addressed.
    /// A reply from the socket's current target carries the guest's own
    /// destination; other sources fall back to the alias mappings.
    fn udp_guest_source(&self, so: &Socket, from: SocketAddrV4) -> SocketAddrV4 {
        let target = host_target(&self.cfg, *so.remote.ip()).ok();
        if target == Some(*from.ip()) && from.port() == so.remote.port() {
            so.remote
        } else if *from.ip() == self.cfg.host_nameserver() && from.port() == DNS_PORT {
            SocketAddrV4::new(self.cfg.dns, DNS_PORT)
        } else if from.ip().is_loopback() {
            SocketAddrV4::new(self.cfg.gateway, from.port())
        } else {
            from
        }
    }

    /// Read host datagrams and deliver them to the guest, pausing once
    /// enough are waiting in delivery.
    fn udp_recv(&mut self, so: &mut Socket) {
        let Some(fd) = so.raw_fd() else {
            return;
        };
        let mut buf = vec![0u8; 65536];
        while so.queued() <= MAX_QUEUED {
            let (n, from) = match recv_from_v4(fd, &mut buf) {
                Ok(r) => r,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Typically a port unreachable for an earlier send.
                    debug!("udp: recv on {} failed: {e}", so.guest);
                    self.stats.udp.host_errors += 1;
                    break;
                }
            };
            let src = self.udp_guest_source(so, from);
            self.udp_deliver(so, src, &buf[..n]);
            if so.forward.is_none() {
                so.expire = Some(self.udp_deadline(src.port()));
            }
        }
    }

    /// Build a UDP datagram from `src` to the socket's guest endpoint.
    fn udp_deliver(&mut self, so: &Socket, src: SocketAddrV4, payload: &[u8]) {
        let ulen = UDP_HEADER_LEN + payload.len();
        if ulen > usize::from(u16::MAX) - crate::wire::IPV4_HEADER_LEN {
            return;
        }
        let mut m = Mbuf::with_headroom(MAX_HEADROOM, ulen);
        m.append(payload);
        let uh = UdpHeader {
            sport: src.port(),
            dport: so.guest.port(),
            len: ulen as u16,
            checksum: 0,
        };
        uh.write(m.prepend(UDP_HEADER_LEN));
        let mut cksum = pseudo_header_checksum(*src.ip(), *so.guest.ip(), IP_UDP, m.data());
        if cksum == 0 {
            cksum = 0xffff;
        }
        m.data_mut()[6..8].copy_from_slice(&cksum.to_be_bytes());
        self.stats.udp.delivered += 1;
        self.ip_output(m, *src.ip(), *so.guest.ip(), IP_UDP, TxClass::Counted(so.queued.clone()));
    }
}

/// Whether the poller should watch the socket for reads.
pub(crate) fn wants_read(so: &Socket, now: Instant) -> bool {
    so.fd.is_some() && so.queued() <= MAX_QUEUED && !so.expire.is_some_and(|t| t <= now)
}
