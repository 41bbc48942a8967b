//! Port forwarding: host ports mapped into the guest.
//!
//! A TCP rule owns a listening host socket kept in the TCP list in the
//! accepting state; each accepted host connection becomes a Virtual Socket
//! whose Control Block opens actively towards the guest. A UDP rule owns a
//! bound host socket in the UDP list that never expires.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use log::{debug, info};
use socket2::{Domain, Protocol, Type};

use crate::config::GUEST_IP;
use crate::engine::Engine;
use crate::error::{NetError, Result};
use crate::socket::{SockHandle, SockProto, SockState, Socket, TcpSocket};

const LISTEN_BACKLOG: i32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForwardRule {
    pub proto: SockProto,
    /// Host address the listener binds to.
    pub bind_addr: Ipv4Addr,
    pub host_port: u16,
    pub guest_addr: Ipv4Addr,
    pub guest_port: u16,
}

impl ForwardRule {
    pub fn tcp(host_port: u16, guest_port: u16) -> Self {
        ForwardRule {
            proto: SockProto::Tcp,
            bind_addr: Ipv4Addr::LOCALHOST,
            host_port,
            guest_addr: GUEST_IP,
            guest_port,
        }
    }

    pub fn udp(host_port: u16, guest_port: u16) -> Self {
        ForwardRule {
            proto: SockProto::Udp,
            ..Self::tcp(host_port, guest_port)
        }
    }

    /// Two rules collide when they claim the same host endpoint.
    fn same_host_side(&self, other: &ForwardRule) -> bool {
        self.proto == other.proto && self.bind_addr == other.bind_addr && self.host_port == other.host_port
    }

    fn host_endpoint(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.bind_addr, self.host_port)
    }
}

impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{} -> {}:{}",
            self.proto, self.bind_addr, self.host_port, self.guest_addr, self.guest_port
        )
    }
}

/// Parses `PROTO:HOSTPORT:GUESTPORT` or `PROTO:BINDADDR:HOSTPORT:GUESTPORT`.
impl FromStr for ForwardRule {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || NetError::Forward(format!("invalid forward rule '{s}' (expected tcp|udp:[BIND:]HOST:GUEST)"));
        let parts: Vec<&str> = s.split(':').collect();
        let proto = match parts.first().copied() {
            Some("tcp") => SockProto::Tcp,
            Some("udp") => SockProto::Udp,
            _ => return Err(bad()),
        };
        let (bind_addr, host, guest) = match parts.len() {
            3 => (Ipv4Addr::LOCALHOST, parts[1], parts[2]),
            4 => (parts[1].parse().map_err(|_| bad())?, parts[2], parts[3]),
            _ => return Err(bad()),
        };
        let host_port: u16 = host.parse().map_err(|_| bad())?;
        let guest_port: u16 = guest.parse().map_err(|_| bad())?;
        if host_port == 0 || guest_port == 0 {
            return Err(bad());
        }
        Ok(ForwardRule {
            proto,
            bind_addr,
            host_port,
            guest_addr: GUEST_IP,
            guest_port,
        })
    }
}

impl Engine {
    /// Install a rule: bind its host socket and register it.
    pub fn add_forward(&mut self, rule: ForwardRule) -> Result<()> {
        if self.forwards.iter().any(|(r, _)| r.same_host_side(&rule)) {
            return Err(NetError::Forward(format!("{} port {} already forwarded", rule.proto, rule.host_port)));
        }
        if !self.cx.cfg.in_subnet(rule.guest_addr) {
            return Err(NetError::Forward(format!("guest address {} is outside the network", rule.guest_addr)));
        }
        let guest = SocketAddrV4::new(rule.guest_addr, rule.guest_port);
        let bound = rule.host_endpoint();
        let handle = match rule.proto {
            SockProto::Tcp => {
                let fd = socket2::Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
                fd.set_reuse_address(true)?;
                fd.bind(&bound.into())?;
                fd.listen(LISTEN_BACKLOG)?;
                fd.set_nonblocking(true)?;
                let mut ts = TcpSocket::new(guest, bound, self.cx.cfg.so_buf_size, self.cx.cfg.mss);
                ts.so.fd = Some(fd);
                ts.so.state = SockState::ACCEPTING;
                ts.so.forward = Some(rule);
                self.tcb.insert(ts)
            }
            SockProto::Udp => {
                let fd = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
                fd.set_reuse_address(true)?;
                fd.bind(&bound.into())?;
                fd.set_nonblocking(true)?;
                let mut so = Socket::new(SockProto::Udp, guest, bound, 0);
                so.fd = Some(fd);
                so.isfconnected();
                so.forward = Some(rule);
                self.udb.insert(so)
            }
        };
        info!("forwarding {rule}");
        self.forwards.push((rule, handle));
        Ok(())
    }

    /// Remove a rule and close its host socket. Connections already
    /// accepted through it are left alone.
    pub fn remove_forward(&mut self, rule: &ForwardRule) -> Result<()> {
        let Some(pos) = self.forwards.iter().position(|(r, _)| r.same_host_side(rule)) else {
            return Err(NetError::Forward(format!("{} port {} is not forwarded", rule.proto, rule.host_port)));
        };
        let (rule, handle) = self.forwards.remove(pos);
        match rule.proto {
            SockProto::Tcp => {
                if let Some(ts) = self.tcb.get_mut(handle) {
                    ts.so.mark_for_free();
                }
                self.tcb.sweep();
            }
            SockProto::Udp => {
                if let Some(so) = self.udb.get_mut(handle) {
                    so.mark_for_free();
                }
                self.udb.sweep();
            }
        }
        info!("stopped forwarding {rule}");
        Ok(())
    }

    pub fn forwards(&self) -> Vec<ForwardRule> {
        self.forwards.iter().map(|(r, _)| *r).collect()
    }

    /// Accept pending host connections on a forward listener and open
    /// each one towards the guest.
    pub(crate) fn tcp_accept(&mut self, h: SockHandle) {
        loop {
            let Some(listener) = self.tcb.get(h) else {
                return;
            };
            let Some(rule) = listener.so.forward else {
                return;
            };
            let Some(fd) = listener.so.fd.as_ref() else {
                return;
            };
            let (conn, peer) = match fd.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("forward {rule}: accept failed: {e}");
                    return;
                }
            };
            let Some(peer) = peer.as_socket_ipv4() else {
                continue;
            };
            if let Err(e) = conn.set_nonblocking(true) {
                debug!("forward {rule}: {e}");
                continue;
            }
            if let Err(e) = conn.set_nodelay(true) {
                debug!("forward {rule}: set_nodelay: {e}");
            }

            // The guest sees loopback peers as the gateway.
            let remote_ip = if peer.ip().is_loopback() {
                self.cx.cfg.gateway
            } else {
                *peer.ip()
            };
            let guest = SocketAddrV4::new(rule.guest_addr, rule.guest_port);
            let remote = SocketAddrV4::new(remote_ip, peer.port());
            debug!("forward {rule}: accepted {peer}, opening {remote} -> {guest}");

            let mut ts = TcpSocket::new(guest, remote, self.cx.cfg.so_buf_size, self.cx.cfg.mss);
            ts.so.fd = Some(conn);
            ts.so.isfconnected();
            let nh = self.tcb.insert(ts);
            if let Some(ts) = self.tcb.get_mut(nh) {
                self.cx.tcp_active_open(ts);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::TcpState;
    use crate::testutil::{self, Harness};
    use crate::wire::TcpFlags;
    use std::net::TcpStream;

    #[test]
    fn test_parse_rules() {
        let r: ForwardRule = "tcp:8080:80".parse().unwrap();
        assert_eq!(r, ForwardRule::tcp(8080, 80));
        let r: ForwardRule = "udp:0.0.0.0:5353:53".parse().unwrap();
        assert_eq!(r.proto, SockProto::Udp);
        assert_eq!(r.bind_addr, Ipv4Addr::UNSPECIFIED);
        assert_eq!((r.host_port, r.guest_port), (5353, 53));
        assert!("icmp:1:2".parse::<ForwardRule>().is_err());
        assert!("tcp:80".parse::<ForwardRule>().is_err());
        assert!("tcp:x:80".parse::<ForwardRule>().is_err());
        assert!("tcp:0:80".parse::<ForwardRule>().is_err());
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn test_duplicate_rules_rejected() {
        let mut h = Harness::new();
        let rule = ForwardRule::tcp(free_port(), 80);
        h.engine.add_forward(rule).unwrap();
        assert!(matches!(h.engine.add_forward(rule), Err(NetError::Forward(_))));
        assert_eq!(h.engine.forwards(), vec![rule]);

        h.engine.remove_forward(&rule).unwrap();
        assert!(h.engine.forwards().is_empty());
        assert!(h.engine.tcb.is_empty());
        assert!(matches!(h.engine.remove_forward(&rule), Err(NetError::Forward(_))));
    }

    #[test]
    fn test_accepted_connection_opens_towards_guest() {
        let mut h = Harness::new();
        let port = free_port();
        let rule = ForwardRule::tcp(port, 22);
        h.engine.add_forward(rule).unwrap();
        let listener = h.engine.forwards[0].1;

        let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut opened = None;
        for _ in 0..100 {
            h.engine.tcp_accept(listener);
            opened = h.engine.tcb.find(|ts| ts.tp.state == TcpState::SynSent);
            if opened.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let ts = h.engine.tcb.get(opened.unwrap()).unwrap();
        assert_eq!(ts.so.guest, SocketAddrV4::new(GUEST_IP, 22));
        assert_eq!(*ts.so.remote.ip(), h.engine.cx.cfg.gateway);

        let frames = h.frames();
        assert_eq!(frames.len(), 1);
        let (_, th, _) = testutil::split_tcp(&frames[0]);
        assert_eq!(th.flags, TcpFlags::SYN);
        assert_eq!(th.dport, 22);
    }
}
