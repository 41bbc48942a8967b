//! Connection lifecycle: host connects, close, drop and half-close.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};

use log::{debug, trace};
use socket2::{Protocol, Type};

use super::tcb::{TCPT_2MSL, TCPT_KEEP, TCPTV_KEEP_INIT, TCPTV_MSL};
use super::{SavedSyn, TcbFlags, TcpState, Verdict};
use crate::config::NetConfig;
use crate::engine::Context;
use crate::mbuf::Mbuf;
use crate::socket::{host_socket, TcpSocket};
use crate::wire::icmp::{ICMP_UNREACH, ICMP_UNREACH_HOST, ICMP_UNREACH_NET};
use crate::wire::TcpFlags;

/// How a failed host connect is reported to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    /// Connection refused: answer the SYN with RST.
    Reset,
    /// ICMP destination unreachable with this code.
    Unreachable(u8),
}

impl ConnectFailure {
    pub fn from_error(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ECONNREFUSED) => ConnectFailure::Reset,
            Some(libc::ENETUNREACH) => ConnectFailure::Unreachable(ICMP_UNREACH_NET),
            _ => ConnectFailure::Unreachable(ICMP_UNREACH_HOST),
        }
    }
}

/// Where a guest connection to `dst` really goes on the host.
pub fn host_target(cfg: &NetConfig, dst: Ipv4Addr) -> io::Result<Ipv4Addr> {
    if dst == cfg.gateway {
        Ok(Ipv4Addr::LOCALHOST)
    } else if dst == cfg.dns {
        Ok(cfg.host_nameserver())
    } else if cfg.in_subnet(dst) {
        // Nothing lives in the virtual subnet besides the guest.
        Err(io::Error::from_raw_os_error(libc::EHOSTUNREACH))
    } else {
        Ok(dst)
    }
}

impl Context {
    /// Start a non-blocking host connect for the socket's foreign endpoint.
    /// Returns whether it completed immediately.
    pub(crate) fn tcp_fconnect(&mut self, ts: &mut TcpSocket) -> io::Result<bool> {
        let target = host_target(&self.cfg, *ts.so.remote.ip())?;
        let addr = SocketAddrV4::new(target, ts.so.remote.port());
        let sock = host_socket(Type::STREAM, Protocol::TCP, self.cfg.bind_addr)?;
        if let Err(e) = sock.set_nodelay(true) {
            debug!("tcp: {} set_nodelay: {e}", ts.so.guest);
        }
        debug!("tcp: connecting {} -> {addr}", ts.so.guest);
        let done = match sock.connect(&addr.into()) {
            Ok(()) => true,
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => false,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(e) => return Err(e),
        };
        ts.so.fd = Some(sock);
        if done {
            ts.so.isfconnected();
        } else {
            ts.so.isfconnecting();
        }
        Ok(done)
    }

    /// A guest SYN on a fresh socket in LISTEN: connect to the host and
    /// park the SYN until the connect resolves.
    pub(crate) fn tcp_listen_input(&mut self, ts: &mut TcpSocket, syn: SavedSyn) {
        self.stats.tcp.connattempt += 1;
        ts.tp.negotiate_mss(syn.mss, self.cfg.mss);
        ts.syn = Some(syn);
        match self.tcp_fconnect(ts) {
            Ok(true) => self.tcp_connected(ts),
            Ok(false) => {
                ts.tp.timers[TCPT_KEEP] = TCPTV_KEEP_INIT;
            }
            Err(e) => {
                debug!("tcp: connect {} -> {} failed: {e}", ts.so.guest, ts.so.remote);
                self.tcp_connect_failed(ts, &e);
            }
        }
    }

    /// The host connect completed: answer the parked SYN.
    pub(crate) fn tcp_connected(&mut self, ts: &mut TcpSocket) {
        let Some(syn) = ts.syn.take() else {
            return;
        };
        ts.so.isfconnected();
        let tp = &mut ts.tp;
        tp.iss = self.next_iss();
        tp.irs = syn.seq;
        tp.sendseqinit();
        tp.rcvseqinit();
        tp.flags |= TcbFlags::ACKNOW;
        tp.state = TcpState::SynReceived;
        tp.timers[TCPT_KEEP] = TCPTV_KEEP_INIT;
        tp.snd_wnd = syn.win;
        self.stats.tcp.accepts += 1;
        trace!("tcp: {} -> {} host side connected", ts.so.guest, ts.so.remote);

        let seg = super::Segment {
            seq: syn.seq,
            ack: 0,
            flags: TcpFlags::SYN,
            win: syn.win,
            urp: 0,
            mss: syn.mss,
            data: Mbuf::with_headroom(0, 0),
        };
        let verdict = self.tcp_trim_then_step6(ts, seg);
        debug_assert_eq!(verdict, Verdict::Done);
    }

    /// The host connect failed: RST or ICMP error to the guest, then close.
    pub(crate) fn tcp_connect_failed(&mut self, ts: &mut TcpSocket, err: &io::Error) {
        let syn = ts.syn.take();
        match ConnectFailure::from_error(err) {
            ConnectFailure::Reset => {
                if let Some(syn) = &syn {
                    let ack = syn.seq.wrapping_add(1);
                    self.tcp_respond(ts.so.guest, ts.so.remote, 0, ack, TcpFlags::RST | TcpFlags::ACK, 0);
                }
            }
            ConnectFailure::Unreachable(code) => {
                if let Some(syn) = &syn {
                    self.icmp_error(&syn.quote, ICMP_UNREACH, code);
                }
            }
        }
        ts.tp.state = TcpState::Closed;
        self.tcp_close(ts);
    }

    /// Release the connection. The socket slot is reclaimed by the next
    /// sweep; calling this twice is harmless.
    pub(crate) fn tcp_close(&mut self, ts: &mut TcpSocket) {
        if ts.so.is_freed() {
            return;
        }
        ts.tp.reass.clear();
        ts.tp.cancel_timers();
        ts.tp.state = TcpState::Closed;
        ts.syn = None;
        ts.so.mark_for_free();
        self.stats.tcp.closed += 1;
    }

    /// Abort the connection, sending RST if the guest has synchronized.
    pub(crate) fn tcp_drop(&mut self, ts: &mut TcpSocket) {
        if ts.so.is_freed() {
            return;
        }
        if ts.tp.state.have_rcvd_syn() {
            ts.tp.state = TcpState::Closed;
            self.tcp_output(ts);
            self.stats.tcp.drops += 1;
        } else {
            self.stats.tcp.conndrops += 1;
        }
        self.tcp_close(ts);
    }

    /// The host will send no more: start our FIN.
    pub(crate) fn tcp_sockclosed(&mut self, ts: &mut TcpSocket) {
        match ts.tp.state {
            TcpState::Closed | TcpState::Listen | TcpState::SynSent => {
                self.tcp_close(ts);
                return;
            }
            TcpState::SynReceived | TcpState::Established => ts.tp.state = TcpState::FinWait1,
            TcpState::CloseWait => ts.tp.state = TcpState::LastAck,
            _ => {}
        }
        if ts.tp.state >= TcpState::FinWait2 {
            ts.so.isfdisconnected();
        }
        self.tcp_output(ts);
    }

    /// Enter TIME_WAIT.
    pub(crate) fn tcp_time_wait(&mut self, ts: &mut TcpSocket) {
        ts.tp.state = TcpState::TimeWait;
        ts.tp.cancel_timers();
        ts.tp.timers[TCPT_2MSL] = 2 * TCPTV_MSL;
        ts.so.isfdisconnected();
    }

    /// Begin an active open towards the guest (port forwarding).
    pub(crate) fn tcp_active_open(&mut self, ts: &mut TcpSocket) {
        let tp = &mut ts.tp;
        tp.iss = self.next_iss();
        tp.sendseqinit();
        tp.state = TcpState::SynSent;
        tp.timers[TCPT_KEEP] = TCPTV_KEEP_INIT;
        self.stats.tcp.connattempt += 1;
        self.tcp_output(ts);
    }
}

/// Quote of the guest datagram held in `m` (IP header at the front).
pub(crate) fn syn_quote(m: &Mbuf, ip_hlen: usize) -> Vec<u8> {
    let n = (ip_hlen + 8).min(m.len());
    m.data()[..n].to_vec()
}
