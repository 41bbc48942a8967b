//! TCP fast and slow timer routines.

use log::{debug, trace};

use super::tcb::{
    range_set, TCP_BACKOFF, TCP_MAXIDLE, TCP_MAXRXTSHIFT, TCP_RTT_SHIFT, TCPT_2MSL, TCPT_KEEP, TCPT_NTIMERS,
    TCPT_PERSIST, TCPT_REXMT, TCPTV_KEEPINTVL, TCPTV_KEEP_IDLE, TCPTV_REXMTMAX,
};
use super::{TcbFlags, TcpState};
use crate::engine::Context;
use crate::socket::{SockState, TcpSocket};
use crate::wire::TcpFlags;

impl Context {
    /// Fast tick: flush a pending delayed ACK.
    pub(crate) fn tcp_fasttimo(&mut self, ts: &mut TcpSocket) {
        if ts.tp.flags.contains(TcbFlags::DELACK) {
            ts.tp.flags.remove(TcbFlags::DELACK);
            ts.tp.flags |= TcbFlags::ACKNOW;
            self.stats.tcp.delack += 1;
            self.tcp_output(ts);
        }
    }

    /// Slow tick: count down the four timers and act on those that fire.
    pub(crate) fn tcp_slowtimo(&mut self, ts: &mut TcpSocket) {
        if ts.so.is_freed() {
            return;
        }
        for slot in 0..TCPT_NTIMERS {
            let t = ts.tp.timers[slot];
            if t != 0 {
                ts.tp.timers[slot] = t - 1;
                if t == 1 {
                    self.tcp_timers(ts, slot);
                    if ts.so.is_freed() {
                        return;
                    }
                }
            }
        }
        ts.tp.idle += 1;
        if ts.tp.rtt != 0 {
            ts.tp.rtt += 1;
        }
    }

    fn tcp_timers(&mut self, ts: &mut TcpSocket, slot: usize) {
        match slot {
            TCPT_REXMT => self.tcp_rexmt_timeout(ts),
            TCPT_PERSIST => {
                self.stats.tcp.persisttimeo += 1;
                ts.tp.set_persist();
                ts.tp.force = true;
                self.tcp_output(ts);
                ts.tp.force = false;
            }
            TCPT_KEEP => self.tcp_keep_timeout(ts),
            TCPT_2MSL => {
                // Half-closed connections get more time while the guest
                // keeps talking.
                if ts.tp.state != TcpState::TimeWait && ts.tp.idle <= TCP_MAXIDLE {
                    ts.tp.timers[TCPT_2MSL] = TCPTV_KEEPINTVL;
                } else {
                    self.tcp_close(ts);
                }
            }
            _ => {}
        }
    }

    /// Retransmit timeout: back off, collapse the congestion window and
    /// resend from the oldest unacknowledged byte.
    fn tcp_rexmt_timeout(&mut self, ts: &mut TcpSocket) {
        let tp = &mut ts.tp;
        tp.rxtshift += 1;
        if tp.rxtshift > TCP_MAXRXTSHIFT {
            tp.rxtshift = TCP_MAXRXTSHIFT;
            debug!("tcp: {} <-> {} retransmit timeout, dropping", ts.so.guest, ts.so.remote);
            self.stats.tcp.timeoutdrop += 1;
            self.tcp_drop(ts);
            return;
        }
        self.stats.tcp.rexmttimeo += 1;
        tp.rxtcur = range_set(tp.rexmtval() * TCP_BACKOFF[tp.rxtshift], tp.rttmin, TCPTV_REXMTMAX);
        tp.timers[TCPT_REXMT] = tp.rxtcur;

        // After several backoffs the estimate is suspect: fold it into the
        // variance and start over.
        if tp.rxtshift > TCP_MAXRXTSHIFT / 4 {
            tp.rttvar += tp.srtt >> TCP_RTT_SHIFT;
            tp.srtt = 0;
        }
        tp.snd_nxt = tp.snd_una;
        tp.rtt = 0;

        let mss = u32::from(tp.maxseg);
        let win = (tp.snd_wnd.min(tp.snd_cwnd) / 2 / mss).max(2);
        tp.snd_cwnd = mss;
        tp.snd_ssthresh = win * mss;
        tp.dupacks = 0;
        trace!("tcp: {} rexmt shift {} rxtcur {}", ts.so.guest, tp.rxtshift, tp.rxtcur);
        self.tcp_output(ts);
    }

    /// Connection-establishment timeout, or keepalive probing.
    fn tcp_keep_timeout(&mut self, ts: &mut TcpSocket) {
        if ts.tp.state < TcpState::Established {
            debug!("tcp: {} -> {} handshake timed out", ts.so.guest, ts.so.remote);
            self.stats.tcp.keepdrops += 1;
            self.tcp_drop(ts);
            return;
        }
        if self.cfg.keepalive && ts.tp.state <= TcpState::CloseWait {
            if ts.tp.idle >= TCPTV_KEEP_IDLE + TCP_MAXIDLE {
                self.stats.tcp.keepdrops += 1;
                self.tcp_drop(ts);
                return;
            }
            // Probe with an old sequence number to provoke an ACK.
            self.stats.tcp.keepprobe += 1;
            let (guest, remote) = (ts.so.guest, ts.so.remote);
            let (seq, ack) = (ts.tp.snd_una.wrapping_sub(1), ts.tp.rcv_nxt);
            self.tcp_respond(guest, remote, seq, ack, TcpFlags::ACK, 0);
            ts.tp.timers[TCPT_KEEP] = TCPTV_KEEPINTVL;
        } else {
            ts.tp.timers[TCPT_KEEP] = TCPTV_KEEP_IDLE;
        }
    }
}

/// Whether any protocol timer is armed on the socket.
pub(crate) fn timers_armed(ts: &TcpSocket) -> bool {
    !ts.so.state.contains(SockState::FREE_PENDING) && ts.tp.timers.iter().any(|&t| t != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::Harness;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn established(h: &Harness) -> TcpSocket {
        let cfg = &h.engine.cx.cfg;
        let guest = SocketAddrV4::new(cfg.guest, 40000);
        let remote = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 80);
        let mut ts = TcpSocket::new(guest, remote, cfg.so_buf_size, cfg.mss);
        ts.tp.state = TcpState::Established;
        ts.tp.iss = 1000;
        ts.tp.sendseqinit();
        ts.tp.irs = 5000;
        ts.tp.rcvseqinit();
        ts.tp.snd_wnd = 65535;
        ts
    }

    #[test]
    fn test_delack_flushed_by_fast_timer() {
        let mut h = Harness::new();
        let mut ts = established(&h);
        ts.tp.flags |= TcbFlags::DELACK;
        h.engine.cx.tcp_fasttimo(&mut ts);
        assert!(!ts.tp.delack_pending());
        assert_eq!(h.engine.cx.stats.tcp.delack, 1);
        assert_eq!(h.frames().len(), 1);
    }

    #[test]
    fn test_rexmt_backoff_collapses_window() {
        let mut h = Harness::new();
        let mut ts = established(&h);
        ts.so.snd.write(&[7u8; 3000]);
        h.engine.cx.tcp_output(&mut ts);
        let sent = h.frames().len();
        assert!(sent >= 1);
        assert_ne!(ts.tp.timers[TCPT_REXMT], 0);

        let rxtcur = ts.tp.rxtcur;
        ts.tp.timers[TCPT_REXMT] = 1;
        h.engine.cx.tcp_slowtimo(&mut ts);
        assert_eq!(ts.tp.rxtshift, 1);
        assert_eq!(ts.tp.snd_cwnd, u32::from(ts.tp.maxseg));
        assert!(ts.tp.rxtcur >= rxtcur);
        assert_eq!(h.engine.cx.stats.tcp.rexmttimeo, 1);
        // One segment retransmitted under the collapsed window.
        assert_eq!(h.frames().len(), 1);
    }

    #[test]
    fn test_rexmt_gives_up_after_max_shift() {
        let mut h = Harness::new();
        let mut ts = established(&h);
        ts.so.snd.write(b"data");
        h.engine.cx.tcp_output(&mut ts);
        ts.tp.rxtshift = TCP_MAXRXTSHIFT;
        ts.tp.timers[TCPT_REXMT] = 1;
        h.engine.cx.tcp_slowtimo(&mut ts);
        assert!(ts.so.is_freed());
        assert_eq!(h.engine.cx.stats.tcp.timeoutdrop, 1);
        assert_eq!(h.engine.cx.stats.tcp.drops, 1);
    }

    #[test]
    fn test_handshake_timeout_drops() {
        let mut h = Harness::new();
        let mut ts = established(&h);
        ts.tp.state = TcpState::SynReceived;
        ts.tp.timers[TCPT_KEEP] = 1;
        h.engine.cx.tcp_slowtimo(&mut ts);
        assert!(ts.so.is_freed());
        assert_eq!(h.engine.cx.stats.tcp.keepdrops, 1);
    }

    #[test]
    fn test_keepalive_probe() {
        let mut h = Harness::new();
        h.engine.cx.cfg.keepalive = true;
        let mut ts = established(&h);
        ts.tp.timers[TCPT_KEEP] = 1;
        h.engine.cx.tcp_slowtimo(&mut ts);
        assert_eq!(h.engine.cx.stats.tcp.keepprobe, 1);
        assert_eq!(ts.tp.timers[TCPT_KEEP], TCPTV_KEEPINTVL);
        assert_eq!(h.frames().len(), 1);
    }

    #[test]
    fn test_time_wait_expiry_closes() {
        let mut h = Harness::new();
        let mut ts = established(&h);
        h.engine.cx.tcp_time_wait(&mut ts);
        assert!(timers_armed(&ts));
        ts.tp.timers[TCPT_2MSL] = 1;
        h.engine.cx.tcp_slowtimo(&mut ts);
        assert!(ts.so.is_freed());
        assert!(!timers_armed(&ts));
    }
}
