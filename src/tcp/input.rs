//! TCP input.
//!
//! [`Engine::tcp_input`] validates the segment and finds (or creates) its
//! Virtual Socket; the per-connection state machine runs as `Context`
//! methods and reports how the segment ends as a [`Verdict`], which the
//! caller carries out once.

use std::net::SocketAddrV4;

use log::trace;

use super::seq::{seq_diff, seq_gt, seq_leq, seq_lt};
use super::subr::syn_quote;
use super::tcb::{TCPREXMTTHRESH, TCPT_2MSL, TCPT_KEEP, TCPT_PERSIST, TCPT_REXMT, TCPTV_KEEP_IDLE, TCPTV_MSL};
use super::tcb::{TCP_MAXIDLE, TCP_MAXWIN, TCP_MAX_WINSHIFT};
use super::{SavedSyn, Segment, TcbFlags, TcpState, Verdict};
use crate::engine::{Context, Engine};
use crate::mbuf::Mbuf;
use crate::socket::{SockState, TcpSocket};
use crate::wire::tcp::parse_mss;
use crate::wire::{pseudo_header_checksum, Ipv4Header, TcpFlags, TcpHeader, IP_TCP, TCP_HEADER_LEN};

impl Engine {
    /// TCP segment from the guest; `m` holds the whole datagram.
    pub(crate) fn tcp_input(&mut self, mut m: Mbuf, ip: &Ipv4Header) {
        let stats = &mut self.cx.stats.tcp;
        stats.received += 1;

        let seg_bytes = &m.data()[ip.hlen..];
        let Some(th) = TcpHeader::parse(seg_bytes) else {
            stats.tooshort += 1;
            return;
        };
        if pseudo_header_checksum(ip.src, ip.dst, IP_TCP, seg_bytes) != 0 {
            stats.badsum += 1;
            return;
        }
        if th.hlen < TCP_HEADER_LEN || th.hlen > seg_bytes.len() {
            stats.badoff += 1;
            return;
        }
        let mss = if th.flags.contains(TcpFlags::SYN) {
            parse_mss(&seg_bytes[TCP_HEADER_LEN..th.hlen])
        } else {
            None
        };

        // Nothing but unicast takes part in TCP.
        if ip.dst.is_broadcast() || ip.dst == self.cx.cfg.subnet_broadcast() || ip.dst.is_multicast() {
            return;
        }

        let guest = SocketAddrV4::new(ip.src, th.sport);
        let remote = SocketAddrV4::new(ip.dst, th.dport);
        let quote = if th.flags.contains(TcpFlags::SYN) {
            syn_quote(&m, ip.hlen)
        } else {
            Vec::new()
        };
        m.trim_front(ip.hlen + th.hlen);
        let seg = Segment {
            seq: th.seq,
            ack: th.ack,
            flags: th.flags,
            win: u32::from(th.win),
            urp: th.urp,
            mss,
            data: m,
        };

        let found = self
            .tcp_last
            .filter(|h| {
                self.tcb
                    .get(*h)
                    .is_some_and(|ts| ts.so.guest == guest && ts.so.remote == remote)
            })
            .or_else(|| {
                self.tcb.find(|ts| {
                    ts.so.guest == guest && ts.so.remote == remote && !ts.so.state.contains(SockState::ACCEPTING)
                })
            });

        let Some(handle) = found else {
            // Only a bare SYN opens a connection.
            if seg.flags & (TcpFlags::SYN | TcpFlags::ACK | TcpFlags::RST | TcpFlags::FIN) == TcpFlags::SYN {
                let mut ts = TcpSocket::new(guest, remote, self.cx.cfg.so_buf_size, self.cx.cfg.mss);
                ts.tp.state = TcpState::Listen;
                trace!("tcp: new connection {guest} -> {remote}");
                let syn = SavedSyn {
                    seq: seg.seq,
                    win: seg.win,
                    mss: seg.mss,
                    quote,
                };
                let h = self.tcb.insert(ts);
                self.tcp_last = Some(h);
                if let Some(ts) = self.tcb.get_mut(h) {
                    self.cx.tcp_listen_input(ts, syn);
                }
                self.tcb.sweep();
                return;
            }
            self.cx.tcp_reject(guest, remote, &seg);
            return;
        };

        self.tcp_last = Some(handle);
        let Some(ts) = self.tcb.get_mut(handle) else {
            return;
        };
        let flags = seg.flags;
        let info = ResetInfo {
            seq: seg.seq,
            ack: seg.ack,
            len: seg.len() as u32,
        };
        match self.cx.tcp_segment(ts, seg) {
            Verdict::Done | Verdict::Drop => {}
            Verdict::DropAfterAck => {
                if !flags.contains(TcpFlags::RST) {
                    ts.tp.flags |= TcbFlags::ACKNOW;
                    self.cx.tcp_output(ts);
                }
            }
            Verdict::DropWithReset => {
                let (g, r) = (ts.so.guest, ts.so.remote);
                self.cx.tcp_reset_for(g, r, flags, &info);
            }
        }
        self.tcb.sweep();
    }
}

/// The fields of a segment a RST answer is computed from.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResetInfo {
    pub seq: u32,
    pub ack: u32,
    pub len: u32,
}

impl Context {
    /// Answer a segment that matches no connection.
    pub(crate) fn tcp_reject(&mut self, guest: SocketAddrV4, remote: SocketAddrV4, seg: &Segment) {
        let info = ResetInfo {
            seq: seg.seq,
            ack: seg.ack,
            len: seg.len() as u32,
        };
        self.tcp_reset_for(guest, remote, seg.flags, &info);
    }

    /// RST in answer to a segment, per RFC 793: never answer a RST, take
    /// the sequence from its ACK when it has one.
    pub(crate) fn tcp_reset_for(&mut self, guest: SocketAddrV4, remote: SocketAddrV4, flags: TcpFlags, seg: &ResetInfo) {
        if flags.contains(TcpFlags::RST) {
            return;
        }
        if flags.contains(TcpFlags::ACK) {
            self.tcp_respond(guest, remote, seg.ack, 0, TcpFlags::RST, 0);
        } else {
            let mut len = seg.len;
            if flags.contains(TcpFlags::SYN) {
                len += 1;
            }
            if flags.contains(TcpFlags::FIN) {
                len += 1;
            }
            self.tcp_respond(guest, remote, 0, seg.seq.wrapping_add(len), TcpFlags::RST | TcpFlags::ACK, 0);
        }
    }
}

// ======== State machine ========

impl Context {
    /// Run one segment through the connection's state machine.
    pub(crate) fn tcp_segment(&mut self, ts: &mut TcpSocket, mut seg: Segment) -> Verdict {
        // Still connecting on the host side; the guest will retransmit.
        if ts.syn.is_some() {
            return Verdict::Drop;
        }

        ts.tp.idle = 0;
        if ts.tp.state.have_established() {
            ts.tp.timers[TCPT_KEEP] = TCPTV_KEEP_IDLE;
        }

        if let Some(v) = self.tcp_predict(ts, &seg) {
            return v;
        }

        // Receive window: buffer space, never less than already offered.
        let space = ts.so.rcv.space() as i64;
        let offered = i64::from(seq_diff(ts.tp.rcv_adv, ts.tp.rcv_nxt));
        ts.tp.rcv_wnd = space.max(offered).max(0) as u32;

        match ts.tp.state {
            TcpState::Closed | TcpState::Listen => return Verdict::Drop,
            TcpState::SynSent => return self.tcp_syn_sent(ts, seg),
            _ => {}
        }

        // A RST is honoured only inside the window and with a sane ACK.
        if seg.flags.contains(TcpFlags::RST) {
            let ack = seg.flags.contains(TcpFlags::ACK).then_some(seg.ack);
            if !ts.tp.rst_acceptable(seg.seq, ack) {
                trace!("tcp: {} <-> {} ignoring stale RST seq {}", ts.so.guest, ts.so.remote, seg.seq);
                self.stats.tcp.rcvbadrst += 1;
                return Verdict::Drop;
            }
        }

        // ---- Trim to the receive window ----
        let tp = &mut ts.tp;
        let mut todrop = seq_diff(tp.rcv_nxt, seg.seq);
        if todrop > 0 {
            if seg.flags.contains(TcpFlags::SYN) {
                seg.flags.remove(TcpFlags::SYN);
                seg.seq = seg.seq.wrapping_add(1);
                if seg.urp > 1 {
                    seg.urp -= 1;
                } else {
                    seg.flags.remove(TcpFlags::URG);
                }
                todrop -= 1;
            }
            let len = seg.len() as i32;
            if todrop > len || (todrop == len && !seg.flags.contains(TcpFlags::FIN)) {
                // Entirely old, any FIN included. ACK to resynchronize but
                // keep going for RST and ACK processing.
                seg.flags.remove(TcpFlags::FIN);
                tp.flags |= TcbFlags::ACKNOW;
                todrop = len;
                self.stats.tcp.rcvduppack += 1;
            } else {
                self.stats.tcp.rcvpartduppack += 1;
            }
            seg.data.trim_front(todrop as usize);
            seg.seq = seg.seq.wrapping_add(todrop as u32);
            if i32::from(seg.urp) > todrop {
                seg.urp -= todrop as u16;
            } else {
                seg.flags.remove(TcpFlags::URG);
                seg.urp = 0;
            }
        }

        // Data after the host side is gone: reset.
        if ts.so.state.contains(SockState::NOFDREF) && ts.tp.state > TcpState::CloseWait && !seg.is_empty() {
            self.tcp_close(ts);
            return Verdict::DropWithReset;
        }

        let tp = &mut ts.tp;
        let todrop = seq_diff(
            seg.seq.wrapping_add(seg.len() as u32),
            tp.rcv_nxt.wrapping_add(tp.rcv_wnd),
        );
        if todrop > 0 {
            self.stats.tcp.rcvpackafterwin += 1;
            if todrop as usize >= seg.len() {
                // A new SYN in TIME_WAIT: give up the old incarnation, the
                // retransmitted SYN will open a fresh one.
                if seg.flags.contains(TcpFlags::SYN)
                    && tp.state == TcpState::TimeWait
                    && seq_gt(seg.seq, tp.rcv_nxt)
                {
                    self.tcp_close(ts);
                    return Verdict::Drop;
                }
                // Zero window: only a probe at the edge gets through.
                if tp.rcv_wnd == 0 && seg.seq == tp.rcv_nxt {
                    tp.flags |= TcbFlags::ACKNOW;
                } else {
                    return Verdict::DropAfterAck;
                }
            }
            seg.data.trim_back(todrop as usize);
            seg.flags.remove(TcpFlags::PSH | TcpFlags::FIN);
        }

        // ---- RST, SYN, ACK ----
        if seg.flags.contains(TcpFlags::RST) {
            match ts.tp.state {
                TcpState::SynReceived
                | TcpState::Established
                | TcpState::FinWait1
                | TcpState::FinWait2
                | TcpState::CloseWait => {
                    trace!("tcp: {} <-> {} reset by guest", ts.so.guest, ts.so.remote);
                    self.stats.tcp.drops += 1;
                    self.tcp_close(ts);
                }
                _ => self.tcp_close(ts),
            }
            return Verdict::Drop;
        }

        if seg.flags.contains(TcpFlags::SYN) {
            self.tcp_drop(ts);
            return Verdict::DropWithReset;
        }

        if !seg.flags.contains(TcpFlags::ACK) {
            return Verdict::Drop;
        }

        let mut needoutput = false;
        if ts.tp.state == TcpState::SynReceived {
            let tp = &mut ts.tp;
            if seq_gt(tp.snd_una, seg.ack) || seq_gt(seg.ack, tp.snd_max) {
                return Verdict::DropWithReset;
            }
            self.stats.tcp.connects += 1;
            tp.state = TcpState::Established;
            tp.snd_wl1 = seg.seq.wrapping_sub(1);
            // Anything queued while the handshake finished is now in order.
            self.tcp_present(ts);
        } else if seq_leq(seg.ack, ts.tp.snd_una) {
            let tp = &mut ts.tp;
            if seg.is_empty() && seg.win == tp.snd_wnd {
                self.stats.tcp.rcvdupack += 1;
                if tp.timers[TCPT_REXMT] == 0 || seg.ack != tp.snd_una {
                    tp.dupacks = 0;
                } else {
                    tp.dupacks += 1;
                    if tp.dupacks == TCPREXMTTHRESH {
                        return self.tcp_fast_retransmit(ts, seg.ack);
                    } else if tp.dupacks > TCPREXMTTHRESH {
                        tp.snd_cwnd += u32::from(tp.maxseg);
                        self.tcp_output(ts);
                        return Verdict::Drop;
                    }
                }
            } else {
                tp.dupacks = 0;
            }
            return self.tcp_step6(ts, seg, needoutput);
        }

        // ---- New data acknowledged ----
        let tp = &mut ts.tp;
        if tp.dupacks > TCPREXMTTHRESH && tp.snd_cwnd > tp.snd_ssthresh {
            tp.snd_cwnd = tp.snd_ssthresh;
        }
        tp.dupacks = 0;
        if seq_gt(seg.ack, tp.snd_max) {
            self.stats.tcp.rcvacktoomuch += 1;
            return Verdict::DropAfterAck;
        }
        let acked = seg.ack.wrapping_sub(tp.snd_una) as usize;
        self.stats.tcp.rcvackpack += 1;
        self.stats.tcp.rcvackbyte += acked as u64;

        if tp.rtt != 0 && seq_gt(seg.ack, tp.rtseq) {
            tp.xmit_timer(tp.rtt);
        }
        if seg.ack == tp.snd_max {
            tp.timers[TCPT_REXMT] = 0;
            needoutput = true;
        } else if tp.timers[TCPT_PERSIST] == 0 {
            tp.timers[TCPT_REXMT] = tp.rxtcur;
        }

        // Slow start below ssthresh, linear growth above.
        let cw = tp.snd_cwnd;
        let mut incr = u32::from(tp.maxseg);
        if cw > tp.snd_ssthresh {
            incr = incr * incr / cw;
        }
        tp.snd_cwnd = (cw + incr).min(TCP_MAXWIN << TCP_MAX_WINSHIFT);

        let ourfinisacked = if acked > ts.so.snd.len() {
            tp.snd_wnd = tp.snd_wnd.saturating_sub(ts.so.snd.len() as u32);
            ts.so.snd.drop_front(ts.so.snd.len());
            true
        } else {
            ts.so.snd.drop_front(acked);
            tp.snd_wnd = tp.snd_wnd.saturating_sub(acked as u32);
            false
        };
        tp.snd_una = seg.ack;
        if seq_lt(tp.snd_nxt, tp.snd_una) {
            tp.snd_nxt = tp.snd_una;
        }

        match tp.state {
            TcpState::FinWait1 if ourfinisacked => {
                // Host already finished too: don't wait forever in FIN_WAIT_2.
                if ts.so.state.contains(SockState::FCANTRCVMORE) {
                    ts.so.isfdisconnected();
                    tp.timers[TCPT_2MSL] = TCP_MAXIDLE;
                }
                tp.state = TcpState::FinWait2;
            }
            TcpState::Closing if ourfinisacked => self.tcp_time_wait(ts),
            TcpState::LastAck if ourfinisacked => {
                self.tcp_close(ts);
                return Verdict::Drop;
            }
            TcpState::TimeWait => {
                tp.timers[TCPT_2MSL] = 2 * TCPTV_MSL;
                return Verdict::DropAfterAck;
            }
            _ => {}
        }

        self.tcp_step6(ts, seg, needoutput)
    }

    /// Third duplicate ACK: retransmit the oldest segment alone, halve
    /// the window and inflate it by the segments that have left.
    fn tcp_fast_retransmit(&mut self, ts: &mut TcpSocket, ack: u32) -> Verdict {
        let tp = &mut ts.tp;
        let mss = u32::from(tp.maxseg);
        let onxt = tp.snd_nxt;
        let win = (tp.snd_wnd.min(tp.snd_cwnd) / 2 / mss).max(2);
        tp.snd_ssthresh = win * mss;
        tp.timers[TCPT_REXMT] = 0;
        tp.rtt = 0;
        tp.snd_nxt = ack;
        tp.snd_cwnd = mss;
        self.stats.tcp.fastrexmit += 1;
        self.tcp_output(ts);

        let tp = &mut ts.tp;
        tp.snd_cwnd = tp.snd_ssthresh + mss * tp.dupacks;
        if seq_gt(onxt, tp.snd_nxt) {
            tp.snd_nxt = onxt;
        }
        Verdict::Drop
    }

    /// Header prediction: an in-order pure ACK or pure data segment on an
    /// established connection with nothing unusual going on.
    fn tcp_predict(&mut self, ts: &mut TcpSocket, seg: &Segment) -> Option<Verdict> {
        let tp = &mut ts.tp;
        let plain = seg.flags & (TcpFlags::SYN | TcpFlags::FIN | TcpFlags::RST | TcpFlags::URG | TcpFlags::ACK)
            == TcpFlags::ACK;
        if tp.state != TcpState::Established
            || !plain
            || seg.seq != tp.rcv_nxt
            || seg.win == 0
            || seg.win != tp.snd_wnd
            || tp.snd_nxt != tp.snd_max
        {
            return None;
        }

        if seg.is_empty() {
            if seq_gt(seg.ack, tp.snd_una) && seq_leq(seg.ack, tp.snd_max) && tp.snd_cwnd >= tp.snd_wnd {
                self.stats.tcp.predack += 1;
                if tp.rtt != 0 && seq_gt(seg.ack, tp.rtseq) {
                    tp.xmit_timer(tp.rtt);
                }
                let acked = seg.ack.wrapping_sub(tp.snd_una) as usize;
                self.stats.tcp.rcvackpack += 1;
                self.stats.tcp.rcvackbyte += acked as u64;
                ts.so.snd.drop_front(acked);
                tp.snd_una = seg.ack;
                if tp.snd_una == tp.snd_max {
                    tp.timers[TCPT_REXMT] = 0;
                } else if tp.timers[TCPT_PERSIST] == 0 {
                    tp.timers[TCPT_REXMT] = tp.rxtcur;
                }
                if !ts.so.snd.is_empty() {
                    self.tcp_output(ts);
                }
                return Some(Verdict::Done);
            }
        } else if seg.ack == tp.snd_una && tp.reass.is_empty() && seg.len() <= ts.so.rcv.space() {
            self.stats.tcp.preddat += 1;
            let accepted = ts.so.sbappend(seg.data.data());
            self.stats.tcp.rcvpack += 1;
            self.stats.tcp.rcvbyte += accepted as u64;
            tp.rcv_nxt = tp.rcv_nxt.wrapping_add(accepted as u32);
            tp.flags |= TcbFlags::DELACK;
            return Some(Verdict::Done);
        }
        None
    }

    /// Our SYN is out; this should be the guest's SYN+ACK.
    fn tcp_syn_sent(&mut self, ts: &mut TcpSocket, seg: Segment) -> Verdict {
        let tp = &mut ts.tp;
        if seg.flags.contains(TcpFlags::ACK) && (seq_leq(seg.ack, tp.iss) || seq_gt(seg.ack, tp.snd_max)) {
            return Verdict::DropWithReset;
        }
        if seg.flags.contains(TcpFlags::RST) {
            if seg.flags.contains(TcpFlags::ACK) {
                trace!("tcp: guest refused {} <- {}", ts.so.guest, ts.so.remote);
                self.tcp_drop(ts);
            }
            return Verdict::Drop;
        }
        if !seg.flags.contains(TcpFlags::SYN) {
            return Verdict::Drop;
        }

        if seg.flags.contains(TcpFlags::ACK) {
            tp.snd_una = seg.ack;
            if seq_lt(tp.snd_nxt, tp.snd_una) {
                tp.snd_nxt = tp.snd_una;
            }
        }
        tp.timers[TCPT_REXMT] = 0;
        tp.irs = seg.seq;
        tp.rcvseqinit();
        tp.flags |= TcbFlags::ACKNOW;
        tp.negotiate_mss(seg.mss, self.cfg.mss);
        if seg.flags.contains(TcpFlags::ACK) && seq_gt(tp.snd_una, tp.iss) {
            self.stats.tcp.connects += 1;
            tp.state = TcpState::Established;
            if tp.rtt != 0 {
                tp.xmit_timer(tp.rtt);
            }
        } else {
            tp.state = TcpState::SynReceived;
        }
        self.tcp_trim_then_step6(ts, seg)
    }

    /// Finish a SYN: step past it, clip data to the window, then go on
    /// as for any other segment.
    pub(crate) fn tcp_trim_then_step6(&mut self, ts: &mut TcpSocket, mut seg: Segment) -> Verdict {
        let tp = &mut ts.tp;
        seg.seq = seg.seq.wrapping_add(1);
        let space = ts.so.rcv.space() as u32;
        tp.rcv_wnd = tp.rcv_wnd.max(space);
        if seg.len() as u32 > tp.rcv_wnd {
            let excess = seg.len() - tp.rcv_wnd as usize;
            seg.data.trim_back(excess);
            seg.flags.remove(TcpFlags::FIN);
            self.stats.tcp.rcvpackafterwin += 1;
        }
        tp.snd_wl1 = seg.seq.wrapping_sub(1);
        tp.rcv_up = seg.seq;
        self.tcp_step6(ts, seg, false)
    }

    /// Window update, urgent pointer, data and FIN.
    fn tcp_step6(&mut self, ts: &mut TcpSocket, mut seg: Segment, mut needoutput: bool) -> Verdict {
        let tp = &mut ts.tp;
        if seg.flags.contains(TcpFlags::ACK)
            && (seq_lt(tp.snd_wl1, seg.seq)
                || (tp.snd_wl1 == seg.seq
                    && (seq_lt(tp.snd_wl2, seg.ack) || (tp.snd_wl2 == seg.ack && seg.win > tp.snd_wnd))))
        {
            tp.snd_wnd = seg.win;
            tp.snd_wl1 = seg.seq;
            tp.snd_wl2 = seg.ack;
            tp.max_sndwnd = tp.max_sndwnd.max(tp.snd_wnd);
            needoutput = true;
        }

        if seg.flags.contains(TcpFlags::URG) && seg.urp != 0 && !tp.state.have_rcvd_fin() {
            if usize::from(seg.urp) + ts.so.rcv.len() > ts.so.rcv.capacity() {
                seg.urp = 0;
                seg.flags.remove(TcpFlags::URG);
            } else if seq_gt(seg.seq.wrapping_add(u32::from(seg.urp)), tp.rcv_up) {
                tp.rcv_up = seg.seq.wrapping_add(u32::from(seg.urp));
                ts.so.urgc = ts.so.rcv.len() + tp.rcv_up.wrapping_sub(tp.rcv_nxt) as usize;
            }
        } else if seq_gt(tp.rcv_nxt, tp.rcv_up) {
            tp.rcv_up = tp.rcv_nxt;
        }

        let has_fin = seg.flags.contains(TcpFlags::FIN);
        let fin = if (!seg.is_empty() || has_fin) && !ts.tp.state.have_rcvd_fin() {
            self.tcp_data(ts, seg)
        } else {
            false
        };

        if fin {
            let tp = &mut ts.tp;
            if !tp.state.have_rcvd_fin() {
                ts.so.fwdrain();
                tp.flags |= TcbFlags::ACKNOW;
                tp.rcv_nxt = tp.rcv_nxt.wrapping_add(1);
            }
            match tp.state {
                TcpState::SynReceived | TcpState::Established => tp.state = TcpState::CloseWait,
                TcpState::FinWait1 => tp.state = TcpState::Closing,
                TcpState::FinWait2 => self.tcp_time_wait(ts),
                TcpState::TimeWait => tp.timers[TCPT_2MSL] = 2 * TCPTV_MSL,
                _ => {}
            }
        }

        if needoutput || ts.tp.flags.contains(TcbFlags::ACKNOW) {
            self.tcp_output(ts);
        }
        Verdict::Done
    }

    /// Accept the segment's data: straight into the socket when it is the
    /// next in order, through the reassembly queue otherwise. Returns
    /// whether a FIN became in order.
    fn tcp_data(&mut self, ts: &mut TcpSocket, seg: Segment) -> bool {
        let fin = seg.flags.contains(TcpFlags::FIN);
        let tp = &mut ts.tp;
        if seg.seq == tp.rcv_nxt && tp.reass.is_empty() && tp.state == TcpState::Established {
            if seg.flags.contains(TcpFlags::PSH) {
                tp.flags |= TcbFlags::ACKNOW;
            } else {
                tp.flags |= TcbFlags::DELACK;
            }
            let accepted = self.tcp_append(ts, seg.data.data());
            self.stats.tcp.rcvpack += 1;
            self.stats.tcp.rcvbyte += accepted as u64;
            return fin && accepted == seg.len();
        }

        if tp.reass.insert(seg.seq, seg.data.data(), fin) {
            self.stats.tcp.rcvoopack += 1;
        } else {
            self.stats.tcp.rcvduppack += 1;
        }
        tp.flags |= TcbFlags::ACKNOW;
        self.tcp_present(ts)
    }

    /// Move in-order data from the reassembly queue to the socket.
    fn tcp_present(&mut self, ts: &mut TcpSocket) -> bool {
        if !ts.tp.state.have_established() {
            return false;
        }
        let mut fin = false;
        while let Some(seg) = ts.tp.reass.pop_ready(ts.tp.rcv_nxt) {
            let accepted = self.tcp_append(ts, &seg.data);
            if accepted < seg.data.len() {
                // Out of buffer: the rest comes again by retransmission.
                break;
            }
            fin = seg.fin;
            if fin {
                break;
            }
        }
        fin
    }

    /// Hand in-order guest bytes to the host side and advance `rcv_nxt`
    /// over what was taken.
    fn tcp_append(&mut self, ts: &mut TcpSocket, data: &[u8]) -> usize {
        let accepted = if ts.so.state.contains(SockState::FCANTSENDMORE) {
            // Host write side is shut; the bytes are acknowledged and lost.
            data.len()
        } else {
            ts.so.sbappend(data)
        };
        ts.tp.rcv_nxt = ts.tp.rcv_nxt.wrapping_add(accepted as u32);
        accepted
    }
}
