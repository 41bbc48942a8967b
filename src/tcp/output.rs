//! TCP output: decides whether a segment is due and builds it.

use std::net::SocketAddrV4;

use log::trace;

use super::seq::{seq_gt, seq_lt};
use super::tcb::{TCPT_PERSIST, TCPT_REXMT, TCP_MAXWIN};
use super::{TcbFlags, TcpState};
use crate::engine::{Context, TxClass};
use crate::mbuf::{Mbuf, MAX_HEADROOM};
use crate::socket::TcpSocket;
use crate::wire::tcp::mss_option;
use crate::wire::{pseudo_header_checksum, TcpFlags, TcpHeader, IP_TCP, TCP_HEADER_LEN};

/// Flags every segment carries in a given state.
fn out_flags(state: TcpState) -> TcpFlags {
    match state {
        TcpState::Closed => TcpFlags::RST | TcpFlags::ACK,
        TcpState::Listen => TcpFlags::empty(),
        TcpState::SynSent => TcpFlags::SYN,
        TcpState::SynReceived => TcpFlags::SYN | TcpFlags::ACK,
        TcpState::Established | TcpState::CloseWait | TcpState::FinWait2 | TcpState::TimeWait => TcpFlags::ACK,
        TcpState::FinWait1 | TcpState::Closing | TcpState::LastAck => TcpFlags::FIN | TcpFlags::ACK,
    }
}

impl Context {
    /// Send whatever the connection state, the send buffer and the windows
    /// allow. Loops while full segments remain.
    pub(crate) fn tcp_output(&mut self, ts: &mut TcpSocket) {
        let maxseg = usize::from(ts.tp.maxseg);

        // After an idle period, restart from one segment.
        let idle = ts.tp.snd_max == ts.tp.snd_una;
        if idle && ts.tp.idle >= ts.tp.rxtcur {
            ts.tp.snd_cwnd = maxseg as u32;
        }

        loop {
            let tp = &mut ts.tp;
            let so = &mut ts.so;
            let mut sendalot = false;
            let mut off = tp.snd_nxt.wrapping_sub(tp.snd_una) as usize;
            let mut win = tp.snd_wnd.min(tp.snd_cwnd) as usize;
            let mut flags = out_flags(tp.state);

            // SYN already sent: only SYN_RECEIVED repeats it, and it does not
            // count as a buffer offset.
            if flags.contains(TcpFlags::SYN) && seq_gt(tp.snd_nxt, tp.snd_una) {
                if tp.state != TcpState::SynReceived {
                    flags.remove(TcpFlags::SYN);
                }
                off -= 1;
            }

            // A forced send into a closed window probes with one byte.
            if tp.force {
                if win == 0 {
                    if off < so.snd.len() {
                        flags.remove(TcpFlags::FIN);
                    }
                    win = 1;
                } else {
                    tp.timers[TCPT_PERSIST] = 0;
                    tp.rxtshift = 0;
                }
            }

            let mut len = so.snd.len().min(win) as i64 - off as i64;
            if len < 0 {
                // FIN sent or window shrank: pull back and wait.
                len = 0;
                if win == 0 {
                    tp.timers[TCPT_REXMT] = 0;
                    tp.snd_nxt = tp.snd_una;
                }
            }
            let mut len = len as usize;
            if flags.contains(TcpFlags::RST) {
                len = 0;
            }
            if len > maxseg {
                len = maxseg;
                sendalot = true;
            }
            if seq_lt(
                tp.snd_nxt.wrapping_add(len as u32),
                tp.snd_una.wrapping_add(so.snd.len() as u32),
            ) {
                flags.remove(TcpFlags::FIN);
            }

            let rwin = so.rcv.space() as i64;

            let send = 'decide: {
                // Silly window avoidance on the sending side.
                if len > 0 {
                    if len == maxseg {
                        break 'decide true;
                    }
                    if (idle || tp.flags.contains(TcbFlags::NODELAY)) && len + off >= so.snd.len() {
                        break 'decide true;
                    }
                    if tp.force {
                        break 'decide true;
                    }
                    if tp.max_sndwnd > 0 && len as u32 >= tp.max_sndwnd / 2 {
                        break 'decide true;
                    }
                    if seq_lt(tp.snd_nxt, tp.snd_max) {
                        break 'decide true;
                    }
                }

                // Window update worth two segments or half the buffer.
                if rwin > 0 {
                    let adv = rwin.min(i64::from(TCP_MAXWIN)) - i64::from(tp.rcv_adv.wrapping_sub(tp.rcv_nxt) as i32);
                    if adv >= 2 * maxseg as i64 {
                        break 'decide true;
                    }
                    if 2 * adv >= so.rcv.capacity() as i64 {
                        break 'decide true;
                    }
                }

                if tp.flags.contains(TcbFlags::ACKNOW) {
                    break 'decide true;
                }
                if flags.intersects(TcpFlags::SYN | TcpFlags::RST) {
                    break 'decide true;
                }
                if seq_gt(tp.snd_up, tp.snd_una) {
                    break 'decide true;
                }
                if flags.contains(TcpFlags::FIN)
                    && (!tp.flags.contains(TcbFlags::SENTFIN) || tp.snd_nxt == tp.snd_una)
                {
                    break 'decide true;
                }

                // Data waiting but nothing may go out: make sure a timer
                // will probe the window.
                if !so.snd.is_empty() && tp.timers[TCPT_REXMT] == 0 && tp.timers[TCPT_PERSIST] == 0 {
                    tp.rxtshift = 0;
                    tp.set_persist();
                }
                false
            };
            if !send {
                return;
            }

            let mut opts: &[u8] = &[];
            let mss_opt;
            if flags.contains(TcpFlags::SYN) {
                tp.snd_nxt = tp.iss;
                mss_opt = mss_option(self.cfg.mss);
                opts = &mss_opt;
            }
            let hdrlen = TCP_HEADER_LEN + opts.len();
            if len > maxseg.saturating_sub(opts.len()) {
                len = maxseg - opts.len();
                sendalot = true;
            }

            let stats = &mut self.stats.tcp;
            if len > 0 {
                if seq_lt(tp.snd_nxt, tp.snd_max) {
                    stats.sndrexmitpack += 1;
                } else {
                    stats.sndpack += 1;
                }
                stats.sndbyte += len as u64;
            } else if tp.flags.contains(TcbFlags::ACKNOW) {
                stats.sndacks += 1;
            }
            stats.sndtotal += 1;

            let mut m = Mbuf::with_headroom(MAX_HEADROOM, hdrlen + len);
            if len > 0 {
                let mut payload = vec![0u8; len];
                so.snd.peek(off, &mut payload);
                m.append(&payload);
                // Last bytes of the buffer go out with PSH.
                if off + len == so.snd.len() {
                    flags |= TcpFlags::PSH;
                }
            }

            // Retransmitting FIN: back up over it.
            if flags.contains(TcpFlags::FIN) && tp.flags.contains(TcbFlags::SENTFIN) && tp.snd_nxt == tp.snd_max {
                tp.snd_nxt = tp.snd_nxt.wrapping_sub(1);
            }

            let seq = if len > 0 || flags.intersects(TcpFlags::SYN | TcpFlags::FIN) || tp.timers[TCPT_PERSIST] != 0 {
                tp.snd_nxt
            } else {
                tp.snd_max
            };

            // Receive window to advertise, never shrinking what was offered.
            let mut rwin = rwin.max(0) as u32;
            if (rwin as usize) < so.rcv.capacity() / 4 && rwin < maxseg as u32 {
                rwin = 0;
            }
            rwin = rwin.min(TCP_MAXWIN);
            let offered = tp.rcv_adv.wrapping_sub(tp.rcv_nxt) as i32;
            if offered > 0 && (rwin as i32) < offered {
                rwin = offered as u32;
            }

            let mut urp = 0u16;
            if seq_gt(tp.snd_up, tp.snd_una) {
                urp = tp.snd_up.wrapping_sub(seq).min(u32::from(u16::MAX)) as u16;
                flags |= TcpFlags::URG;
            } else {
                // Keep snd_up from falling behind snd_una.
                tp.snd_up = tp.snd_una;
            }

            let th = TcpHeader {
                sport: so.remote.port(),
                dport: so.guest.port(),
                seq,
                ack: tp.rcv_nxt,
                hlen: hdrlen,
                flags,
                win: rwin as u16,
                checksum: 0,
                urp,
            };
            {
                let hdr = m.prepend(hdrlen);
                th.write(hdr);
                hdr[TCP_HEADER_LEN..].copy_from_slice(opts);
            }
            let cksum = pseudo_header_checksum(*so.remote.ip(), *so.guest.ip(), IP_TCP, m.data());
            m.data_mut()[16..18].copy_from_slice(&cksum.to_be_bytes());

            // Advance snd_nxt and snd_max, start timing, arm the retransmit
            // timer. A persist probe does not move the send sequence.
            if !tp.force || tp.timers[TCPT_PERSIST] == 0 {
                let startseq = tp.snd_nxt;
                if flags.contains(TcpFlags::SYN) {
                    tp.snd_nxt = tp.snd_nxt.wrapping_add(1);
                }
                if flags.contains(TcpFlags::FIN) {
                    tp.snd_nxt = tp.snd_nxt.wrapping_add(1);
                    tp.flags |= TcbFlags::SENTFIN;
                }
                tp.snd_nxt = tp.snd_nxt.wrapping_add(len as u32);
                if seq_gt(tp.snd_nxt, tp.snd_max) {
                    tp.snd_max = tp.snd_nxt;
                    if tp.rtt == 0 {
                        tp.rtt = 1;
                        tp.rtseq = startseq;
                    }
                }
                if tp.timers[TCPT_REXMT] == 0 && tp.snd_nxt != tp.snd_una {
                    tp.timers[TCPT_REXMT] = tp.rxtcur;
                    if tp.timers[TCPT_PERSIST] != 0 {
                        tp.timers[TCPT_PERSIST] = 0;
                        tp.rxtshift = 0;
                    }
                }
            } else if seq_gt(tp.snd_nxt.wrapping_add(len as u32), tp.snd_max) {
                tp.snd_max = tp.snd_nxt.wrapping_add(len as u32);
            }
            debug_assert!(tp.send_sequence_ok(), "send sequence out of order");

            if rwin > 0 && seq_gt(tp.rcv_nxt.wrapping_add(rwin), tp.rcv_adv) {
                tp.rcv_adv = tp.rcv_nxt.wrapping_add(rwin);
            }
            tp.last_ack_sent = tp.rcv_nxt;
            tp.flags.remove(TcbFlags::ACKNOW | TcbFlags::DELACK);

            let class = if flags.contains(TcpFlags::URG) {
                TxClass::Urgent
            } else {
                TxClass::Normal
            };
            trace!(
                "tcp: {} <- {} {:?} seq {} ack {} len {}",
                so.guest,
                so.remote,
                flags,
                seq,
                tp.rcv_nxt,
                len
            );
            let (src, dst) = (*so.remote.ip(), *so.guest.ip());
            self.ip_output(m, src, dst, IP_TCP, class);

            if !sendalot {
                return;
            }
        }
    }

    /// Send a bare control segment that belongs to no connection state
    /// (RST answers, keepalive probes).
    pub(crate) fn tcp_respond(
        &mut self,
        guest: SocketAddrV4,
        remote: SocketAddrV4,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        win: u16,
    ) {
        let th = TcpHeader {
            sport: remote.port(),
            dport: guest.port(),
            seq,
            ack,
            hlen: TCP_HEADER_LEN,
            flags,
            win,
            checksum: 0,
            urp: 0,
        };
        let mut m = Mbuf::with_headroom(MAX_HEADROOM, TCP_HEADER_LEN);
        th.write(m.prepend(TCP_HEADER_LEN));
        let cksum = pseudo_header_checksum(*remote.ip(), *guest.ip(), IP_TCP, m.data());
        m.data_mut()[16..18].copy_from_slice(&cksum.to_be_bytes());
        if flags.contains(TcpFlags::RST) {
            self.stats.tcp.rstsent += 1;
        }
        self.ip_output(m, *remote.ip(), *guest.ip(), IP_TCP, TxClass::Normal);
    }
}
