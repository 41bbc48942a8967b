//! TCP Control Block: per-connection protocol state.

use bitflags::bitflags;

use super::reass::SegQueue;
use super::seq::{seq_geq, seq_gt, seq_leq, seq_lt};

/// Connection states, ordered as in the BSD state diagram so range checks
/// (`>= SynReceived`, `>= Established`) read naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    CloseWait,
    FinWait1,
    Closing,
    LastAck,
    FinWait2,
    TimeWait,
}

impl TcpState {
    pub fn have_rcvd_syn(self) -> bool {
        self >= TcpState::SynReceived
    }

    pub fn have_established(self) -> bool {
        self >= TcpState::Established
    }

    pub fn have_rcvd_fin(self) -> bool {
        self >= TcpState::TimeWait
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcbFlags: u8 {
        /// Send an ACK immediately.
        const ACKNOW = 0x01;
        /// ACK owed, flushed by the fast timer.
        const DELACK = 0x02;
        /// Don't coalesce small segments.
        const NODELAY = 0x04;
        /// FIN has been sent.
        const SENTFIN = 0x08;
    }
}

// Timer slots.
pub const TCPT_REXMT: usize = 0;
pub const TCPT_PERSIST: usize = 1;
pub const TCPT_KEEP: usize = 2;
pub const TCPT_2MSL: usize = 3;
pub const TCPT_NTIMERS: usize = 4;

/// Slow-timer ticks per second.
pub const PR_SLOWHZ: u32 = 2;

// Timer values, in slow ticks.
pub const TCPTV_MSL: u32 = 5 * PR_SLOWHZ;
pub const TCPTV_SRTTBASE: u32 = 0;
pub const TCPTV_SRTTDFLT: u32 = 3 * PR_SLOWHZ;
pub const TCPTV_PERSMIN: u32 = 5 * PR_SLOWHZ;
pub const TCPTV_PERSMAX: u32 = 60 * PR_SLOWHZ;
pub const TCPTV_KEEP_INIT: u32 = 75 * PR_SLOWHZ;
pub const TCPTV_KEEP_IDLE: u32 = 120 * 60 * PR_SLOWHZ;
pub const TCPTV_KEEPINTVL: u32 = 75 * PR_SLOWHZ;
pub const TCPTV_KEEPCNT: u32 = 8;
pub const TCPTV_MIN: u32 = PR_SLOWHZ;
pub const TCPTV_REXMTMAX: u32 = 12 * PR_SLOWHZ;

/// How long an unanswered keepalive or half-closed FIN_WAIT_2 may last.
pub const TCP_MAXIDLE: u32 = TCPTV_KEEPCNT * TCPTV_KEEPINTVL;

pub const TCP_MAXRXTSHIFT: usize = 12;
pub const TCP_BACKOFF: [u32; TCP_MAXRXTSHIFT + 1] = [1, 2, 4, 8, 16, 32, 64, 64, 64, 64, 64, 64, 64];

/// Duplicate ACKs that trigger fast retransmit.
pub const TCPREXMTTHRESH: u32 = 3;

pub const TCP_MAXWIN: u32 = 65535;
pub const TCP_MAX_WINSHIFT: u32 = 14;

// Fixed-point scaling of the RTT estimators.
pub const TCP_RTT_SCALE: i32 = 8;
pub const TCP_RTT_SHIFT: i32 = 3;
pub const TCP_RTTVAR_SCALE: i32 = 4;
pub const TCP_RTTVAR_SHIFT: i32 = 2;

/// MSS assumed when the peer sends no option (RFC 1122).
pub const TCP_DEFAULT_MSS: u16 = 536;

#[derive(Debug)]
pub struct Tcb {
    pub state: TcpState,
    pub timers: [u32; TCPT_NTIMERS],
    pub rxtshift: usize,
    /// Current retransmit value, in ticks.
    pub rxtcur: u32,
    pub dupacks: u32,
    pub maxseg: u16,
    /// Send even if the window is closed (persist probe, urgent data).
    pub force: bool,
    pub flags: TcbFlags,

    /// Out-of-order segments keyed by starting sequence number.
    pub reass: SegQueue,

    // Send sequence variables.
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_up: u32,
    pub snd_wl1: u32,
    pub snd_wl2: u32,
    pub iss: u32,
    pub snd_wnd: u32,

    // Receive sequence variables.
    pub rcv_wnd: u32,
    pub rcv_nxt: u32,
    pub rcv_up: u32,
    pub irs: u32,

    /// Highest advertised right window edge.
    pub rcv_adv: u32,
    /// Highest sequence number sent.
    pub snd_max: u32,

    // Congestion control.
    pub snd_cwnd: u32,
    pub snd_ssthresh: u32,

    /// Ticks since the last segment was received.
    pub idle: u32,
    /// Ticks the current RTT sample has been running (0 = not timing).
    pub rtt: u32,
    /// Sequence number being timed.
    pub rtseq: u32,
    /// Smoothed RTT, scaled by 8.
    pub srtt: i32,
    /// RTT variance, scaled by 4.
    pub rttvar: i32,
    pub rttmin: u32,
    pub max_sndwnd: u32,
    pub last_ack_sent: u32,
}

impl Tcb {
    pub fn new(mss: u16) -> Self {
        let mut tp = Tcb {
            state: TcpState::Closed,
            timers: [0; TCPT_NTIMERS],
            rxtshift: 0,
            rxtcur: 0,
            dupacks: 0,
            maxseg: mss,
            force: false,
            flags: TcbFlags::empty(),
            reass: SegQueue::default(),
            snd_una: 0,
            snd_nxt: 0,
            snd_up: 0,
            snd_wl1: 0,
            snd_wl2: 0,
            iss: 0,
            snd_wnd: 0,
            rcv_wnd: 0,
            rcv_nxt: 0,
            rcv_up: 0,
            irs: 0,
            rcv_adv: 0,
            snd_max: 0,
            snd_cwnd: 0,
            snd_ssthresh: TCP_MAXWIN << TCP_MAX_WINSHIFT,
            idle: 0,
            rtt: 0,
            rtseq: 0,
            srtt: TCPTV_SRTTBASE as i32,
            rttvar: (TCPTV_SRTTDFLT << 2) as i32,
            rttmin: TCPTV_MIN,
            max_sndwnd: 0,
            last_ack_sent: 0,
        };
        tp.snd_cwnd = tp.initial_window();
        tp.rxtcur = range_set(
            ((tp.srtt >> 2) + tp.rttvar) as u32 >> 1,
            TCPTV_MIN,
            TCPTV_REXMTMAX,
        );
        tp
    }

    /// RFC 3390 initial congestion window.
    pub fn initial_window(&self) -> u32 {
        let mss = u32::from(self.maxseg);
        (4 * mss).min((2 * mss).max(4380))
    }

    /// Current retransmit timeout before backoff, in ticks.
    pub fn rexmtval(&self) -> u32 {
        ((self.srtt >> TCP_RTT_SHIFT) + self.rttvar).max(0) as u32
    }

    pub fn delack_pending(&self) -> bool {
        self.flags.contains(TcbFlags::DELACK)
    }

    pub fn cancel_timers(&mut self) {
        self.timers = [0; TCPT_NTIMERS];
    }

    /// Arm the persist timer with exponential backoff.
    pub fn set_persist(&mut self) {
        let t = ((self.srtt >> 2) + self.rttvar) >> 1;
        debug_assert!(self.timers[TCPT_REXMT] == 0, "persist armed while retransmitting");
        self.timers[TCPT_PERSIST] = range_set(
            t.max(0) as u32 * TCP_BACKOFF[self.rxtshift],
            TCPTV_PERSMIN,
            TCPTV_PERSMAX,
        );
        if self.rxtshift < TCP_MAXRXTSHIFT {
            self.rxtshift += 1;
        }
    }

    pub fn rcvseqinit(&mut self) {
        self.rcv_nxt = self.irs.wrapping_add(1);
        self.rcv_adv = self.rcv_nxt;
    }

    pub fn sendseqinit(&mut self) {
        self.snd_una = self.iss;
        self.snd_nxt = self.iss;
        self.snd_max = self.iss;
        self.snd_up = self.iss;
    }

    /// Apply the peer's MSS option (or the default) to our segment size.
    pub fn negotiate_mss(&mut self, offer: Option<u16>, ours: u16) {
        let mss = offer.unwrap_or(TCP_DEFAULT_MSS).min(ours).max(64);
        self.maxseg = mss;
        self.snd_cwnd = self.initial_window();
    }

    /// Feed an RTT measurement of `rtt` ticks into the estimators
    /// (Jacobson/Karels, BSD fixed point).
    pub fn xmit_timer(&mut self, rtt: u32) {
        let rtt = rtt as i32;
        if self.srtt != 0 {
            let mut delta = rtt - 1 - (self.srtt >> TCP_RTT_SHIFT);
            self.srtt += delta;
            if self.srtt <= 0 {
                self.srtt = 1;
            }
            if delta < 0 {
                delta = -delta;
            }
            delta -= self.rttvar >> TCP_RTTVAR_SHIFT;
            self.rttvar += delta;
            if self.rttvar <= 0 {
                self.rttvar = 1;
            }
        } else {
            self.srtt = rtt << TCP_RTT_SHIFT;
            self.rttvar = rtt << (TCP_RTTVAR_SHIFT - 1);
        }
        self.rtt = 0;
        self.rxtshift = 0;
        self.rxtcur = range_set(self.rexmtval(), self.rttmin, TCPTV_REXMTMAX);
    }

    /// `snd_una <= snd_nxt <= snd_max`, modulo 2^32.
    pub fn send_sequence_ok(&self) -> bool {
        seq_leq(self.snd_una, self.snd_nxt) && seq_leq(self.snd_nxt, self.snd_max)
    }

    /// Whether `ack` acknowledges something we have not sent.
    pub fn ack_beyond_max(&self, ack: u32) -> bool {
        seq_gt(ack, self.snd_max)
    }

    /// Whether a RST at `seq` (with `ack`, if it carries one) belongs to
    /// this connection: in the receive window, acknowledging nothing older
    /// than `snd_una` or newer than `snd_max`.
    pub fn rst_acceptable(&self, seq: u32, ack: Option<u32>) -> bool {
        let in_window = if self.rcv_wnd == 0 {
            seq == self.rcv_nxt
        } else {
            seq_geq(seq, self.rcv_nxt) && seq_lt(seq, self.rcv_nxt.wrapping_add(self.rcv_wnd))
        };
        in_window && ack.map_or(true, |ack| seq_leq(self.snd_una, ack) && !self.ack_beyond_max(ack))
    }
}

pub fn range_set(value: u32, min: u32, max: u32) -> u32 {
    value.clamp(min, max)
}
