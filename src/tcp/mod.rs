//! TCP engine.
//!
//! A BSD-style state machine: one Control Block per Virtual Socket, input
//! processing with header prediction, output driven by the send buffer and
//! the peer's window, and the fast/slow timer routines. The guest is the
//! TCP peer; the host side of every connection is an ordinary host socket.

pub mod input;
pub mod output;
pub mod reass;
pub mod seq;
pub mod subr;
pub mod tcb;
pub mod timer;

use crate::mbuf::Mbuf;
use crate::wire::TcpFlags;

pub use tcb::{Tcb, TcbFlags, TcpState};

/// ISS increment per second.
pub const TCP_ISSINCR: u32 = 125 * 1024;
/// Slow-timer ticks per second.
pub const TCP_SLOWHZ: u32 = tcb::PR_SLOWHZ;

/// A received segment, payload only in `data`.
#[derive(Debug)]
pub struct Segment {
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub win: u32,
    pub urp: u16,
    /// MSS option, parsed on SYN segments only.
    pub mss: Option<u16>,
    pub data: Mbuf,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// What is left of a guest SYN while the host connect completes.
#[derive(Debug, Clone)]
pub struct SavedSyn {
    pub seq: u32,
    pub win: u32,
    pub mss: Option<u16>,
    /// IP header plus the first 8 bytes of TCP, quoted in ICMP errors.
    pub quote: Vec<u8>,
}

/// How input processing of one segment ends. The caller acts on it once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Fully handled.
    Done,
    /// Discard silently.
    Drop,
    /// Discard, but ACK the peer to resynchronize it.
    DropAfterAck,
    /// Discard and answer with RST.
    DropWithReset,
}
