//! The protocol engine.
//!
//! [`Engine`] owns every piece of mutable protocol state: counters, timers,
//! the IP id and ISS generators, the reassembly queue, the echo tracker, the
//! ARP table and the two socket lists. It is driven from exactly one thread
//! (see [`crate::poller`]); other threads reach it only through
//! [`crate::dispatch`].
//!
//! The state is split in two so protocol code can hold a socket borrowed
//! out of a list while still emitting packets: [`Context`] is everything
//! except the lists, and per-socket protocol routines are `Context` methods
//! taking the socket as an argument.

use std::net::Ipv4Addr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::arp::ArpTable;
use crate::config::NetConfig;
use crate::delivery::{Credit, Frame, Outbox};
use crate::error::Result;
use crate::forward::ForwardRule;
use crate::icmp::EchoProxy;
use crate::ip::reass::ReassQueue;
use crate::mbuf::Mbuf;
use crate::resolver;
use crate::socket::{SockHandle, SockState, Socket, SocketList, TcpSocket};
use crate::stats::Stats;
use crate::tcp::timer::timers_armed;
use crate::tcp::{TCP_ISSINCR, TCP_SLOWHZ};
use crate::wire::{EtherHeader, ETH_ARP, ETH_HLEN, ETH_IPV4, ETH_IPV6};

/// Delayed-ACK flush period.
pub const FAST_TIMER: Duration = Duration::from_millis(200);
/// Retransmit, keepalive, 2MSL and reassembly bookkeeping period.
pub const SLOW_TIMER: Duration = Duration::from_millis(500);

/// How an outbound frame is delivered to the guest.
#[derive(Debug, Clone, Default)]
pub enum TxClass {
    #[default]
    Normal,
    /// Carries TCP urgent data; goes through the urgent delivery thread.
    Urgent,
    /// Counted against a socket's outstanding-frame budget until delivered.
    Counted(Arc<AtomicUsize>),
}

/// Engine state other than the socket lists.
pub struct Context {
    pub cfg: NetConfig,
    pub stats: Stats,
    outbox: Outbox,
    ip_id: u16,
    /// Initial send sequence generator.
    pub iss: u32,
    pub arp: ArpTable,
    pub ipq: ReassQueue,
    pub echo: EchoProxy,
    pub link_up: bool,
    ipv6_warned: bool,
    /// Time of the event being processed.
    pub now: Instant,
}

impl Context {
    pub fn next_ip_id(&mut self) -> u16 {
        self.ip_id = self.ip_id.wrapping_add(1);
        self.ip_id
    }

    /// Next initial send sequence number.
    pub fn next_iss(&mut self) -> u32 {
        let iss = self.iss;
        self.iss = self.iss.wrapping_add(TCP_ISSINCR / 2);
        iss
    }

    /// Wrap an IPv4 datagram in Ethernet and hand it to delivery.
    pub fn if_output(&mut self, mut m: Mbuf, dst: Ipv4Addr, class: TxClass) {
        if !self.link_up {
            self.stats.frames_dropped += 1;
            trace!("link down, discarding {} byte datagram", m.len());
            return;
        }
        let eth = EtherHeader {
            dst: self.arp.lookup(dst).unwrap_or(self.cfg.guest_mac),
            src: self.cfg.gateway_mac,
            ethertype: ETH_IPV4,
        };
        eth.write(m.prepend(ETH_HLEN));
        self.emit(m.into_vec(), class);
    }

    /// Hand a complete Ethernet frame to delivery.
    pub fn emit(&mut self, data: Vec<u8>, class: TxClass) {
        if !self.link_up {
            self.stats.frames_dropped += 1;
            return;
        }
        let (credit, urgent) = match class {
            TxClass::Normal => (None, false),
            TxClass::Urgent => (None, true),
            TxClass::Counted(counter) => (Some(Credit::new(counter)), false),
        };
        if self.outbox.send(Frame { data, credit }, urgent) {
            self.stats.frames_out += 1;
        } else {
            self.stats.frames_dropped += 1;
        }
    }
}

pub struct Engine {
    pub cx: Context,
    /// TCP Virtual Sockets.
    pub tcb: SocketList<TcpSocket>,
    /// UDP Virtual Sockets.
    pub udb: SocketList<Socket>,
    pub(crate) tcp_last: Option<SockHandle>,
    pub(crate) udp_last: Option<SockHandle>,
    pub(crate) forwards: Vec<(ForwardRule, SockHandle)>,
    last_fast: Instant,
    last_slow: Instant,
}

impl Engine {
    pub fn new(mut cfg: NetConfig, outbox: Outbox) -> Result<Self> {
        cfg.validate()?;
        if cfg.dns_servers.is_empty() {
            cfg.dns_servers = resolver::host_nameservers();
        }
        info!(
            "engine up: guest {} gateway {} dns {} -> {}",
            cfg.guest,
            cfg.gateway,
            cfg.dns,
            cfg.host_nameserver()
        );
        let forwards = std::mem::take(&mut cfg.forwards);
        let now = Instant::now();
        let echo = EchoProxy::new(cfg.echo_cache_size, cfg.icmp_timeout);
        let mut engine = Engine {
            cx: Context {
                ipq: ReassQueue::new(cfg.max_frag_packets, cfg.max_frags_per_packet, cfg.frag_ttl),
                cfg,
                stats: Stats::default(),
                outbox,
                ip_id: 0,
                iss: initial_iss(),
                arp: ArpTable::default(),
                echo,
                link_up: true,
                ipv6_warned: false,
                now,
            },
            tcb: SocketList::new(),
            udb: SocketList::new(),
            tcp_last: None,
            udp_last: None,
            forwards: Vec::new(),
            last_fast: now,
            last_slow: now,
        };
        for rule in forwards {
            engine.add_forward(rule)?;
        }
        Ok(engine)
    }

    /// Process one Ethernet frame from the guest.
    pub fn input(&mut self, mut m: Mbuf) {
        self.cx.stats.frames_in += 1;
        if !self.cx.link_up {
            self.cx.stats.frames_dropped += 1;
            return;
        }
        let Some(eth) = EtherHeader::parse(m.data()) else {
            self.cx.stats.frames_dropped += 1;
            return;
        };
        match eth.ethertype {
            ETH_ARP => self.cx.arp_input(&m.data()[ETH_HLEN..]),
            ETH_IPV4 => {
                m.trim_front(ETH_HLEN);
                self.ip_input(m);
            }
            ETH_IPV6 => {
                if !self.cx.ipv6_warned {
                    self.cx.ipv6_warned = true;
                    warn!("guest sent an IPv6 frame; IPv6 is not supported, dropping");
                }
                self.cx.stats.frames_dropped += 1;
            }
            other => {
                trace!("dropping frame with ethertype {other:#06x}");
                self.cx.stats.frames_dropped += 1;
            }
        }
    }

    pub fn stats(&self) -> Stats {
        self.cx.stats.clone()
    }

    pub fn set_link(&mut self, up: bool) {
        if self.cx.link_up != up {
            info!("link {}", if up { "up" } else { "down" });
        }
        self.cx.link_up = up;
    }

    pub fn set_dns_servers(&mut self, servers: Vec<Ipv4Addr>) {
        debug!("host nameservers now {servers:?}");
        self.cx.cfg.dns_servers = servers;
    }

    // ======== Timers ========

    /// Delayed-ACK flush.
    pub fn fast_timer(&mut self) {
        for h in self.tcb.handles() {
            if let Some(ts) = self.tcb.get_mut(h) {
                self.cx.tcp_fasttimo(ts);
            }
        }
        self.tcb.sweep();
    }

    /// TCP timers, ISS advance, fragment and echo aging.
    pub fn slow_timer(&mut self) {
        for h in self.tcb.handles() {
            if let Some(ts) = self.tcb.get_mut(h) {
                self.cx.tcp_slowtimo(ts);
            }
        }
        self.tcb.sweep();
        self.cx.iss = self.cx.iss.wrapping_add(TCP_ISSINCR / TCP_SLOWHZ);

        let expired = self.cx.ipq.slow_tick();
        self.cx.stats.ip.frag_timeout += expired as u64;
        let now = self.cx.now;
        let aged = self.cx.echo.expire(now);
        self.cx.stats.icmp.echo_expired += aged as u64;
        self.udp_expire(now);
    }

    /// Run whichever periodic timers are due at `now`.
    pub fn run_timers(&mut self, now: Instant) {
        self.cx.now = now;
        if now.duration_since(self.last_fast) >= FAST_TIMER {
            self.last_fast = now;
            self.fast_timer();
        }
        if now.duration_since(self.last_slow) >= SLOW_TIMER {
            self.last_slow = now;
            self.slow_timer();
        }
    }

    /// How long the poller may block: the poll ceiling, shortened to the
    /// next fast tick while ACKs are pending and to the next slow tick while
    /// connections or fragments need bookkeeping.
    pub fn poll_timeout(&self, now: Instant) -> Duration {
        let mut timeout = self.cx.cfg.poll_ceiling;
        if self.tcb.iter().any(|(_, ts)| ts.tp.delack_pending()) {
            let due = (self.last_fast + FAST_TIMER).saturating_duration_since(now);
            timeout = timeout.min(due);
        }
        let armed = self.tcb.iter().any(|(_, ts)| timers_armed(ts));
        if armed || !self.cx.ipq.is_empty() || !self.cx.echo.is_empty() || !self.udb.is_empty() {
            let due = (self.last_slow + SLOW_TIMER).saturating_duration_since(now);
            timeout = timeout.min(due);
        }
        timeout
    }

    /// Close every socket through its normal path.
    pub fn shutdown(&mut self) {
        for h in self.tcb.handles() {
            if let Some(ts) = self.tcb.get_mut(h) {
                if ts.so.state.contains(SockState::ACCEPTING) {
                    ts.so.mark_for_free();
                } else {
                    self.cx.tcp_drop(ts);
                }
            }
        }
        for h in self.udb.handles() {
            if let Some(so) = self.udb.get_mut(h) {
                so.mark_for_free();
            }
        }
        self.forwards.clear();
        self.tcp_last = None;
        self.udp_last = None;
        let tcp = self.tcb.drain().len();
        let udp = self.udb.drain().len();
        debug!("engine shut down ({tcp} tcp, {udp} udp sockets released)");
    }
}

/// Seed the ISS generator from the clock.
fn initial_iss() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() ^ (d.as_secs() as u32))
        .unwrap_or(0x10000)
}
