//! unet: a user-space TCP/IP stack that gives a virtual machine guest NAT
//! networking over ordinary host sockets.
//!
//! The guest sees a small virtual subnet (10.0.2.0/24 by default) with a
//! gateway and a DNS alias. Its TCP connections and UDP flows are
//! terminated here and re-originated from the host; ICMP echo is answered
//! locally or proxied. Frames enter through [`NetHandle::send_frame`] and
//! leave through a [`NetDevice`].

pub mod arp;
pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod forward;
pub mod icmp;
pub mod ip;
pub mod mbuf;
pub mod poller;
pub mod resolver;
pub mod sbuf;
pub mod socket;
pub mod stack;
pub mod stats;
pub mod tcp;
pub mod udp;
pub mod wire;

#[cfg(test)]
mod testutil;

pub use config::NetConfig;
pub use delivery::{Backpressure, NetDevice};
pub use dispatch::NetHandle;
pub use error::{NetError, Result};
pub use forward::ForwardRule;
pub use socket::SockProto;
pub use stack::NetStack;
pub use stats::Stats;
