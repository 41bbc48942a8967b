//! Engine configuration.
//!
//! Virtual network layout (SLIRP standard):
//!   Guest:   10.0.2.15
//!   Gateway: 10.0.2.2   (alias for the host's loopback)
//!   DNS:     10.0.2.3   (alias for the host's first nameserver)
//!   Netmask: 255.255.255.0
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::{NetError, Result};
use crate::forward::ForwardRule;

pub const NETWORK: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 0);
pub const NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
pub const GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 2);
pub const DNS_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 3);
pub const GUEST_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 15);

pub const GUEST_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
pub const GATEWAY_MAC: [u8; 6] = [0x52, 0x55, 0x0a, 0x00, 0x02, 0x02];

/// Fallback nameserver when the host has none configured.
pub const FALLBACK_DNS: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

#[derive(Debug, Clone)]
pub struct NetConfig {
    pub network: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Ipv4Addr,
    pub guest: Ipv4Addr,
    pub guest_mac: [u8; 6],
    pub gateway_mac: [u8; 6],

    /// Link MTU towards the guest.
    pub mtu: usize,
    /// Maximum TCP segment size we advertise and send.
    pub mss: u16,
    /// TTL of datagrams the engine originates.
    pub ttl: u8,

    /// Host address outbound sockets bind to (any address when `None`).
    pub bind_addr: Option<Ipv4Addr>,
    /// Host nameservers. Empty means "discover from the host resolver".
    pub dns_servers: Vec<Ipv4Addr>,

    /// Capacity of each Virtual Socket ring buffer.
    pub so_buf_size: usize,

    /// Idle expiry of ordinary UDP pseudo-connections.
    pub udp_timeout: Duration,
    /// Idle expiry of UDP pseudo-connections to port 53.
    pub dns_timeout: Duration,
    /// How long a proxied echo request waits for its reply.
    pub icmp_timeout: Duration,

    /// Maximum number of datagrams under reassembly.
    pub max_frag_packets: usize,
    /// Maximum number of fragments held for one datagram.
    pub max_frags_per_packet: usize,
    /// Reassembly lifetime in slow-timer ticks.
    pub frag_ttl: u8,

    /// Maximum number of in-flight proxied pings.
    pub echo_cache_size: usize,

    /// Send keepalive probes on idle connections.
    pub keepalive: bool,
    /// Upper bound on a single poll wait.
    pub poll_ceiling: Duration,
    /// Bounded wait of producers blocking on a request completion.
    pub request_timeout: Duration,

    /// Port-forward rules installed when the engine starts.
    pub forwards: Vec<ForwardRule>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            network: NETWORK,
            netmask: NETMASK,
            gateway: GATEWAY_IP,
            dns: DNS_IP,
            guest: GUEST_IP,
            guest_mac: GUEST_MAC,
            gateway_mac: GATEWAY_MAC,
            mtu: 1500,
            mss: 1460, // MTU(1500) - IP(20) - TCP(20)
            ttl: 64,
            bind_addr: None,
            dns_servers: Vec::new(),
            so_buf_size: 64 * 1024,
            udp_timeout: Duration::from_secs(240),
            dns_timeout: Duration::from_secs(10),
            icmp_timeout: Duration::from_secs(10),
            max_frag_packets: 64,
            max_frags_per_packet: 16,
            frag_ttl: 60,
            echo_cache_size: 64,
            keepalive: true,
            poll_ceiling: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            forwards: Vec::new(),
        }
    }
}

impl NetConfig {
    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<()> {
        let mask = u32::from(self.netmask);
        if mask.leading_ones() + mask.trailing_zeros() != 32 {
            return Err(NetError::Config(format!("netmask {} is not contiguous", self.netmask)));
        }
        if u32::from(self.network) & !mask != 0 {
            return Err(NetError::Config(format!(
                "network {} has host bits set for netmask {}",
                self.network, self.netmask
            )));
        }
        for (name, addr) in [("gateway", self.gateway), ("dns", self.dns), ("guest", self.guest)] {
            if !self.in_subnet(addr) {
                return Err(NetError::Config(format!(
                    "{name} address {addr} is outside {}/{}",
                    self.network, self.netmask
                )));
            }
        }
        if self.guest == self.gateway || self.guest == self.dns {
            return Err(NetError::Config("guest address collides with an alias".into()));
        }
        if self.mtu < 576 || self.mtu > 65535 {
            return Err(NetError::Config(format!("mtu {} out of range", self.mtu)));
        }
        if usize::from(self.mss) + 40 > self.mtu || self.mss < 64 {
            return Err(NetError::Config(format!("mss {} does not fit mtu {}", self.mss, self.mtu)));
        }
        if self.so_buf_size < 2 * usize::from(self.mss) {
            return Err(NetError::Config("socket buffers must hold two segments".into()));
        }
        if self.max_frag_packets == 0 || self.max_frags_per_packet == 0 {
            return Err(NetError::Config("fragment limits must be non-zero".into()));
        }
        if self.echo_cache_size == 0 {
            return Err(NetError::Config("echo cache must hold at least one entry".into()));
        }
        Ok(())
    }

    /// Whether `addr` lies inside the virtual subnet.
    pub fn in_subnet(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & u32::from(self.netmask) == u32::from(self.network)
    }

    /// Directed broadcast address of the virtual subnet.
    pub fn subnet_broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !u32::from(self.netmask))
    }

    /// Whether `addr` is one of the engine's own synthetic addresses.
    pub fn is_alias(&self, addr: Ipv4Addr) -> bool {
        addr == self.gateway || addr == self.dns
    }

    /// The nameserver the DNS alias maps to.
    pub fn host_nameserver(&self) -> Ipv4Addr {
        self.dns_servers.first().copied().unwrap_or(FALLBACK_DNS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        NetConfig::default().validate().unwrap();
    }

    #[test]
    fn test_subnet_helpers() {
        let cfg = NetConfig::default();
        assert!(cfg.in_subnet(Ipv4Addr::new(10, 0, 2, 99)));
        assert!(!cfg.in_subnet(Ipv4Addr::new(10, 0, 3, 1)));
        assert_eq!(cfg.subnet_broadcast(), Ipv4Addr::new(10, 0, 2, 255));
        assert!(cfg.is_alias(GATEWAY_IP));
        assert!(!cfg.is_alias(GUEST_IP));
        assert_eq!(cfg.host_nameserver(), FALLBACK_DNS);
    }

    #[test]
    fn test_rejects_bad_layout() {
        let mut cfg = NetConfig::default();
        cfg.guest = Ipv4Addr::new(192, 168, 1, 2);
        assert!(cfg.validate().is_err());

        let mut cfg = NetConfig::default();
        cfg.netmask = Ipv4Addr::new(255, 0, 255, 0);
        assert!(cfg.validate().is_err());

        let mut cfg = NetConfig::default();
        cfg.mss = 1480;
        assert!(cfg.validate().is_err());
    }
}
