//! Host name resolution, kept off the engine thread.
//!
//! Reading the host's nameserver list and looking up names can block, so
//! both run on a dedicated thread. A nameserver refresh is posted back to
//! the engine as a request; a lookup answers its caller directly.

use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::sync::mpsc::{Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::dispatch::Request;
use crate::error::{NetError, Result};
use crate::poller::Waker;

const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Work for the resolver thread.
#[derive(Debug)]
pub enum Job {
    /// Re-read the host nameservers and hand them to the engine.
    Refresh,
    Lookup(String, SyncSender<Result<Vec<Ipv4Addr>>>),
    Shutdown,
}

/// IPv4 `nameserver` entries of a resolv.conf, in file order.
pub fn parse_resolv_conf(content: &str) -> Vec<Ipv4Addr> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| {
            let mut words = line.split_whitespace();
            match (words.next(), words.next()) {
                (Some("nameserver"), Some(addr)) => addr.parse::<Ipv4Addr>().ok(),
                _ => None,
            }
        })
        .collect()
}

/// The host's configured IPv4 nameservers; empty if none can be found.
pub fn host_nameservers() -> Vec<Ipv4Addr> {
    match std::fs::read_to_string(RESOLV_CONF) {
        Ok(content) => parse_resolv_conf(&content),
        Err(e) => {
            debug!("cannot read {RESOLV_CONF}: {e}");
            Vec::new()
        }
    }
}

/// Blocking lookup of `name`'s IPv4 addresses.
pub fn lookup(name: &str) -> Result<Vec<Ipv4Addr>> {
    let addrs = (name, 0)
        .to_socket_addrs()
        .map_err(|e| NetError::Resolver(format!("{name}: {e}")))?;
    let v4: Vec<Ipv4Addr> = addrs
        .filter_map(|a| match a.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .collect();
    if v4.is_empty() {
        return Err(NetError::Resolver(format!("{name}: no IPv4 address")));
    }
    Ok(v4)
}

/// Spawn the resolver thread. It exits on [`Job::Shutdown`] or once every
/// job sender is gone.
pub fn spawn(jobs: Receiver<Job>, engine: Sender<Request>, waker: Arc<Waker>) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("unet-resolver".into())
        .spawn(move || run(jobs, engine, &waker))?;
    Ok(handle)
}

fn run(jobs: Receiver<Job>, engine: Sender<Request>, waker: &Waker) {
    for job in jobs {
        match job {
            Job::Refresh => {
                let servers = host_nameservers();
                if servers.is_empty() {
                    warn!("no IPv4 nameserver in {RESOLV_CONF}, keeping the current list");
                    continue;
                }
                debug!("resolver: host nameservers {servers:?}");
                if engine.send(Request::Dns(servers)).is_err() {
                    break;
                }
                waker.wake();
            }
            Job::Lookup(name, reply) => {
                let _ = reply.send(lookup(&name));
            }
            Job::Shutdown => break,
        }
    }
    debug!("resolver: exiting");
}
