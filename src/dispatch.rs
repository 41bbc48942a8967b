//! Cross-thread access to the engine.
//!
//! Other threads never touch engine state. They post [`Request`]s on a
//! single-consumer queue drained by the engine thread and kick the poller
//! through the wake-up pipe. Guest frames are fire-and-forget; control
//! requests that must be observed before the caller continues carry a
//! completion channel and are waited on for a bounded time.

use std::net::Ipv4Addr;
use std::sync::mpsc::{self, RecvTimeoutError, Sender, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use log::trace;

use crate::engine::Engine;
use crate::error::{NetError, Result};
use crate::forward::ForwardRule;
use crate::mbuf::Mbuf;
use crate::poller::Waker;
use crate::resolver::Job;
use crate::stats::Stats;

/// A unit of work for the engine thread.
pub enum Request {
    /// Ethernet frame from the guest.
    Input(Mbuf),
    AddForward(ForwardRule, SyncSender<Result<()>>),
    RemoveForward(ForwardRule, SyncSender<Result<()>>),
    Link(bool),
    /// Fresh host nameserver list from the resolver thread.
    Dns(Vec<Ipv4Addr>),
    Stats(SyncSender<Stats>),
    /// Run arbitrary code against the engine.
    Call(Box<dyn FnOnce(&mut Engine) + Send>),
    Shutdown,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::Input(m) => write!(f, "Input({} bytes)", m.len()),
            Request::AddForward(rule, _) => write!(f, "AddForward({rule})"),
            Request::RemoveForward(rule, _) => write!(f, "RemoveForward({rule})"),
            Request::Link(up) => write!(f, "Link({up})"),
            Request::Dns(servers) => write!(f, "Dns({servers:?})"),
            Request::Stats(_) => f.write_str("Stats"),
            Request::Call(_) => f.write_str("Call"),
            Request::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl Engine {
    /// Carry out one request on the engine thread.
    pub fn handle(&mut self, req: Request) {
        trace!("request {req:?}");
        match req {
            Request::Input(m) => self.input(m),
            Request::AddForward(rule, done) => {
                let _ = done.send(self.add_forward(rule));
            }
            Request::RemoveForward(rule, done) => {
                let _ = done.send(self.remove_forward(&rule));
            }
            Request::Link(up) => self.set_link(up),
            Request::Dns(servers) => self.set_dns_servers(servers),
            Request::Stats(done) => {
                let _ = done.send(self.stats());
            }
            Request::Call(f) => f(self),
            Request::Shutdown => self.shutdown(),
        }
    }
}

/// Producer side of the request queue. Cheap to clone; every clone feeds
/// the same engine.
#[derive(Clone)]
pub struct NetHandle {
    requests: Sender<Request>,
    resolver: Sender<Job>,
    waker: Arc<Waker>,
    timeout: Duration,
}

impl NetHandle {
    pub(crate) fn new(requests: Sender<Request>, resolver: Sender<Job>, waker: Arc<Waker>, timeout: Duration) -> Self {
        NetHandle {
            requests,
            resolver,
            waker,
            timeout,
        }
    }

    fn post(&self, req: Request) -> Result<()> {
        self.requests.send(req).map_err(|_| NetError::Shutdown)?;
        self.waker.wake();
        Ok(())
    }

    /// Post a request carrying a completion channel and wait for the
    /// engine's answer.
    fn request<T>(&self, make: impl FnOnce(SyncSender<T>) -> Request) -> Result<T> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.post(make(tx))?;
        rx.recv_timeout(self.timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => NetError::Timeout(self.timeout),
            RecvTimeoutError::Disconnected => NetError::Shutdown,
        })
    }

    /// Hand a guest frame to the engine. Returns at once; the frame is
    /// the engine's from here on.
    pub fn send_frame(&self, frame: &[u8]) -> Result<()> {
        self.post(Request::Input(Mbuf::from_slice(0, frame)))
    }

    pub fn add_forward(&self, rule: ForwardRule) -> Result<()> {
        self.request(|done| Request::AddForward(rule, done))?
    }

    pub fn remove_forward(&self, rule: ForwardRule) -> Result<()> {
        self.request(|done| Request::RemoveForward(rule, done))?
    }

    pub fn set_link(&self, up: bool) -> Result<()> {
        self.post(Request::Link(up))
    }

    /// Re-read the host nameservers on the resolver thread; the engine
    /// picks up the result when it arrives.
    pub fn refresh_dns(&self) -> Result<()> {
        self.resolver.send(Job::Refresh).map_err(|_| NetError::Shutdown)
    }

    /// Resolve a host name through the host resolver, off the engine
    /// thread.
    pub fn resolve(&self, name: &str) -> Result<Vec<Ipv4Addr>> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.resolver
            .send(Job::Lookup(name.to_string(), tx))
            .map_err(|_| NetError::Shutdown)?;
        rx.recv_timeout(self.timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => NetError::Timeout(self.timeout),
            RecvTimeoutError::Disconnected => NetError::Shutdown,
        })?
    }

    pub fn stats(&self) -> Result<Stats> {
        self.request(Request::Stats)
    }

    /// Run `f` on the engine thread and wait for its result.
    pub fn with_engine<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Engine) -> T + Send + 'static,
    {
        self.request(|done| {
            Request::Call(Box::new(move |engine| {
                let _ = done.send(f(engine));
            }))
        })
    }

    /// Ask the engine and resolver threads to stop.
    pub fn shutdown(&self) -> Result<()> {
        let _ = self.resolver.send(Job::Shutdown);
        self.post(Request::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, Harness};

    fn handle(timeout: Duration) -> (NetHandle, mpsc::Receiver<Request>, mpsc::Receiver<Job>) {
        let (tx, rx) = mpsc::channel();
        let (jtx, jrx) = mpsc::channel();
        let waker = Arc::new(Waker::new().unwrap());
        (NetHandle::new(tx, jtx, waker, timeout), rx, jrx)
    }

    #[test]
    fn test_requests_keep_producer_order() {
        let (h, rx, _jobs) = handle(Duration::from_secs(1));
        h.send_frame(&[1]).unwrap();
        h.set_link(false).unwrap();
        h.send_frame(&[2, 2]).unwrap();
        let got: Vec<String> = rx.try_iter().map(|r| format!("{r:?}")).collect();
        assert_eq!(got, vec!["Input(1 bytes)", "Link(false)", "Input(2 bytes)"]);
    }

    #[test]
    fn test_blocking_request_times_out() {
        let (h, _rx, _jobs) = handle(Duration::from_millis(20));
        assert!(matches!(h.stats(), Err(NetError::Timeout(_))));
    }

    #[test]
    fn test_closed_queue_reports_shutdown() {
        let (h, rx, jobs) = handle(Duration::from_secs(1));
        drop(rx);
        drop(jobs);
        assert!(matches!(h.send_frame(&[0]), Err(NetError::Shutdown)));
        assert!(matches!(h.refresh_dns(), Err(NetError::Shutdown)));
    }

    #[test]
    fn test_engine_answers_requests() {
        let mut hn = Harness::new();
        let (tx, done) = mpsc::sync_channel(1);
        hn.engine.handle(Request::Stats(tx));
        assert_eq!(done.recv().unwrap().frames_in, 0);

        let cfg = hn.engine.cx.cfg.clone();
        let ping = testutil::icmp_echo(&cfg, cfg.gateway, 1, 1, b"x");
        hn.engine.handle(Request::Input(Mbuf::from_slice(0, &ping)));
        assert_eq!(hn.frames().len(), 1);

        hn.engine.handle(Request::Dns(vec![Ipv4Addr::new(192, 0, 2, 53)]));
        assert_eq!(hn.engine.cx.cfg.host_nameserver(), Ipv4Addr::new(192, 0, 2, 53));

        let (tx, done) = mpsc::sync_channel(1);
        hn.engine.handle(Request::RemoveForward(ForwardRule::tcp(1, 1), tx));
        assert!(matches!(done.recv().unwrap(), Err(NetError::Forward(_))));
    }
}
