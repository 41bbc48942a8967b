//! The engine thread's event loop.
//!
//! Each pass builds a `poll(2)` set from the wake-up pipe, the Virtual
//! Sockets and the ICMP proxy socket, blocks for at most the engine's
//! timer horizon, then runs the due timers, dispatches readiness and drains
//! the request queue. Nothing else ever touches the engine.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::dispatch::Request;
use crate::engine::Engine;
use crate::socket::{ReadOutcome, SockHandle, SockState};
use crate::tcp::subr::ConnectFailure;
use crate::udp;

const POLLIN: i16 = libc::POLLIN;
const POLLPRI: i16 = libc::POLLPRI;
const POLLOUT: i16 = libc::POLLOUT;
const POLLERR: i16 = libc::POLLERR;
const POLLHUP: i16 = libc::POLLHUP;

// ======== Wake-up channel ========

/// Self-pipe used only to break the engine out of `poll(2)`.
pub struct Waker {
    read: OwnedFd,
    write: OwnedFd,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: fds has room for the two descriptors pipe(2) writes.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe(2) just returned both descriptors and nobody else
        // owns them.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        for fd in [read.as_raw_fd(), write.as_raw_fd()] {
            set_nonblock_cloexec(fd)?;
        }
        Ok(Waker { read, write })
    }

    /// Make the next (or current) poll return. Safe from any thread.
    pub fn wake(&self) {
        let byte = 1u8;
        // SAFETY: one valid byte is written from a live buffer. A full pipe
        // already guarantees a wake-up, so EAGAIN is ignored.
        unsafe { libc::write(self.write.as_raw_fd(), (&byte as *const u8).cast(), 1) };
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: buf is valid for writes of its length.
            let n = unsafe { libc::read(self.read.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }

    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

fn set_nonblock_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: plain fcntl calls on a descriptor we own.
    unsafe {
        let fl = libc::fcntl(fd, libc::F_GETFL);
        if fl < 0 || libc::fcntl(fd, libc::F_SETFL, fl | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

// ======== Poll set ========

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Wake,
    Tcp(SockHandle),
    Udp(SockHandle),
    Echo,
}

#[derive(Default)]
struct PollSet {
    fds: Vec<libc::pollfd>,
    sources: Vec<Source>,
}

impl PollSet {
    fn push(&mut self, fd: RawFd, events: i16, source: Source) {
        self.fds.push(libc::pollfd { fd, events, revents: 0 });
        self.sources.push(source);
    }

    /// Sources that reported readiness, with their events.
    fn ready(&self) -> impl Iterator<Item = (Source, i16)> + '_ {
        self.fds
            .iter()
            .zip(&self.sources)
            .filter(|(p, _)| p.revents != 0)
            .map(|(p, s)| (*s, p.revents))
    }
}

/// Block in `poll(2)` for at most `timeout`.
fn poll_fds(fds: &mut [libc::pollfd], timeout: Duration) -> io::Result<usize> {
    let ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    // SAFETY: fds is a valid, initialised array of pollfd for its length.
    let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, ms) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(n as usize)
}

impl Engine {
    /// Interest for every socket that currently needs attention.
    fn poll_set(&self, wake_fd: RawFd, now: Instant) -> PollSet {
        let mut set = PollSet::default();
        set.push(wake_fd, POLLIN, Source::Wake);

        for (h, ts) in self.tcb.iter() {
            let so = &ts.so;
            let Some(fd) = so.raw_fd() else {
                continue;
            };
            let events = if so.state.contains(SockState::ACCEPTING) {
                POLLIN
            } else if so.state.contains(SockState::ISFCONNECTING) {
                POLLOUT
            } else {
                let mut ev = 0;
                if so.can_frcv() && ts.tp.state.have_established() && so.snd.space() > 0 {
                    ev |= POLLIN | POLLPRI;
                }
                if !so.rcv.is_empty() && so.state.contains(SockState::ISFCONNECTED) {
                    ev |= POLLOUT;
                }
                ev
            };
            if events != 0 {
                set.push(fd, events, Source::Tcp(h));
            }
        }

        for (h, so) in self.udb.iter() {
            if let (true, Some(fd)) = (udp::wants_read(so, now), so.raw_fd()) {
                set.push(fd, POLLIN, Source::Udp(h));
            }
        }

        if let Some(fd) = self.cx.echo.raw_fd() {
            set.push(fd, POLLIN, Source::Echo);
        }
        set
    }

    /// Act on the readiness `poll(2)` reported. Sockets closed along the
    /// way stay allocated until the pass ends.
    fn dispatch_ready(&mut self, set: &PollSet) -> bool {
        let mut woken = false;
        self.tcb.begin_poll();
        self.udb.begin_poll();
        for (source, revents) in set.ready() {
            match source {
                Source::Wake => woken = true,
                Source::Tcp(h) => self.tcp_ready(h, revents),
                Source::Udp(h) => self.udp_host_input(h),
                Source::Echo => self.cx.icmp_host_input(),
            }
        }
        self.tcb.end_poll();
        self.udb.end_poll();
        woken
    }

    fn tcp_ready(&mut self, h: SockHandle, revents: i16) {
        let Some(ts) = self.tcb.get(h) else {
            return;
        };
        if ts.so.state.contains(SockState::ACCEPTING) {
            self.tcp_accept(h);
            return;
        }
        let Some(ts) = self.tcb.get_mut(h) else {
            return;
        };

        if ts.so.state.contains(SockState::ISFCONNECTING) {
            let err = match ts.so.fd.as_ref().map(|fd| fd.take_error()) {
                Some(Ok(None)) if revents & POLLHUP != 0 => Some(io::Error::from_raw_os_error(libc::ECONNREFUSED)),
                Some(Ok(None)) => None,
                Some(Ok(Some(e))) | Some(Err(e)) => Some(e),
                None => return,
            };
            match err {
                None => self.cx.tcp_connected(ts),
                Some(e) => {
                    debug!(
                        "tcp: connect {} -> {} failed ({:?}): {e}",
                        ts.so.guest,
                        ts.so.remote,
                        ConnectFailure::from_error(&e)
                    );
                    self.cx.tcp_connect_failed(ts, &e);
                }
            }
            return;
        }

        if revents & POLLPRI != 0 {
            match ts.so.sorecvoob() {
                Ok(n) if n > 0 => {
                    // Urgent pointer just past the byte.
                    ts.tp.snd_up = ts.tp.snd_una.wrapping_add(ts.so.snd.len() as u32);
                    ts.tp.force = true;
                    self.cx.tcp_output(ts);
                    ts.tp.force = false;
                }
                Ok(_) => {}
                Err(e) => trace!("tcp: oob read on {}: {e}", ts.so.guest),
            }
        }

        if revents & (POLLIN | POLLHUP | POLLERR) != 0 && ts.so.can_frcv() {
            match ts.so.soread() {
                ReadOutcome::Data(n) => {
                    trace!("tcp: {n} bytes from host for {}", ts.so.guest);
                    self.cx.tcp_output(ts);
                }
                ReadOutcome::Eof => {
                    debug!("tcp: host closed {} <-> {}", ts.so.guest, ts.so.remote);
                    ts.so.fcantrcvmore();
                    self.cx.tcp_sockclosed(ts);
                }
                ReadOutcome::Reset => {
                    debug!("tcp: host reset {} <-> {}", ts.so.guest, ts.so.remote);
                    self.cx.tcp_drop(ts);
                }
                ReadOutcome::Failed(e) => {
                    debug!("tcp: read for {} failed: {e}", ts.so.guest);
                    self.cx.tcp_drop(ts);
                }
                ReadOutcome::Full | ReadOutcome::WouldBlock => {}
            }
            if ts.so.is_freed() {
                return;
            }
        }

        if revents & POLLOUT != 0 && !ts.so.rcv.is_empty() {
            match ts.so.sowrite() {
                // Buffer space freed: the guest may hear of a larger window.
                Ok(n) if n > 0 => self.cx.tcp_output(ts),
                Ok(_) => {}
                Err(e) => {
                    debug!("tcp: write for {} failed: {e}", ts.so.guest);
                    self.cx.tcp_drop(ts);
                }
            }
        }
    }
}

#[cfg(test)]
impl Engine {
    /// One poll pass without a wake pipe.
    pub(crate) fn poll_once(&mut self, timeout: Duration) {
        let mut set = self.poll_set(-1, Instant::now());
        if poll_fds(&mut set.fds, timeout).unwrap_or(0) > 0 {
            self.dispatch_ready(&set);
        }
    }
}

// ======== Event loop ========

/// Runs the engine on the current thread until shutdown.
pub struct EventLoop {
    engine: Engine,
    waker: Arc<Waker>,
    requests: Receiver<Request>,
}

impl EventLoop {
    pub fn new(engine: Engine, waker: Arc<Waker>, requests: Receiver<Request>) -> Self {
        EventLoop {
            engine,
            waker,
            requests,
        }
    }

    pub fn run(mut self) {
        debug!("engine loop started");
        loop {
            let now = Instant::now();
            self.engine.run_timers(now);
            if !self.drain_requests() {
                break;
            }

            let mut set = self.engine.poll_set(self.waker.read_fd(), now);
            let timeout = self.engine.poll_timeout(now);
            if let Err(e) = poll_fds(&mut set.fds, timeout) {
                warn!("poll failed: {e}");
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
            self.engine.cx.now = Instant::now();
            if self.engine.dispatch_ready(&set) {
                self.waker.drain();
            }
        }
        self.engine.shutdown();
        debug!("engine loop stopped");
    }

    /// Process every queued request. Returns `false` once shutdown was
    /// requested or every producer is gone.
    fn drain_requests(&mut self) -> bool {
        loop {
            match self.requests.try_recv() {
                Ok(Request::Shutdown) => return false,
                Ok(req) => self.engine.handle(req),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }
}
