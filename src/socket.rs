//! Virtual Sockets.
//!
//! A Virtual Socket pairs the guest's view of a flow (its own endpoint and
//! the foreign endpoint it believes it is talking to) with the real host
//! socket carrying it. Sockets live in a [`SocketList`]: an arena indexed
//! by generation-tagged [`SockHandle`]s. Protocol code never removes a
//! socket directly; it marks it for freeing and the list reclaims the slot
//! once no poll pass is iterating over it.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddrV4};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bitflags::bitflags;
use log::{debug, trace};
use socket2::{Domain, Protocol, Type};

use crate::forward::ForwardRule;
use crate::sbuf::SockBuf;
use crate::tcp::{SavedSyn, Tcb};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SockState: u16 {
        /// No host descriptor worth polling.
        const NOFDREF = 0x001;
        /// Non-blocking host connect in progress.
        const ISFCONNECTING = 0x002;
        /// Host side connected.
        const ISFCONNECTED = 0x004;
        /// Host will send us no more data.
        const FCANTRCVMORE = 0x008;
        /// We will send the host no more data.
        const FCANTSENDMORE = 0x010;
        /// Shut the host write side once the guest data drains.
        const FWDRAIN = 0x020;
        /// Listening host socket of a port-forward rule.
        const ACCEPTING = 0x040;
        /// Closed; the slot is reclaimed by the next sweep.
        const FREE_PENDING = 0x100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SockProto {
    Tcp,
    Udp,
}

impl std::fmt::Display for SockProto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SockProto::Tcp => f.write_str("tcp"),
            SockProto::Udp => f.write_str("udp"),
        }
    }
}

/// Result of pulling host data into the send buffer.
#[derive(Debug)]
pub enum ReadOutcome {
    Data(usize),
    /// Buffer full; nothing read.
    Full,
    WouldBlock,
    /// Orderly end of stream.
    Eof,
    /// Peer reset or connection lost.
    Reset,
    Failed(io::Error),
}

pub struct Socket {
    pub proto: SockProto,
    pub fd: Option<socket2::Socket>,
    pub state: SockState,
    /// The guest's own endpoint.
    pub guest: SocketAddrV4,
    /// The foreign endpoint as the guest sees it.
    pub remote: SocketAddrV4,
    /// Host data waiting to reach the guest.
    pub snd: SockBuf,
    /// Guest data waiting to reach the host.
    pub rcv: SockBuf,
    /// Urgent bytes at the head of `rcv`.
    pub urgc: usize,
    /// Idle deadline (UDP only).
    pub expire: Option<Instant>,
    /// Frames handed to delivery and not yet delivered.
    pub queued: Arc<AtomicUsize>,
    /// Rule this socket serves, for listeners and bound UDP sockets.
    pub forward: Option<ForwardRule>,
}

impl Socket {
    pub fn new(proto: SockProto, guest: SocketAddrV4, remote: SocketAddrV4, buf_size: usize) -> Self {
        Socket {
            proto,
            fd: None,
            state: SockState::NOFDREF,
            guest,
            remote,
            snd: SockBuf::new(buf_size),
            rcv: SockBuf::new(buf_size),
            urgc: 0,
            expire: None,
            queued: Arc::new(AtomicUsize::new(0)),
            forward: None,
        }
    }

    pub fn is_freed(&self) -> bool {
        self.state.contains(SockState::FREE_PENDING)
    }

    /// Close the host descriptor and flag the socket for reclamation.
    /// Calling it again is a no-op.
    pub fn mark_for_free(&mut self) {
        if self.is_freed() {
            return;
        }
        trace!("{} socket {} <-> {} closed", self.proto, self.guest, self.remote);
        self.fd = None;
        self.state = SockState::NOFDREF | SockState::FREE_PENDING;
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    /// Host side open for sending and not shut down.
    pub fn can_fsend(&self) -> bool {
        self.state & (SockState::NOFDREF | SockState::FCANTSENDMORE | SockState::ISFCONNECTED)
            == SockState::ISFCONNECTED
    }

    /// Host side open for receiving.
    pub fn can_frcv(&self) -> bool {
        self.state & (SockState::NOFDREF | SockState::FCANTRCVMORE | SockState::ISFCONNECTED)
            == SockState::ISFCONNECTED
    }

    pub fn isfconnecting(&mut self) {
        self.state.remove(
            SockState::NOFDREF
                | SockState::ISFCONNECTED
                | SockState::FCANTRCVMORE
                | SockState::FCANTSENDMORE
                | SockState::FWDRAIN,
        );
        self.state.insert(SockState::ISFCONNECTING);
    }

    pub fn isfconnected(&mut self) {
        self.state.remove(
            SockState::ISFCONNECTING
                | SockState::FWDRAIN
                | SockState::NOFDREF
                | SockState::FCANTRCVMORE
                | SockState::FCANTSENDMORE,
        );
        self.state.insert(SockState::ISFCONNECTED);
    }

    /// A peer that already went away makes shutdown fail; the state
    /// machine moves on regardless.
    fn shutdown_host(&self, how: Shutdown) {
        if let Some(fd) = &self.fd {
            if let Err(e) = fd.shutdown(how) {
                debug!("{:?} {} <-> {}: shutdown({how:?}): {e}", self.proto, self.guest, self.remote);
            }
        }
    }

    /// The host closed its sending side.
    pub fn fcantrcvmore(&mut self) {
        if self.state.contains(SockState::FCANTRCVMORE) {
            return;
        }
        self.shutdown_host(Shutdown::Read);
        self.state.remove(SockState::ISFCONNECTING);
        if self.state.contains(SockState::FCANTSENDMORE) {
            self.state = SockState::NOFDREF | (self.state & SockState::FREE_PENDING);
        } else {
            self.state.insert(SockState::FCANTRCVMORE);
        }
    }

    /// No more guest data will be written to the host.
    pub fn fcantsendmore(&mut self) {
        if self.state.contains(SockState::FCANTSENDMORE) {
            return;
        }
        self.shutdown_host(Shutdown::Write);
        self.state.remove(SockState::ISFCONNECTING);
        if self.state.contains(SockState::FCANTRCVMORE) {
            self.state = SockState::NOFDREF | (self.state & SockState::FREE_PENDING);
        } else {
            self.state.insert(SockState::FCANTSENDMORE);
        }
    }

    /// The guest sent FIN: shut the host write side now, or once the
    /// pending guest data has been written.
    pub fn fwdrain(&mut self) {
        if self.rcv.is_empty() {
            self.fcantsendmore();
        } else {
            self.state.insert(SockState::FWDRAIN);
        }
    }

    /// Both directions are finished on the host side.
    pub fn isfdisconnected(&mut self) {
        self.shutdown_host(Shutdown::Both);
        self.state.remove(SockState::ISFCONNECTING | SockState::ISFCONNECTED);
        self.state.insert(SockState::FCANTRCVMORE | SockState::FCANTSENDMORE);
    }

    /// Pull host data into `snd`.
    pub fn soread(&mut self) -> ReadOutcome {
        let Socket { fd, snd, .. } = self;
        let Some(fd) = fd.as_ref() else {
            return ReadOutcome::WouldBlock;
        };
        if snd.space() == 0 {
            return ReadOutcome::Full;
        }
        let res = snd.fill_from(|buf| {
            let mut reader: &socket2::Socket = fd;
            reader.read(buf)
        });
        match res {
            Ok(0) => ReadOutcome::Eof,
            Ok(n) => ReadOutcome::Data(n),
            Err(e) => classify_read_error(e),
        }
    }

    /// Read one out-of-band byte into `snd`.
    pub fn sorecvoob(&mut self) -> io::Result<usize> {
        let Some(fd) = self.raw_fd() else {
            return Ok(0);
        };
        if self.snd.space() == 0 {
            return Ok(0);
        }
        let mut byte = [0u8; 1];
        // SAFETY: `byte` is a valid one-byte buffer for the call.
        let n = unsafe { libc::recv(fd, byte.as_mut_ptr().cast(), 1, libc::MSG_OOB) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(self.snd.write(&byte[..n as usize]))
    }

    /// Write pending guest data to the host. Urgent bytes go first, the
    /// last of them out of band.
    pub fn sowrite(&mut self) -> io::Result<usize> {
        let Socket { fd, rcv, urgc, .. } = self;
        let Some(fd) = fd.as_ref() else {
            return Ok(0);
        };
        let write = |chunk: &[u8]| {
            let mut writer: &socket2::Socket = fd;
            writer.write(chunk)
        };

        let mut total = 0;
        if *urgc > 0 {
            if *urgc > 1 {
                let n = absorb_would_block(rcv.drain_into(*urgc - 1, write))?;
                *urgc -= n;
                total += n;
            }
            if *urgc == 1 {
                let mut byte = [0u8; 1];
                if rcv.peek(0, &mut byte) == 1 {
                    match fd.send_out_of_band(&byte) {
                        Ok(1) => {
                            rcv.drop_front(1);
                            *urgc = 0;
                            total += 1;
                        }
                        Ok(_) => return Ok(total),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                        Err(e) => return Err(e),
                    }
                } else {
                    *urgc = 0;
                }
            }
            if *urgc > 0 {
                return Ok(total);
            }
        }

        total += absorb_would_block(rcv.drain_into(usize::MAX, write))?;
        if self.state.contains(SockState::FWDRAIN) && self.rcv.is_empty() {
            self.fcantsendmore();
        }
        Ok(total)
    }

    /// Queue guest data for the host, writing straight through when
    /// nothing is already waiting. Returns the bytes accepted.
    pub fn sbappend(&mut self, data: &[u8]) -> usize {
        let mut sent = 0;
        if self.rcv.is_empty() && self.urgc == 0 && self.can_fsend() {
            if let Some(fd) = self.fd.as_ref() {
                let mut writer: &socket2::Socket = fd;
                match writer.write(data) {
                    Ok(n) => sent = n,
                    Err(e) => trace!("direct write to host deferred: {e}"),
                }
            }
        }
        sent + self.rcv.write(&data[sent..])
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("proto", &self.proto)
            .field("fd", &self.raw_fd())
            .field("state", &self.state)
            .field("guest", &self.guest)
            .field("remote", &self.remote)
            .field("snd", &self.snd.len())
            .field("rcv", &self.rcv.len())
            .finish()
    }
}

fn classify_read_error(e: io::Error) -> ReadOutcome {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => ReadOutcome::WouldBlock,
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe => ReadOutcome::Reset,
        _ => ReadOutcome::Failed(e),
    }
}

fn absorb_would_block(res: io::Result<usize>) -> io::Result<usize> {
    match res {
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
        other => other,
    }
}

/// A TCP Virtual Socket and its Control Block.
#[derive(Debug)]
pub struct TcpSocket {
    pub so: Socket,
    pub tp: Tcb,
    /// The guest's SYN, held while the host connect is in progress.
    pub syn: Option<SavedSyn>,
}

impl TcpSocket {
    pub fn new(guest: SocketAddrV4, remote: SocketAddrV4, buf_size: usize, mss: u16) -> Self {
        TcpSocket {
            so: Socket::new(SockProto::Tcp, guest, remote, buf_size),
            tp: Tcb::new(mss),
            syn: None,
        }
    }
}

/// Gives [`SocketList`] access to the socket flags of its entries.
pub trait Entry {
    fn socket(&self) -> &Socket;
}

impl Entry for Socket {
    fn socket(&self) -> &Socket {
        self
    }
}

impl Entry for TcpSocket {
    fn socket(&self) -> &Socket {
        &self.so
    }
}

// ======== Socket list ========

/// Stable reference to a list entry. A handle whose slot has been
/// reclaimed (and possibly reused) resolves to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SockHandle {
    index: u32,
    gen: u32,
}

struct Slot<T> {
    gen: u32,
    entry: Option<T>,
}

pub struct SocketList<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    polling: bool,
}

impl<T: Entry> Default for SocketList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entry> SocketList<T> {
    pub fn new() -> Self {
        SocketList {
            slots: Vec::new(),
            free: Vec::new(),
            polling: false,
        }
    }

    pub fn insert(&mut self, entry: T) -> SockHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.entry.is_none());
            slot.entry = Some(entry);
            SockHandle { index, gen: slot.gen }
        } else {
            self.slots.push(Slot {
                gen: 0,
                entry: Some(entry),
            });
            SockHandle {
                index: (self.slots.len() - 1) as u32,
                gen: 0,
            }
        }
    }

    pub fn get(&self, h: SockHandle) -> Option<&T> {
        let slot = self.slots.get(h.index as usize)?;
        if slot.gen != h.gen {
            return None;
        }
        slot.entry.as_ref().filter(|e| !e.socket().is_freed())
    }

    pub fn get_mut(&mut self, h: SockHandle) -> Option<&mut T> {
        let slot = self.slots.get_mut(h.index as usize)?;
        if slot.gen != h.gen {
            return None;
        }
        slot.entry.as_mut().filter(|e| !e.socket().is_freed())
    }

    /// Live entries.
    pub fn iter(&self) -> impl Iterator<Item = (SockHandle, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            let entry = slot.entry.as_ref()?;
            if entry.socket().is_freed() {
                return None;
            }
            Some((
                SockHandle {
                    index: i as u32,
                    gen: slot.gen,
                },
                entry,
            ))
        })
    }

    /// Snapshot of live handles, for passes that mutate the list.
    pub fn handles(&self) -> Vec<SockHandle> {
        self.iter().map(|(h, _)| h).collect()
    }

    pub fn find<P>(&self, mut pred: P) -> Option<SockHandle>
    where
        P: FnMut(&T) -> bool,
    {
        self.iter().find(|(_, e)| pred(e)).map(|(h, _)| h)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Start a pass that holds handles across mutations. Freed slots are
    /// kept until [`end_poll`](Self::end_poll).
    pub fn begin_poll(&mut self) {
        debug_assert!(!self.polling, "nested poll pass");
        self.polling = true;
    }

    pub fn end_poll(&mut self) -> usize {
        debug_assert!(self.polling, "end_poll without begin_poll");
        self.polling = false;
        self.sweep()
    }

    /// Reclaim every slot marked for freeing. Deferred while polling.
    pub fn sweep(&mut self) -> usize {
        if self.polling {
            return 0;
        }
        let mut reclaimed = 0;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.entry.as_ref().is_some_and(|e| e.socket().is_freed()) {
                slot.entry = None;
                slot.gen = slot.gen.wrapping_add(1);
                self.free.push(i as u32);
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Remove every entry, live or not.
    pub fn drain(&mut self) -> Vec<T> {
        debug_assert!(!self.polling);
        let mut out = Vec::new();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if let Some(entry) = slot.entry.take() {
                slot.gen = slot.gen.wrapping_add(1);
                self.free.push(i as u32);
                out.push(entry);
            }
        }
        out
    }
}

// ======== Host socket helpers ========

/// Non-blocking IPv4 host socket, bound to `bind` when given.
pub(crate) fn host_socket(ty: Type, proto: Protocol, bind: Option<Ipv4Addr>) -> io::Result<socket2::Socket> {
    let sock = socket2::Socket::new(Domain::IPV4, ty, Some(proto))?;
    sock.set_nonblocking(true)?;
    if let Some(addr) = bind {
        sock.bind(&SocketAddrV4::new(addr, 0).into())?;
    }
    Ok(sock)
}

/// `recvfrom(2)` into an initialised buffer, IPv4 peers only.
pub(crate) fn recv_from_v4(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
    // SAFETY: sockaddr_in is plain old data; all-zero is a valid value.
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    // SAFETY: buf and addr are valid for writes of the lengths passed.
    let n = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr().cast(),
            buf.len(),
            0,
            (&mut addr as *mut libc::sockaddr_in).cast(),
            &mut len,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    Ok((n as usize, SocketAddrV4::new(ip, u16::from_be(addr.sin_port))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn udp(port: u16) -> Socket {
        Socket::new(
            SockProto::Udp,
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 2, 15), port),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 2, 2), 53),
            0,
        )
    }

    #[test]
    fn test_handles_survive_other_removals() {
        let mut list = SocketList::new();
        let a = list.insert(udp(1));
        let b = list.insert(udp(2));
        list.get_mut(a).unwrap().mark_for_free();
        assert!(list.get(a).is_none());
        assert_eq!(list.sweep(), 1);
        assert_eq!(list.get(b).unwrap().guest.port(), 2);

        // The reclaimed slot is reused under a new generation.
        let c = list.insert(udp(3));
        assert!(list.get(a).is_none());
        assert_eq!(list.get(c).unwrap().guest.port(), 3);
    }

    #[test]
    fn test_free_is_deferred_while_polling() {
        let mut list = SocketList::new();
        let a = list.insert(udp(1));
        list.begin_poll();
        list.get_mut(a).unwrap().mark_for_free();
        assert_eq!(list.sweep(), 0);
        assert!(list.get(a).is_none());
        assert_eq!(list.len(), 0);
        assert_eq!(list.end_poll(), 1);
        assert_eq!(list.sweep(), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut so = udp(1);
        so.mark_for_free();
        let state = so.state;
        so.mark_for_free();
        assert_eq!(so.state, state);
        so.fcantrcvmore();
        so.fcantsendmore();
        assert!(so.is_freed());
    }

    #[test]
    fn test_half_close_transitions() {
        let mut so = udp(1);
        so.isfconnected();
        assert!(so.can_fsend() && so.can_frcv());
        so.rcv = SockBuf::new(16);
        so.rcv.write(b"pending");
        so.fwdrain();
        assert!(so.state.contains(SockState::FWDRAIN));
        assert!(so.can_fsend());
        so.fcantrcvmore();
        assert!(!so.can_frcv());
        so.fcantsendmore();
        assert_eq!(so.state, SockState::NOFDREF);
    }

    #[test]
    fn test_half_close_reaches_the_host_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let sock = socket2::Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        sock.connect(&addr.into()).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        let mut so = udp(1);
        so.proto = SockProto::Tcp;
        so.fd = Some(sock);
        so.isfconnected();
        so.fcantsendmore();
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);

        // Shutting an unconnected socket fails on the host; the
        // transitions still happen.
        let mut lone = udp(2);
        lone.fd = Some(socket2::Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap());
        lone.isfconnected();
        lone.fcantrcvmore();
        lone.fcantsendmore();
        assert_eq!(lone.state, SockState::NOFDREF);
        lone.isfdisconnected();
        assert!(!lone.can_frcv() && !lone.can_fsend());
    }

    #[test]
    fn test_soread_and_sowrite_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let sock = socket2::Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        sock.connect(&addr.into()).unwrap();
        sock.set_nonblocking(true).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        let mut so = Socket::new(
            SockProto::Tcp,
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 2, 15), 40000),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 2, 2), addr.port()),
            1024,
        );
        so.fd = Some(sock);
        so.isfconnected();

        assert_eq!(so.sbappend(b"hello host"), 10);
        let mut buf = [0u8; 10];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello host");

        peer.write_all(b"hello guest").unwrap();
        let mut got = 0;
        for _ in 0..100 {
            if let ReadOutcome::Data(n) = so.soread() {
                got += n;
            }
            if got == 11 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(got, 11);
        let mut out = [0u8; 11];
        so.snd.peek(0, &mut out);
        assert_eq!(&out, b"hello guest");

        drop(peer);
        let mut eof = false;
        for _ in 0..100 {
            if matches!(so.soread(), ReadOutcome::Eof | ReadOutcome::Reset) {
                eof = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(eof);
    }
}
