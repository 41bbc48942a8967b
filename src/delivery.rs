//! Engine-to-guest frame delivery.
//!
//! The engine never calls into the device. It posts finished frames on one
//! of two channels and two delivery threads (regular and urgent) hand them
//! to the [`NetDevice`] under a shared device lock. A blocked channel
//! receive is what parks a delivery thread when there is nothing to do.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::error::Result;

/// Why the device refused a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Receive ring full; call `wait_for_room` before retrying.
    WaitForRoom,
    /// Transient refusal; retry shortly.
    TryAgain,
    /// The device is gone; further frames are discarded.
    Closed,
}

/// The outbound boundary: whatever carries frames into the guest.
pub trait NetDevice: Send + 'static {
    fn deliver(&mut self, frame: &[u8]) -> std::result::Result<(), Backpressure>;

    /// Block until the device can accept a frame or `timeout` passes.
    /// Returns whether room became available.
    fn wait_for_room(&mut self, timeout: Duration) -> bool {
        thread::sleep(timeout.min(Duration::from_millis(10)));
        true
    }
}

/// Counts one outstanding frame against a socket while alive.
#[derive(Debug)]
pub struct Credit(Arc<AtomicUsize>);

impl Credit {
    pub fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Credit(counter)
    }
}

impl Drop for Credit {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A complete Ethernet frame bound for the guest.
#[derive(Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub credit: Option<Credit>,
}

/// Sending half of the two delivery queues, owned by the engine.
pub struct Outbox {
    normal: Sender<Frame>,
    urgent: Sender<Frame>,
}

impl Outbox {
    /// Queue a frame. Returns `false` when the delivery side is gone.
    pub fn send(&self, frame: Frame, urgent: bool) -> bool {
        let tx = if urgent { &self.urgent } else { &self.normal };
        tx.send(frame).is_ok()
    }
}

/// Create the delivery queues: the engine's outbox plus the regular and
/// urgent receivers.
pub fn outbox() -> (Outbox, Receiver<Frame>, Receiver<Frame>) {
    let (normal, normal_rx) = mpsc::channel();
    let (urgent, urgent_rx) = mpsc::channel();
    (Outbox { normal, urgent }, normal_rx, urgent_rx)
}

const MAX_ATTEMPTS: u32 = 50;
const ROOM_WAIT: Duration = Duration::from_millis(100);

/// Spawn a delivery thread draining `rx` into `device`. Exits when the
/// engine drops its outbox.
pub fn spawn<D: NetDevice>(name: &str, rx: Receiver<Frame>, device: Arc<Mutex<D>>) -> Result<JoinHandle<()>> {
    let label = name.to_string();
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || run(&label, rx, &device))?;
    Ok(handle)
}

fn run<D: NetDevice>(label: &str, rx: Receiver<Frame>, device: &Mutex<D>) {
    let mut closed = false;
    for frame in rx {
        if closed {
            continue;
        }
        match deliver_one(device, &frame.data) {
            Ok(()) => trace!("{label}: delivered {} bytes", frame.data.len()),
            Err(Backpressure::Closed) => {
                warn!("{label}: device closed, discarding further frames");
                closed = true;
            }
            Err(e) => debug!("{label}: dropped frame after retries ({e:?})"),
        }
        // `frame.credit` is released here, whether delivered or not.
    }
    debug!("{label}: exiting");
}

fn deliver_one<D: NetDevice>(device: &Mutex<D>, data: &[u8]) -> std::result::Result<(), Backpressure> {
    let mut last = Backpressure::TryAgain;
    for _ in 0..MAX_ATTEMPTS {
        let mut dev = match device.lock() {
            Ok(dev) => dev,
            Err(poisoned) => poisoned.into_inner(),
        };
        match dev.deliver(data) {
            Ok(()) => return Ok(()),
            Err(Backpressure::Closed) => return Err(Backpressure::Closed),
            Err(Backpressure::WaitForRoom) => {
                last = Backpressure::WaitForRoom;
                dev.wait_for_room(ROOM_WAIT);
            }
            Err(Backpressure::TryAgain) => {
                last = Backpressure::TryAgain;
                drop(dev);
                thread::yield_now();
            }
        }
    }
    Err(last)
}
