//! Thread wiring for a running stack.
//!
//! [`NetStack::spawn`] builds the engine on the caller's thread (so setup
//! errors surface there), then starts the engine thread, the regular and
//! urgent delivery threads and the resolver thread.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};

use crate::config::NetConfig;
use crate::delivery::{self, NetDevice};
use crate::dispatch::NetHandle;
use crate::engine::Engine;
use crate::error::Result;
use crate::poller::{EventLoop, Waker};
use crate::resolver;

pub struct NetStack {
    handle: NetHandle,
    threads: Vec<(&'static str, JoinHandle<()>)>,
}

impl NetStack {
    pub fn spawn<D: NetDevice>(config: NetConfig, device: D) -> Result<NetStack> {
        let timeout = config.request_timeout;
        let (outbox, normal_rx, urgent_rx) = delivery::outbox();
        let engine = Engine::new(config, outbox)?;

        let waker = Arc::new(Waker::new()?);
        let (req_tx, req_rx) = mpsc::channel();
        let (job_tx, job_rx) = mpsc::channel();
        let device = Arc::new(Mutex::new(device));

        let mut threads = Vec::new();
        threads.push(("deliver", delivery::spawn("unet-deliver", normal_rx, device.clone())?));
        threads.push(("urgent", delivery::spawn("unet-urgent", urgent_rx, device)?));
        threads.push(("resolver", resolver::spawn(job_rx, req_tx.clone(), waker.clone())?));
        let event_loop = EventLoop::new(engine, waker.clone(), req_rx);
        let engine_thread = thread::Builder::new()
            .name("unet-engine".into())
            .spawn(move || event_loop.run())?;
        // Engine first: delivery threads end once it drops the outbox.
        threads.insert(0, ("engine", engine_thread));

        info!("network stack running");
        Ok(NetStack {
            handle: NetHandle::new(req_tx, job_tx, waker, timeout),
            threads,
        })
    }

    /// A producer handle for other threads.
    pub fn handle(&self) -> NetHandle {
        self.handle.clone()
    }

    /// Close every connection and join all threads.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        if self.threads.is_empty() {
            return Ok(());
        }
        let res = self.handle.shutdown();
        for (name, t) in self.threads.drain(..) {
            if t.join().is_err() {
                warn!("{name} thread panicked");
            }
        }
        debug!("network stack stopped");
        res
    }
}

impl Drop for NetStack {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
