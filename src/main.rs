mod cli;

use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};

use anyhow::{Context, Result};
use clap::Parser;
use cli::Args;
use log::{debug, info, warn};
use unet::{Backpressure, NetDevice, NetStack};

/// Largest frame accepted from the hypervisor.
const MAX_FRAME: usize = 65536;

/// Writes frames to the hypervisor with a 4-byte big-endian length prefix.
struct StreamDevice {
    stream: UnixStream,
}

impl NetDevice for StreamDevice {
    fn deliver(&mut self, frame: &[u8]) -> std::result::Result<(), Backpressure> {
        let len = (frame.len() as u32).to_be_bytes();
        self.stream
            .write_all(&len)
            .and_then(|()| self.stream.write_all(frame))
            .map_err(|e| {
                debug!("frame write failed: {e}");
                Backpressure::Closed
            })
    }
}

/// Read one length-prefixed frame into `buf`. `Ok(false)` on a clean EOF.
fn read_frame(stream: &mut UnixStream, buf: &mut Vec<u8>) -> io::Result<bool> {
    let mut len = [0u8; 4];
    match stream.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes"),
        ));
    }
    buf.resize(len, 0);
    stream.read_exact(buf)?;
    Ok(true)
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .format_timestamp(None)
        .format_target(false)
        .init();

    let config = args.config();
    let listener = UnixListener::bind(&args.socket)
        .with_context(|| format!("failed to listen on {}", args.socket.display()))?;
    info!("waiting for the hypervisor on {}", args.socket.display());
    let (mut stream, _) = listener.accept().context("failed to accept hypervisor connection")?;
    let writer = stream.try_clone().context("failed to clone hypervisor stream")?;

    let stack = NetStack::spawn(config, StreamDevice { stream: writer }).context("failed to start network stack")?;
    let handle = stack.handle();

    let mut buf = Vec::with_capacity(MAX_FRAME);
    loop {
        match read_frame(&mut stream, &mut buf) {
            Ok(true) => {
                if let Err(e) = handle.send_frame(&buf) {
                    warn!("engine stopped accepting frames: {e}");
                    break;
                }
            }
            Ok(false) => {
                info!("hypervisor disconnected");
                break;
            }
            Err(e) => {
                warn!("frame read failed: {e}");
                break;
            }
        }
    }

    let _ = std::fs::remove_file(&args.socket);
    stack.shutdown().context("network stack shutdown failed")?;
    Ok(())
}
