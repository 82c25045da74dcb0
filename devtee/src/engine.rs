use std::os::fd::{AsFd, OwnedFd};

use cusedev::{Received, Session, RECV_BUF_LEN};
use fanring::Ring;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::device::{Device, DeviceHandler};
use crate::source;
use crate::Result;

/// Epoll token of the source descriptor; device `i` uses token `i + 1`.
const SOURCE_TOKEN: u64 = 0;
/// Descriptors serviced per wakeup. Bounds batch latency only; leftover
/// readiness shows up again on the next wait.
const MAX_EVENTS: usize = 8;
/// Liveness heartbeat for the wait; bounds shutdown latency, nothing else.
const WAIT_TIMEOUT_MS: u16 = 30_000;

/// Owns every descriptor and all fan-out state, and runs the whole show on
/// the calling thread.
pub struct Engine {
    epoll: Epoll,
    source: OwnedFd,
    ring: Ring,
    devices: Vec<Device>,
    recv_buf: Vec<u8>,
}

impl Engine {
    /// Register the source and one synthetic device per configured name.
    pub fn new(source: OwnedFd, config: &Config) -> Result<Self> {
        let ring = Ring::new(config.bufsize)?;
        let devices = config
            .names
            .iter()
            .map(|name| Session::open(name).map(|session| Device::new(name.clone(), session)))
            .collect::<cusedev::Result<Vec<_>>>()?;
        Self::from_parts(source, ring, devices)
    }

    /// Assemble an engine from pre-built parts; [`Engine::new`] is the
    /// normal route. Useful when sessions arrive over fd passing, and for
    /// driving the loop against plain descriptors in tests.
    pub fn from_parts(source: OwnedFd, ring: Ring, devices: Vec<Device>) -> Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        epoll.add(&source, EpollEvent::new(EpollFlags::EPOLLIN, SOURCE_TOKEN))?;
        for (idx, dev) in devices.iter().enumerate() {
            epoll.add(
                dev.session.fd(),
                EpollEvent::new(EpollFlags::EPOLLIN, idx as u64 + 1),
            )?;
            info!(dev = %dev.state.name, "device session registered");
        }
        Ok(Engine {
            epoll,
            source,
            ring,
            devices,
            recv_buf: vec![0u8; RECV_BUF_LEN],
        })
    }

    /// Multiplex the source and every device session until a session ends
    /// or the wait fails.
    ///
    /// Ready descriptors are serviced in the order the kernel reports
    /// them, and a source drain runs to completion (repair, publish,
    /// wakeups) before any device callback of the same batch, so callbacks
    /// never observe a half-applied ring update.
    pub fn run(&mut self) {
        let mut events = vec![EpollEvent::empty(); MAX_EVENTS];
        let timeout = EpollTimeout::from(WAIT_TIMEOUT_MS);
        let mut stop = false;
        while !stop {
            let count = match self.epoll.wait(&mut events, timeout) {
                Ok(count) => count,
                Err(errno) => {
                    info!(%errno, "leaving the wait loop");
                    break;
                }
            };
            for event in events.iter().take(count) {
                match event.data() {
                    SOURCE_TOKEN => {
                        source::drain(&self.source, &mut self.ring, &mut self.devices)
                    }
                    token => {
                        let idx = (token - 1) as usize;
                        let Device { session, state } = &mut self.devices[idx];
                        match session.receive(&mut self.recv_buf) {
                            Ok(Received::Interrupted) => continue,
                            Ok(Received::Closed) => {
                                debug!(dev = %state.name, "session closed");
                                stop = true;
                                break;
                            }
                            Err(error) => {
                                warn!(dev = %state.name, %error, "receive failed");
                                stop = true;
                                break;
                            }
                            Ok(Received::Data(len)) => {
                                let mut handler = DeviceHandler {
                                    ring: &mut self.ring,
                                    state,
                                    source: self.source.as_fd(),
                                };
                                if let Err(error) =
                                    session.process(&self.recv_buf[..len], &mut handler)
                                {
                                    warn!(%error, "request dispatch failed");
                                }
                                if session.exited() {
                                    debug!(dev = %state.name, "session exited");
                                    stop = true;
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}
