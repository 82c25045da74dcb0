use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::read;
use tracing::{debug, warn};

use fanring::Ring;

use crate::device::Device;

/// Open the device whose read stream is fanned out: read-write for the
/// client write path, nonblocking so the drain loop can stop at the last
/// byte, no controlling terminal, writes flushed synchronously.
pub fn open_source(path: &Path) -> std::result::Result<OwnedFd, Errno> {
    let flags = OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_SYNC | OFlag::O_NONBLOCK;
    let fd = open(path, flags, Mode::empty())?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Drain everything the source currently has into the ring.
///
/// Each iteration reads one contiguous span, publishes it (snapping lapped
/// readers forward), and wakes pollers that just gained data. Wakeups fire
/// per iteration, so a read stopping at the wrap boundary still wakes
/// readers before the next span lands.
///
/// A would-block or end-of-stream ends the drain; the next readiness event
/// resumes it. Hard read errors are logged and treated the same, keeping
/// the devices alive for writes while the source is gone.
pub fn drain(source: impl AsFd, ring: &mut Ring, devices: &mut [Device]) {
    loop {
        let window = ring.reserve();
        let n = match read(source.as_fd().as_raw_fd(), window) {
            Ok(0) => break,
            Ok(n) => n,
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => break,
            Err(errno) => {
                warn!(%errno, "source read failed");
                break;
            }
        };
        ring.commit(
            n,
            devices
                .iter_mut()
                .filter_map(|dev| dev.state.cursor.as_mut()),
        );
        debug!(bytes = n, head = ring.head(), lap = ring.lap(), "source drained");
        for dev in devices.iter_mut() {
            if dev.state.available(ring) == 0 {
                continue;
            }
            if let Some(handle) = dev.state.poll_handle.take() {
                if let Err(error) = dev.session.notify_poll(handle) {
                    warn!(dev = %dev.state.name, %error, "poll wakeup failed");
                }
            }
        }
    }
}
