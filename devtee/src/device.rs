use std::os::fd::BorrowedFd;

use cusedev::{wire, CuseOps, FileInfo, PollHandle, Request, Session};
use fanring::{Cursor, Ring};
use nix::unistd::write;
use tracing::debug;

/// One synthetic device: its kernel session plus the reader-side state the
/// fan-out engine works on. The two halves are borrowed separately during
/// dispatch, so they live as separate fields.
pub struct Device {
    pub session: Session,
    pub state: DeviceState,
}

impl Device {
    pub fn new(name: String, session: Session) -> Self {
        Device {
            session,
            state: DeviceState {
                name,
                cursor: None,
                open_count: 0,
                poll_handle: None,
            },
        }
    }
}

/// Reader-side state of one synthetic device.
///
/// All clients of the device share the single cursor; the cursor exists
/// only while the device is open somewhere. At most one poll wakeup token
/// is retained at a time.
pub struct DeviceState {
    pub name: String,
    pub cursor: Option<Cursor>,
    pub open_count: u32,
    pub poll_handle: Option<PollHandle>,
}

impl DeviceState {
    pub fn available(&self, ring: &Ring) -> usize {
        self.cursor
            .as_ref()
            .map_or(0, |cursor| ring.readable(cursor).len())
    }
}

/// Services the requests of one device. Lives for a single dispatch; the
/// event loop splits these borrows fresh every time, so neither the ring
/// nor the device needs a pointer to the other.
pub struct DeviceHandler<'a> {
    pub ring: &'a mut Ring,
    pub state: &'a mut DeviceState,
    pub source: BorrowedFd<'a>,
}

impl CuseOps for DeviceHandler<'_> {
    fn open(&mut self, req: Request<'_>, _fi: FileInfo) -> cusedev::Result<()> {
        if self.state.open_count == 0 {
            self.state.cursor = Some(self.ring.attach());
        }
        self.state.open_count += 1;
        debug!(dev = %self.state.name, clients = self.state.open_count, "open");
        req.reply_open(0, 0)
    }

    fn release(&mut self, req: Request<'_>, _fi: FileInfo) -> cusedev::Result<()> {
        debug_assert!(self.state.open_count > 0, "release without open");
        self.state.open_count = self.state.open_count.saturating_sub(1);
        if self.state.open_count == 0 {
            self.state.cursor = None;
        }
        debug!(dev = %self.state.name, clients = self.state.open_count, "release");
        // the empty-buffer reply acknowledges the release; clients hang otherwise
        req.reply_data(&[])
    }

    fn read(&mut self, req: Request<'_>, size: usize, offset: u64, _fi: FileInfo) -> cusedev::Result<()> {
        let Some(cursor) = self.state.cursor.as_mut() else {
            debug_assert!(false, "read without open");
            return req.reply_data(&[]);
        };
        let span = self.ring.readable(&*cursor);
        let available = span.len();
        let (off, len) = if offset > available as u64 {
            (0, 0)
        } else {
            let off = offset as usize;
            (off, size.min(available - off))
        };
        debug!(dev = %self.state.name, size, offset, available, len, "read");
        req.reply_data(&span[off..off + len])?;
        self.ring.advance(cursor, len);
        Ok(())
    }

    fn write(&mut self, req: Request<'_>, data: &[u8], _offset: u64, _fi: FileInfo) -> cusedev::Result<()> {
        match write(self.source, data) {
            Ok(n) => {
                debug!(dev = %self.state.name, requested = data.len(), written = n, "write");
                req.reply_write(n)
            }
            Err(errno) => {
                debug!(dev = %self.state.name, %errno, "write failed");
                req.reply_err(errno)
            }
        }
    }

    fn poll(&mut self, req: Request<'_>, _fi: FileInfo, handle: Option<PollHandle>) -> cusedev::Result<()> {
        let available = self.state.available(self.ring);
        debug!(dev = %self.state.name, available, scheduled = handle.is_some(), "poll");
        if available > 0 {
            // data is already there; readiness goes back immediately and
            // the wakeup token is released unfired
            req.reply_poll(wire::POLLIN)
        } else {
            if let Some(handle) = handle {
                self.state.poll_handle = Some(handle);
            }
            req.reply_poll(0)
        }
    }
}
