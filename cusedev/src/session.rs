use std::io::IoSlice;
use std::mem::size_of;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::sys::uio::writev;
use nix::unistd::read;
use tracing::{debug, warn};
use zerocopy::{FromBytes, IntoBytes};

use crate::error::{CuseError, Result};
use crate::wire::{self, op};

const CUSE_PATH: &str = "/dev/cuse";

/// Largest write payload advertised to the kernel.
const MAX_WRITE: u32 = 128 * 1024;
/// Largest read reply advertised to the kernel.
const MAX_READ: u32 = 128 * 1024;

/// Buffers handed to [`Session::receive`] must hold a request header plus a
/// full write payload.
pub const RECV_BUF_LEN: usize = MAX_WRITE as usize + 4096;

/// Outcome of one [`Session::receive`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// One request of this many bytes landed in the buffer.
    Data(usize),
    /// Transient condition; try again on the next readiness event.
    Interrupted,
    /// The kernel ended the session.
    Closed,
}

/// Per-handle bookkeeping the kernel attaches to a request.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileInfo {
    pub fh: u64,
    pub flags: u32,
}

/// Kernel-issued wakeup token for a reader blocked in poll.
///
/// Fired at most once through [`Session::notify_poll`], which consumes the
/// handle; dropping it releases the wakeup without firing.
#[derive(Debug)]
pub struct PollHandle {
    pub(crate) kh: u64,
}

impl PollHandle {
    /// The kernel's token for this wakeup.
    pub fn kh(&self) -> u64 {
        self.kh
    }
}

/// Reply handle for one kernel request, consumed by exactly one reply.
pub struct Request<'a> {
    fd: BorrowedFd<'a>,
    unique: u64,
}

impl Request<'_> {
    pub fn unique(&self) -> u64 {
        self.unique
    }

    fn send(self, error: i32, payload: &[&[u8]]) -> Result<()> {
        let len = size_of::<wire::OutHeader>() + payload.iter().map(|p| p.len()).sum::<usize>();
        let header = wire::OutHeader {
            len: len as u32,
            error,
            unique: self.unique,
        };
        let mut iov = Vec::with_capacity(payload.len() + 1);
        iov.push(IoSlice::new(header.as_bytes()));
        iov.extend(payload.iter().map(|p| IoSlice::new(p)));
        writev(self.fd, &iov)?;
        Ok(())
    }

    pub fn reply_open(self, fh: u64, open_flags: u32) -> Result<()> {
        let arg = wire::OpenOut {
            fh,
            open_flags,
            padding: 0,
        };
        self.send(0, &[arg.as_bytes()])
    }

    /// Reply with a data buffer; an empty buffer is a valid acknowledgement.
    pub fn reply_data(self, data: &[u8]) -> Result<()> {
        self.send(0, &[data])
    }

    pub fn reply_write(self, count: usize) -> Result<()> {
        let arg = wire::WriteOut {
            size: count as u32,
            padding: 0,
        };
        self.send(0, &[arg.as_bytes()])
    }

    pub fn reply_poll(self, revents: u32) -> Result<()> {
        let arg = wire::PollOut {
            revents,
            padding: 0,
        };
        self.send(0, &[arg.as_bytes()])
    }

    pub fn reply_err(self, errno: Errno) -> Result<()> {
        self.send(-(errno as i32), &[])
    }

    fn reply_empty(self) -> Result<()> {
        self.send(0, &[])
    }
}

/// Callback table a session dispatches device requests into.
///
/// Callbacks run on the thread driving [`Session::process`] and must not
/// block; each one answers through the supplied [`Request`].
pub trait CuseOps {
    fn open(&mut self, req: Request<'_>, fi: FileInfo) -> Result<()>;
    fn release(&mut self, req: Request<'_>, fi: FileInfo) -> Result<()>;
    fn read(&mut self, req: Request<'_>, size: usize, offset: u64, fi: FileInfo) -> Result<()>;
    fn write(&mut self, req: Request<'_>, data: &[u8], offset: u64, fi: FileInfo) -> Result<()>;
    fn poll(&mut self, req: Request<'_>, fi: FileInfo, handle: Option<PollHandle>) -> Result<()>;
}

/// One registered synthetic character device.
///
/// The kernel finishes the registration only once the init handshake is
/// answered, which happens inside [`Session::process`]; put the descriptor
/// on an event loop promptly after opening.
pub struct Session {
    fd: OwnedFd,
    dev_info: Vec<u8>,
    initialized: bool,
    exited: bool,
}

impl Session {
    /// Register a synthetic character device named `name`.
    pub fn open(name: &str) -> Result<Self> {
        if name.is_empty() || name.contains(['/', '\0']) {
            return Err(CuseError::InvalidName(name.to_string()));
        }
        let raw = open(CUSE_PATH, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())
            .map_err(|errno| CuseError::DeviceOpen {
                path: CUSE_PATH,
                errno,
            })?;
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self::from_fd(fd, name))
    }

    /// Adopt a transport descriptor opened elsewhere, e.g. passed down by a
    /// supervisor.
    pub fn from_fd(fd: OwnedFd, name: &str) -> Self {
        let dev_info = format!("DEVNAME={name}\0").into_bytes();
        Session {
            fd,
            dev_info,
            initialized: false,
            exited: false,
        }
    }

    /// The descriptor to register with a readiness multiplexer.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// True once the kernel tore the device down.
    pub fn exited(&self) -> bool {
        self.exited
    }

    /// Pull one kernel request into `buf`. The kernel never splits or
    /// merges requests on this transport, so one successful read is one
    /// complete request.
    pub fn receive(&mut self, buf: &mut [u8]) -> Result<Received> {
        match read(self.fd.as_raw_fd(), buf) {
            Ok(0) => {
                self.exited = true;
                Ok(Received::Closed)
            }
            Ok(n) => Ok(Received::Data(n)),
            Err(Errno::ENODEV) => {
                // device unregistered underneath us
                self.exited = true;
                Ok(Received::Closed)
            }
            Err(Errno::EINTR) | Err(Errno::EAGAIN) | Err(Errno::ENOENT) => {
                Ok(Received::Interrupted)
            }
            Err(errno) => Err(CuseError::Sys(errno)),
        }
    }

    /// Parse one request previously pulled by [`Session::receive`] and
    /// dispatch it. The init handshake and teardown opcodes are handled
    /// here; device I/O goes through `ops`.
    pub fn process(&mut self, buf: &[u8], ops: &mut dyn CuseOps) -> Result<()> {
        let (header, body) = wire::InHeader::read_from_prefix(buf)
            .map_err(|_| CuseError::Truncated { got: buf.len() })?;
        if header.len as usize != buf.len() {
            return Err(CuseError::LengthMismatch {
                header: header.len,
                got: buf.len(),
            });
        }
        let req = Request {
            fd: self.fd.as_fd(),
            unique: header.unique,
        };
        if !self.initialized && header.opcode != op::CUSE_INIT {
            warn!(opcode = header.opcode, "request before init handshake");
            return req.reply_err(Errno::EIO);
        }
        match header.opcode {
            op::CUSE_INIT => {
                let unique = req.unique;
                drop(req);
                self.handle_init(unique, body)
            }
            op::OPEN => {
                let (arg, _) = wire::OpenIn::read_from_prefix(body)
                    .map_err(|_| CuseError::Truncated { got: buf.len() })?;
                ops.open(
                    req,
                    FileInfo {
                        fh: 0,
                        flags: arg.flags,
                    },
                )
            }
            op::RELEASE => {
                let (arg, _) = wire::ReleaseIn::read_from_prefix(body)
                    .map_err(|_| CuseError::Truncated { got: buf.len() })?;
                ops.release(
                    req,
                    FileInfo {
                        fh: arg.fh,
                        flags: arg.flags,
                    },
                )
            }
            op::READ => {
                let (arg, _) = wire::ReadIn::read_from_prefix(body)
                    .map_err(|_| CuseError::Truncated { got: buf.len() })?;
                ops.read(
                    req,
                    arg.size as usize,
                    arg.offset,
                    FileInfo {
                        fh: arg.fh,
                        flags: arg.flags,
                    },
                )
            }
            op::WRITE => {
                let (arg, rest) = wire::WriteIn::read_from_prefix(body)
                    .map_err(|_| CuseError::Truncated { got: buf.len() })?;
                let len = arg.size as usize;
                if rest.len() < len {
                    return Err(CuseError::Truncated { got: buf.len() });
                }
                ops.write(
                    req,
                    &rest[..len],
                    arg.offset,
                    FileInfo {
                        fh: arg.fh,
                        flags: 0,
                    },
                )
            }
            op::POLL => {
                let (arg, _) = wire::PollIn::read_from_prefix(body)
                    .map_err(|_| CuseError::Truncated { got: buf.len() })?;
                let handle = (arg.flags & wire::POLL_SCHEDULE_NOTIFY != 0)
                    .then_some(PollHandle { kh: arg.kh });
                ops.poll(
                    req,
                    FileInfo {
                        fh: arg.fh,
                        flags: 0,
                    },
                    handle,
                )
            }
            op::INTERRUPT => {
                // requests are answered synchronously, nothing to abort
                debug!(unique = header.unique, "interrupt ignored");
                Ok(())
            }
            op::DESTROY => {
                self.exited = true;
                req.reply_empty()
            }
            opcode => {
                debug!(opcode, unique = header.unique, "unsupported opcode");
                req.reply_err(Errno::ENOSYS)
            }
        }
    }

    /// Fire a retained poll wakeup. Consumes the handle; the kernel wakes
    /// the blocked poller at most once per token.
    pub fn notify_poll(&self, handle: PollHandle) -> Result<()> {
        let arg = wire::PollWakeupOut { kh: handle.kh };
        let header = wire::OutHeader {
            len: (size_of::<wire::OutHeader>() + size_of::<wire::PollWakeupOut>()) as u32,
            error: wire::NOTIFY_POLL,
            unique: 0,
        };
        writev(
            &self.fd,
            &[IoSlice::new(header.as_bytes()), IoSlice::new(arg.as_bytes())],
        )?;
        Ok(())
    }

    fn handle_init(&mut self, unique: u64, body: &[u8]) -> Result<()> {
        let req = Request {
            fd: self.fd.as_fd(),
            unique,
        };
        let (arg, _) = wire::CuseInitIn::read_from_prefix(body)
            .map_err(|_| CuseError::Truncated { got: body.len() })?;
        if arg.major != wire::KERNEL_MAJOR || arg.minor < wire::MIN_KERNEL_MINOR {
            let _ = req.reply_err(Errno::EPROTO);
            return Err(CuseError::ProtocolVersion {
                major: arg.major,
                minor: arg.minor,
            });
        }
        let out = wire::CuseInitOut {
            major: wire::KERNEL_MAJOR,
            minor: wire::KERNEL_MINOR,
            unused: 0,
            flags: 0,
            max_read: MAX_READ,
            max_write: MAX_WRITE,
            // zero asks the kernel for a dynamically allocated device number
            dev_major: 0,
            dev_minor: 0,
            spare: [0; 10],
        };
        req.send(0, &[out.as_bytes(), &self.dev_info])?;
        self.initialized = true;
        debug!(
            dev_info = %String::from_utf8_lossy(&self.dev_info),
            "session initialized"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use nix::unistd::write;

    fn transport_pair(name: &str) -> (Session, OwnedFd) {
        let (ours, theirs) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::empty(),
        )
        .unwrap();
        (Session::from_fd(ours, name), theirs)
    }

    fn push_request(kernel: &OwnedFd, opcode: u32, unique: u64, body: &[u8]) {
        let header = wire::InHeader {
            len: (size_of::<wire::InHeader>() + body.len()) as u32,
            opcode,
            unique,
            nodeid: 0,
            uid: 0,
            gid: 0,
            pid: 0,
            padding: 0,
        };
        let mut msg = header.as_bytes().to_vec();
        msg.extend_from_slice(body);
        write(kernel, &msg).unwrap();
    }

    fn pull_reply(kernel: &OwnedFd) -> (wire::OutHeader, Vec<u8>) {
        let mut buf = [0u8; 4096];
        let n = read(kernel, &mut buf).unwrap();
        let (header, rest) = wire::OutHeader::read_from_prefix(&buf[..n]).unwrap();
        assert_eq!(header.len as usize, n);
        (header, rest.to_vec())
    }

    fn init(session: &mut Session, kernel: &OwnedFd, ops: &mut dyn CuseOps) {
        let arg = wire::CuseInitIn {
            major: wire::KERNEL_MAJOR,
            minor: wire::KERNEL_MINOR,
            unused: 0,
            flags: 0,
        };
        push_request(kernel, op::CUSE_INIT, 1, arg.as_bytes());
        let mut buf = vec![0u8; RECV_BUF_LEN];
        let n = match session.receive(&mut buf).unwrap() {
            Received::Data(n) => n,
            other => panic!("expected a request, got {other:?}"),
        };
        session.process(&buf[..n], ops).unwrap();
    }

    #[derive(Default)]
    struct RecordingOps {
        opens: usize,
        releases: usize,
        written: Vec<u8>,
        read_reply: Vec<u8>,
        last_handle: Option<PollHandle>,
    }

    impl CuseOps for RecordingOps {
        fn open(&mut self, req: Request<'_>, _fi: FileInfo) -> Result<()> {
            self.opens += 1;
            req.reply_open(0, 0)
        }

        fn release(&mut self, req: Request<'_>, _fi: FileInfo) -> Result<()> {
            self.releases += 1;
            req.reply_data(&[])
        }

        fn read(&mut self, req: Request<'_>, size: usize, _off: u64, _fi: FileInfo) -> Result<()> {
            let len = size.min(self.read_reply.len());
            let data = self.read_reply[..len].to_vec();
            req.reply_data(&data)
        }

        fn write(&mut self, req: Request<'_>, data: &[u8], _off: u64, _fi: FileInfo) -> Result<()> {
            self.written.extend_from_slice(data);
            req.reply_write(data.len())
        }

        fn poll(&mut self, req: Request<'_>, _fi: FileInfo, handle: Option<PollHandle>) -> Result<()> {
            self.last_handle = handle;
            req.reply_poll(0)
        }
    }

    fn dispatch(session: &mut Session, kernel: &OwnedFd, ops: &mut dyn CuseOps) {
        let mut buf = vec![0u8; RECV_BUF_LEN];
        let n = match session.receive(&mut buf).unwrap() {
            Received::Data(n) => n,
            other => panic!("expected a request, got {other:?}"),
        };
        session.process(&buf[..n], ops).unwrap();
    }

    #[test]
    fn init_reply_carries_version_and_devname() {
        let (mut session, kernel) = transport_pair("tty-copy0");
        let mut ops = RecordingOps::default();
        init(&mut session, &kernel, &mut ops);

        let (header, body) = pull_reply(&kernel);
        assert_eq!(header.error, 0);
        assert_eq!(header.unique, 1);
        let (out, info) = wire::CuseInitOut::read_from_prefix(&body).unwrap();
        assert_eq!(out.major, wire::KERNEL_MAJOR);
        assert_eq!(out.minor, wire::KERNEL_MINOR);
        assert_eq!(info, b"DEVNAME=tty-copy0\0");
    }

    #[test]
    fn rejects_foreign_protocol_major() {
        let (mut session, kernel) = transport_pair("x");
        let arg = wire::CuseInitIn {
            major: 6,
            minor: 0,
            unused: 0,
            flags: 0,
        };
        push_request(&kernel, op::CUSE_INIT, 1, arg.as_bytes());
        let mut buf = vec![0u8; RECV_BUF_LEN];
        let n = match session.receive(&mut buf).unwrap() {
            Received::Data(n) => n,
            other => panic!("expected a request, got {other:?}"),
        };
        let err = session
            .process(&buf[..n], &mut RecordingOps::default())
            .unwrap_err();
        assert!(matches!(err, CuseError::ProtocolVersion { major: 6, .. }));
        let (header, _) = pull_reply(&kernel);
        assert_eq!(header.error, -(Errno::EPROTO as i32));
    }

    #[test]
    fn requests_before_init_are_refused() {
        let (mut session, kernel) = transport_pair("x");
        let arg = wire::OpenIn {
            flags: 0,
            open_flags: 0,
        };
        push_request(&kernel, op::OPEN, 7, arg.as_bytes());
        let mut ops = RecordingOps::default();
        dispatch(&mut session, &kernel, &mut ops);
        assert_eq!(ops.opens, 0);
        let (header, _) = pull_reply(&kernel);
        assert_eq!(header.error, -(Errno::EIO as i32));
    }

    #[test]
    fn open_and_release_round_trip() {
        let (mut session, kernel) = transport_pair("x");
        let mut ops = RecordingOps::default();
        init(&mut session, &kernel, &mut ops);
        pull_reply(&kernel);

        let arg = wire::OpenIn {
            flags: 0,
            open_flags: 0,
        };
        push_request(&kernel, op::OPEN, 2, arg.as_bytes());
        dispatch(&mut session, &kernel, &mut ops);
        assert_eq!(ops.opens, 1);
        let (header, body) = pull_reply(&kernel);
        assert_eq!(header.unique, 2);
        let out = wire::OpenOut::read_from_bytes(&body).unwrap();
        assert_eq!(out.fh, 0);

        let arg = wire::ReleaseIn {
            fh: 0,
            flags: 0,
            release_flags: 0,
            lock_owner: 0,
        };
        push_request(&kernel, op::RELEASE, 3, arg.as_bytes());
        dispatch(&mut session, &kernel, &mut ops);
        assert_eq!(ops.releases, 1);
        let (header, body) = pull_reply(&kernel);
        assert_eq!(header.error, 0);
        assert!(body.is_empty());
    }

    #[test]
    fn write_payload_reaches_the_callback() {
        let (mut session, kernel) = transport_pair("x");
        let mut ops = RecordingOps::default();
        init(&mut session, &kernel, &mut ops);
        pull_reply(&kernel);

        let arg = wire::WriteIn {
            fh: 0,
            offset: 0,
            size: 5,
            write_flags: 0,
            lock_owner: 0,
            flags: 0,
            padding: 0,
        };
        let mut body = arg.as_bytes().to_vec();
        body.extend_from_slice(b"hello");
        push_request(&kernel, op::WRITE, 4, &body);
        dispatch(&mut session, &kernel, &mut ops);
        assert_eq!(ops.written, b"hello");
        let (header, body) = pull_reply(&kernel);
        assert_eq!(header.error, 0);
        let out = wire::WriteOut::read_from_bytes(&body).unwrap();
        assert_eq!(out.size, 5);
    }

    #[test]
    fn read_reply_returns_data() {
        let (mut session, kernel) = transport_pair("x");
        let mut ops = RecordingOps {
            read_reply: b"stream".to_vec(),
            ..Default::default()
        };
        init(&mut session, &kernel, &mut ops);
        pull_reply(&kernel);

        let arg = wire::ReadIn {
            fh: 0,
            offset: 0,
            size: 4,
            read_flags: 0,
            lock_owner: 0,
            flags: 0,
            padding: 0,
        };
        push_request(&kernel, op::READ, 5, arg.as_bytes());
        dispatch(&mut session, &kernel, &mut ops);
        let (header, body) = pull_reply(&kernel);
        assert_eq!(header.error, 0);
        assert_eq!(body, b"stre");
    }

    #[test]
    fn poll_handle_follows_the_schedule_flag() {
        let (mut session, kernel) = transport_pair("x");
        let mut ops = RecordingOps::default();
        init(&mut session, &kernel, &mut ops);
        pull_reply(&kernel);

        let arg = wire::PollIn {
            fh: 0,
            kh: 99,
            flags: wire::POLL_SCHEDULE_NOTIFY,
            events: wire::POLLIN,
        };
        push_request(&kernel, op::POLL, 6, arg.as_bytes());
        dispatch(&mut session, &kernel, &mut ops);
        pull_reply(&kernel);
        assert_eq!(ops.last_handle.take().map(|h| h.kh), Some(99));

        let arg = wire::PollIn {
            fh: 0,
            kh: 0,
            flags: 0,
            events: wire::POLLIN,
        };
        push_request(&kernel, op::POLL, 7, arg.as_bytes());
        dispatch(&mut session, &kernel, &mut ops);
        pull_reply(&kernel);
        assert!(ops.last_handle.is_none());
    }

    #[test]
    fn poll_wakeup_is_a_zero_unique_notify() {
        let (session, kernel) = transport_pair("x");
        session.notify_poll(PollHandle { kh: 42 }).unwrap();
        let (header, body) = pull_reply(&kernel);
        assert_eq!(header.unique, 0);
        assert_eq!(header.error, wire::NOTIFY_POLL);
        let out = wire::PollWakeupOut::read_from_bytes(&body).unwrap();
        assert_eq!(out.kh, 42);
    }

    #[test]
    fn destroy_marks_the_session_exited() {
        let (mut session, kernel) = transport_pair("x");
        let mut ops = RecordingOps::default();
        init(&mut session, &kernel, &mut ops);
        pull_reply(&kernel);

        push_request(&kernel, op::DESTROY, 8, &[]);
        dispatch(&mut session, &kernel, &mut ops);
        assert!(session.exited());
    }

    #[test]
    fn closed_transport_reports_session_end() {
        let (mut session, kernel) = transport_pair("x");
        drop(kernel);
        let mut buf = vec![0u8; RECV_BUF_LEN];
        assert_eq!(session.receive(&mut buf).unwrap(), Received::Closed);
        assert!(session.exited());
    }

    #[test]
    fn truncated_request_is_an_error() {
        let (mut session, _kernel) = transport_pair("x");
        let err = session
            .process(&[0u8; 7], &mut RecordingOps::default())
            .unwrap_err();
        assert!(matches!(err, CuseError::Truncated { got: 7 }));
    }

    #[test]
    fn invalid_names_are_rejected() {
        assert!(matches!(
            Session::open(""),
            Err(CuseError::InvalidName(_))
        ));
        assert!(matches!(
            Session::open("a/b"),
            Err(CuseError::InvalidName(_))
        ));
    }
}
