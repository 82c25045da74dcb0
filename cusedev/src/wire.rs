//! Kernel ABI of the userspace-character-device transport.
//!
//! Layouts follow `<linux/fuse.h>`. The transport is local, so fields are
//! native-endian integers read and written in place; every struct is free
//! of implicit padding so the zerocopy derives apply.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Protocol major version spoken on the transport.
pub const KERNEL_MAJOR: u32 = 7;
/// Minor version advertised in the init reply.
pub const KERNEL_MINOR: u32 = 31;
/// Oldest kernel minor the init handshake accepts.
pub const MIN_KERNEL_MINOR: u32 = 11;

pub mod op {
    pub const OPEN: u32 = 14;
    pub const READ: u32 = 15;
    pub const WRITE: u32 = 16;
    pub const RELEASE: u32 = 18;
    pub const INTERRUPT: u32 = 36;
    pub const DESTROY: u32 = 38;
    pub const POLL: u32 = 40;
    pub const CUSE_INIT: u32 = 4096;
}

/// Notification code for a poll wakeup, carried in [`OutHeader::error`]
/// with a zero `unique`.
pub const NOTIFY_POLL: i32 = 1;

/// Kernel wants a wakeup notification once readiness changes.
pub const POLL_SCHEDULE_NOTIFY: u32 = 1 << 0;

/// Readable-ready bit in [`PollOut::revents`].
pub const POLLIN: u32 = 0x0001;

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct InHeader {
    pub len: u32,
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub padding: u32,
}

const _: () = {
    assert!(core::mem::size_of::<InHeader>() == 40);
};

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct OutHeader {
    pub len: u32,
    pub error: i32,
    pub unique: u64,
}

const _: () = {
    assert!(core::mem::size_of::<OutHeader>() == 16);
};

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct CuseInitIn {
    pub major: u32,
    pub minor: u32,
    pub unused: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct CuseInitOut {
    pub major: u32,
    pub minor: u32,
    pub unused: u32,
    pub flags: u32,
    pub max_read: u32,
    pub max_write: u32,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub spare: [u32; 10],
}

const _: () = {
    assert!(core::mem::size_of::<CuseInitIn>() == 16);
    assert!(core::mem::size_of::<CuseInitOut>() == 72);
};

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct OpenIn {
    pub flags: u32,
    pub open_flags: u32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct OpenOut {
    pub fh: u64,
    pub open_flags: u32,
    pub padding: u32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ReleaseIn {
    pub fh: u64,
    pub flags: u32,
    pub release_flags: u32,
    pub lock_owner: u64,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct ReadIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub read_flags: u32,
    pub lock_owner: u64,
    pub flags: u32,
    pub padding: u32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct WriteIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub write_flags: u32,
    pub lock_owner: u64,
    pub flags: u32,
    pub padding: u32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct WriteOut {
    pub size: u32,
    pub padding: u32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PollIn {
    pub fh: u64,
    pub kh: u64,
    pub flags: u32,
    pub events: u32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PollOut {
    pub revents: u32,
    pub padding: u32,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PollWakeupOut {
    pub kh: u64,
}

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct InterruptIn {
    pub unique: u64,
}

const _: () = {
    assert!(core::mem::size_of::<OpenIn>() == 8);
    assert!(core::mem::size_of::<OpenOut>() == 16);
    assert!(core::mem::size_of::<ReleaseIn>() == 24);
    assert!(core::mem::size_of::<ReadIn>() == 40);
    assert!(core::mem::size_of::<WriteIn>() == 40);
    assert!(core::mem::size_of::<WriteOut>() == 8);
    assert!(core::mem::size_of::<PollIn>() == 24);
    assert!(core::mem::size_of::<PollOut>() == 8);
    assert!(core::mem::size_of::<PollWakeupOut>() == 8);
    assert!(core::mem::size_of::<InterruptIn>() == 8);
};
