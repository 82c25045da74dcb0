//! Minimal character-device-in-userspace (CUSE) sessions.
//!
//! Opening a [`Session`] registers one synthetic character device with the
//! kernel through `/dev/cuse`; the kernel then delivers one request per
//! descriptor read, and the session dispatches each into a [`CuseOps`]
//! callback table. The receive/dispatch split keeps the descriptor usable
//! from any readiness-polling loop, and replies go out through one-shot
//! [`Request`] handles so every kernel request is answered exactly once.
//!
//! Only the opcodes a plain character device needs are spoken: init, open,
//! release, read, write, poll (with wakeup notification), interrupt and
//! destroy. Everything else is answered with `ENOSYS`.

pub mod error;
pub mod session;
pub mod wire;

pub use error::{CuseError, Result};
pub use session::{CuseOps, FileInfo, PollHandle, Received, Request, Session, RECV_BUF_LEN};
