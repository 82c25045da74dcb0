//! devtee fans the read stream of one character device out to N synthetic
//! character devices, each serving an independent copy to its readers.
//! Writes to any synthetic device pass through to the source unchanged.
//!
//! One thread, one epoll instance: the source descriptor and every device
//! session descriptor are multiplexed together, the source is drained into
//! a shared [`fanring::Ring`], and per-device cursors pace each reader.

use nix::errno::Errno;
use thiserror::Error;

pub mod config;
pub mod device;
pub mod engine;
pub mod source;

pub use config::Config;
pub use engine::Engine;

#[derive(Error, Debug)]
pub enum TeeError {
    #[error("{0}")]
    Config(String),

    #[error("ring setup failed: {0}")]
    Ring(#[from] fanring::RingError),

    #[error("device session error: {0}")]
    Cuse(#[from] cusedev::CuseError),

    #[error("system error: {0}")]
    Sys(#[from] Errno),
}

pub type Result<T> = std::result::Result<T, TeeError>;
