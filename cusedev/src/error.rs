use nix::errno::Errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CuseError {
    #[error("failed to open {path}: {errno}")]
    DeviceOpen { path: &'static str, errno: Errno },

    #[error("invalid device name {0:?}")]
    InvalidName(String),

    #[error("truncated request of {got} bytes")]
    Truncated { got: usize },

    #[error("request header claims {header} bytes but {got} were received")]
    LengthMismatch { header: u32, got: usize },

    #[error("kernel speaks unsupported protocol version {major}.{minor}")]
    ProtocolVersion { major: u32, minor: u32 },

    #[error("system error: {0}")]
    Sys(#[from] Errno),
}

pub type Result<T> = std::result::Result<T, CuseError>;
