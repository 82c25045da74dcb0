use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RingError {
    #[error("ring capacity must be nonzero")]
    ZeroCapacity,
}
