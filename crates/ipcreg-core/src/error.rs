//! Error types for ipcreg

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The shared segment could not be created, opened or mapped.
    #[error("shared memory segment unavailable: {0}")]
    SegmentUnavailable(String),

    /// Every slot was probed without finding the key or an empty slot.
    #[error("registry table full")]
    TableFull,

    #[error("name not found")]
    NotFound,

    /// The GPU runtime failed to produce an IPC handle.
    #[error("driver error: {0}")]
    Driver(String),

    #[error("lookup timed out")]
    TimedOut,
}

impl Error {
    pub(crate) fn shm(context: &str, e: impl std::fmt::Display) -> Self {
        Error::SegmentUnavailable(format!("{}: {}", context, e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
