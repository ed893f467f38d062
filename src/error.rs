use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures the caller can plausibly recover from.
///
/// Contract violations (registering from the wrong thread, constructing a
/// second loop on one thread) are not represented here; they panic.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("object {0} is already registered")]
    AlreadyRegistered(i32),

    #[error("object {0} is not registered")]
    NotRegistered(i32),

    #[error("listener is already bound")]
    AlreadyBound,

    #[error("invalid address {0}")]
    InvalidAddress(String),

    #[error("operation in wrong state: {0}")]
    WrongState(&'static str),
}
