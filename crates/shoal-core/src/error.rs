//! Error types for Shoal

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid hash mask {0:#x}: must be 2^k - 1 with k >= 1")]
    InvalidMask(u64),

    #[error("mask {new:#x} does not grow the current mask {current:#x}")]
    MaskNotGrowing { current: u64, new: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid peer address '{0}': expected host:port")]
    InvalidAddress(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
