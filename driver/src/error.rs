// Licensed under the Apache-2.0 license

use std::time::Duration;
use thiserror::Error;

/// Errors returned by register and DMA operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("device is busy")]
    WouldBlock,
    #[error("interrupted while waiting for the device lock")]
    Interrupted,
    #[error("window {index} is not mapped")]
    InvalidWindow { index: u8 },
    #[error(
        "access of {len} bytes at offset {offset:#x} is outside window {window} ({window_len:#x} bytes)"
    )]
    OutOfRange {
        window: u8,
        offset: u64,
        len: usize,
        window_len: usize,
    },
    #[error("register offset {offset:#x} is not 32-bit aligned")]
    Misaligned { offset: u64 },
    #[error("pinned only {pinned} pages when {expected} were needed")]
    ShortPin { pinned: usize, expected: usize },
    #[error("bus address {bus_address:#x} needs 64-bit addressing")]
    AddressTooWide { bus_address: u64 },
    #[error("descriptor FIFO still holds {fill_level} descriptors after {waited:?}")]
    FifoStalled { fill_level: u32, waited: Duration },
    #[error("SGDMA engine still busy after {waited:?} (status {status:#x})")]
    DeviceTimeout { status: u32, waited: Duration },
    #[error("device needs recovery after a previous timeout")]
    NeedsRecovery,
    #[error("no host-to-device DMA engine configured")]
    NoEngine,
    #[error("bad command: {0}")]
    BadCommand(String),
    #[error("session is not open")]
    NotOpen,
    #[error("device is bound to process {owner}")]
    NotOwner { owner: u32 },
    #[error("invalid configuration: {0:#}")]
    Config(anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Timeouts leave the engine in an unknown state; the device has to be
    /// recovered before it is used for DMA again.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::FifoStalled { .. } | Error::DeviceTimeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
