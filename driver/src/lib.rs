// Licensed under the Apache-2.0 license

//! Host-side access to an Altera PCIe FPGA card.
//!
//! Small transfers are copied to and from the card's BARs through a staging
//! buffer. Stream transfers pin the caller's buffer and hand it to the
//! card's scatter-gather DMA engine through the PCIe address translation
//! table. Both paths are serialized by a single device lock.

pub mod att;
pub mod bar;
pub mod command;
pub mod completion;
mod device;
mod dma;
pub mod engine;
pub mod error;
#[cfg(target_os = "linux")]
pub mod linux;
mod register;
pub mod regs;
pub mod sg;

pub use bar::{BarIo, BarTable, Region};
pub use command::{CommandKind, IoCmd, TransferCommand};
pub use completion::{Completion, CompletionSignal, PollingCompletion, SignaledCompletion};
pub use device::{FpgaDevice, OpenFlags, Session};
pub use error::{Error, Result};
pub use piecomm_config::{DeviceConfig, EngineConfig};
pub use sg::{DmaDirection, DmaMapper, PagePinner, PageRange, PinnedPage, SgEntry};
