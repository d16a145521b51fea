// Licensed under the Apache-2.0 license

//! The command record a caller hands to the device file.

use crate::error::{Error, Result};
use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandKind {
    /// Copy through the staging buffer from/to a BAR.
    Register = 0,
    /// Move the buffer with the SGDMA engine.
    Stream = 1,
}

impl TryFrom<u32> for CommandKind {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(CommandKind::Register),
            1 => Ok(CommandKind::Stream),
            other => Err(Error::BadCommand(format!("unknown command word {other}"))),
        }
    }
}

/// A decoded request. The buffer and direction come from the call it is
/// passed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferCommand {
    pub kind: CommandKind,
    pub window: u8,
    pub device_offset: u32,
}

impl TransferCommand {
    pub fn register(window: u8, device_offset: u32) -> Self {
        Self {
            kind: CommandKind::Register,
            window,
            device_offset,
        }
    }

    /// Stream commands ignore the window and offset; the engine's target is
    /// fixed by the bitstream.
    pub fn stream() -> Self {
        Self {
            kind: CommandKind::Stream,
            window: 0,
            device_offset: 0,
        }
    }
}

/// Wire layout of the command record, as a 64-bit C compiler lays it out.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct IoCmd {
    pub command: U32,
    pub window: u8,
    reserved0: [u8; 3],
    pub device_offset: U32,
    reserved1: [u8; 4],
    pub user_addr: U64,
}

impl IoCmd {
    pub const SIZE: usize = core::mem::size_of::<IoCmd>();

    pub fn new(cmd: &TransferCommand, user_addr: u64) -> Self {
        Self {
            command: U32::new(cmd.kind as u32),
            window: cmd.window,
            reserved0: [0; 3],
            device_offset: U32::new(cmd.device_offset),
            reserved1: [0; 4],
            user_addr: U64::new(user_addr),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (cmd, _) = IoCmd::read_from_prefix(bytes).map_err(|_| {
            Error::BadCommand(format!(
                "command record is {} bytes, need {}",
                bytes.len(),
                Self::SIZE
            ))
        })?;
        Ok(cmd)
    }

    /// Checks the buffer named by the record against the one supplied with
    /// the call. A zero address means the record leaves it to the call.
    pub fn check_user_addr(&self, buf_addr: u64) -> Result<()> {
        let user_addr = self.user_addr.get();
        if user_addr != 0 && user_addr != buf_addr {
            return Err(Error::BadCommand(format!(
                "record names buffer {user_addr:#x} but {buf_addr:#x} was passed"
            )));
        }
        Ok(())
    }
}

impl TryFrom<&IoCmd> for TransferCommand {
    type Error = Error;

    fn try_from(cmd: &IoCmd) -> Result<Self> {
        Ok(TransferCommand {
            kind: CommandKind::try_from(cmd.command.get())?,
            window: cmd.window,
            device_offset: cmd.device_offset.get(),
        })
    }
}
