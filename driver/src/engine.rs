// Licensed under the Apache-2.0 license

use crate::bar::Region;
use crate::error::{Error, Result};
use crate::regs::*;
use crate::sg::DmaDirection;
use log::{debug, error};
use piecomm_config::EngineConfig;
use poll_common::{poll_with_backoff, PollError};
use std::time::Duration;
use tock_registers::LocalRegisterCopy;

pub type Status = LocalRegisterCopy<u32, SgdmaStatus::Register>;

/// One modular SGDMA dispatcher: its CSR block and descriptor port.
pub struct Engine<'a> {
    region: &'a Region,
    cfg: EngineConfig,
    direction: DmaDirection,
}

impl<'a> Engine<'a> {
    pub fn new(region: &'a Region, cfg: EngineConfig, direction: DmaDirection) -> Self {
        Self {
            region,
            cfg,
            direction,
        }
    }

    pub fn status(&self) -> Result<Status> {
        let raw = self.region.read32(self.cfg.csr_offset + SGDMA_CSR_STATUS)?;
        Ok(LocalRegisterCopy::new(raw))
    }

    pub fn is_busy(&self) -> Result<bool> {
        Ok(self.status()?.is_set(SgdmaStatus::BUSY))
    }

    /// Descriptors queued in this engine's FIFO. A device-to-host engine
    /// reports through the write master's half of the register, a
    /// host-to-device engine through the read master's.
    pub fn fill_level(&self) -> Result<u32> {
        let raw = self
            .region
            .read32(self.cfg.csr_offset + SGDMA_CSR_FILL_LEVEL)?;
        let fill = LocalRegisterCopy::<u32, SgdmaFillLevel::Register>::new(raw);
        Ok(match self.direction {
            DmaDirection::FromDevice => fill.read(SgdmaFillLevel::WRITE_FILL_LEVEL),
            DmaDirection::ToDevice => fill.read(SgdmaFillLevel::READ_FILL_LEVEL),
        })
    }

    /// Descriptors written but not yet retired: the queued ones plus the one
    /// being executed.
    pub fn in_flight(&self) -> Result<u32> {
        let busy = self.is_busy()?;
        Ok(self.fill_level()? + u32::from(busy))
    }

    pub fn is_idle(&self) -> Result<bool> {
        Ok(self.in_flight()? == 0)
    }

    /// Queues one descriptor. The control word goes last since its GO bit
    /// hands the descriptor to the dispatcher.
    pub fn write_descriptor(&self, avalon_address: u32, len: u32) -> Result<()> {
        let base = self.cfg.descriptor_offset;
        let (read_address, write_address) = match self.direction {
            DmaDirection::FromDevice => (0, avalon_address),
            DmaDirection::ToDevice => (avalon_address, 0),
        };
        let mut control = LocalRegisterCopy::<u32, DescriptorControl::Register>::new(0);
        control.modify(DescriptorControl::GO::SET + DescriptorControl::END_ON_EOP::SET);

        self.region.write32(base + DESCRIPTOR_READ_ADDRESS, read_address)?;
        self.region.write32(base + DESCRIPTOR_WRITE_ADDRESS, write_address)?;
        self.region.write32(base + DESCRIPTOR_LENGTH, len)?;
        self.region.write32(base + DESCRIPTOR_CONTROL, control.get())?;
        Ok(())
    }

    /// Resets the dispatcher, dropping any queued descriptors, and waits for
    /// the reset to finish.
    pub fn reset(&self, timeout: Duration, interval: Duration) -> Result<()> {
        let mut control = LocalRegisterCopy::<u32, SgdmaControl::Register>::new(0);
        control.modify(SgdmaControl::RESET_DISPATCHER::SET);
        self.region.write32(self.cfg.csr_offset + SGDMA_CSR_CONTROL, control.get())?;

        let mut last = 0;
        let result = poll_with_backoff(timeout, interval, |_| {
            let status = self.status()?;
            last = status.get();
            Ok::<_, Error>((!status.is_set(SgdmaStatus::RESETTING)).then_some(()))
        });
        match result {
            Ok(()) => {
                debug!("SGDMA engine at {:#x} reset", self.cfg.csr_offset);
                Ok(())
            }
            Err(PollError::Failed(e)) => Err(e),
            Err(PollError::Timeout { waited, .. }) => {
                error!(
                    "SGDMA engine at {:#x} stuck in reset (status {:#x})",
                    self.cfg.csr_offset, last
                );
                Err(Error::DeviceTimeout {
                    status: last,
                    waited,
                })
            }
        }
    }
}
