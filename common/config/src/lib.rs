// Licensed under the Apache-2.0 license

//! Tunables and register-map constants for the PCIe FPGA card.
//!
//! The defaults match the Altera Qsys design the driver was written for:
//! the PCIe hard IP's control/register access (CRA) slave and the
//! scatter-gather DMA engine both sit behind BAR2.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Fixed register offsets that are part of the hardware contract.
pub mod regs {
    /// Number of BARs the card exposes to the driver.
    pub const NUM_BARS: usize = 3;

    /// Bytes per address translation table row (`low32`, `high32`).
    pub const ATT_ENTRY_STRIDE: u32 = 8;
    pub const ATT_ENTRY_LOW: u32 = 0x0;
    pub const ATT_ENTRY_HIGH: u32 = 0x4;

    /// SGDMA control/status register block.
    pub const SGDMA_CSR_STATUS: u32 = 0x0;
    pub const SGDMA_CSR_CONTROL: u32 = 0x4;
    /// Read fill level in the low half-word, write fill level at `+0xA`.
    pub const SGDMA_CSR_FILL_LEVEL: u32 = 0x8;
    pub const SGDMA_CSR_LEN: u32 = 0x20;

    /// SGDMA descriptor slave port.
    pub const DESCRIPTOR_READ_ADDRESS: u32 = 0x0;
    pub const DESCRIPTOR_WRITE_ADDRESS: u32 = 0x4;
    pub const DESCRIPTOR_LENGTH: u32 = 0x8;
    pub const DESCRIPTOR_CONTROL: u32 = 0xC;
    pub const DESCRIPTOR_LEN: u32 = 0x10;
}

/// Location of one SGDMA engine inside the SGDMA BAR.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub csr_offset: u32,
    pub descriptor_offset: u32,
}

/// Everything the driver needs to know about one card.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    pub vendor_id: u16,
    pub device_id: u16,

    pub page_size: usize,
    /// Capacity of the register-path staging buffer.
    pub staging_size: usize,

    /// Span of host memory reachable through one ATT row.
    pub window_size: u64,
    pub att_entries: u32,
    pub descriptor_fifo_depth: u32,

    pub cra_bar: u8,
    pub cra_offset: u32,
    pub att_offset: u32,
    /// Avalon address at which the PCIe TX port (and so ATT row 0) starts.
    pub tx_port_avalon_offset: u32,

    pub sgdma_bar: u8,
    /// Streaming-to-memory engine, device to host.
    pub rx_engine: EngineConfig,
    /// Memory-to-streaming engine, host to device. Not every bitstream has one.
    pub tx_engine: Option<EngineConfig>,

    pub fifo_timeout_ms: u64,
    pub completion_timeout_ms: u64,
    pub poll_interval_us: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            vendor_id: 0x1172,
            device_id: 0xbb4e,
            page_size: 4096,
            staging_size: 4096,
            window_size: 0x10_0000,
            att_entries: 16,
            descriptor_fifo_depth: 32,
            cra_bar: 2,
            cra_offset: 0,
            att_offset: 0x1000,
            tx_port_avalon_offset: 0,
            sgdma_bar: 2,
            rx_engine: EngineConfig {
                csr_offset: 0x4000,
                descriptor_offset: 0x4020,
            },
            tx_engine: Some(EngineConfig {
                csr_offset: 0x4040,
                descriptor_offset: 0x4060,
            }),
            fifo_timeout_ms: 1000,
            completion_timeout_ms: 5000,
            poll_interval_us: 100,
        }
    }
}

impl DeviceConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: DeviceConfig = toml::from_str(s).context("failed to parse device config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&s).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() {
            bail!("page_size {:#x} is not a power of two", self.page_size);
        }
        if !self.window_size.is_power_of_two() {
            bail!("window_size {:#x} is not a power of two", self.window_size);
        }
        if self.window_size < self.page_size as u64 {
            bail!(
                "window_size {:#x} is smaller than page_size {:#x}",
                self.window_size,
                self.page_size
            );
        }
        if self.window_size > u64::from(u32::MAX) {
            bail!(
                "window_size {:#x} does not fit the Avalon address space",
                self.window_size
            );
        }
        if self.staging_size == 0 {
            bail!("staging_size must be non-zero");
        }
        if self.att_entries == 0 || self.descriptor_fifo_depth == 0 {
            bail!("att_entries and descriptor_fifo_depth must be non-zero");
        }
        let avalon_span = u64::from(self.att_entries) * self.window_size
            + u64::from(self.tx_port_avalon_offset);
        if avalon_span > 1 << 32 {
            bail!(
                "{} ATT rows of {:#x} bytes overflow the Avalon address space",
                self.att_entries,
                self.window_size
            );
        }
        if usize::from(self.cra_bar) >= regs::NUM_BARS
            || usize::from(self.sgdma_bar) >= regs::NUM_BARS
        {
            bail!("BAR index out of range");
        }
        if self.att_row_offset(self.att_entries).is_none() {
            bail!(
                "{} ATT rows at {:#x} + {:#x} overflow the CRA BAR offset",
                self.att_entries,
                self.cra_offset,
                self.att_offset
            );
        }
        let engines = std::iter::once(("rx", &self.rx_engine))
            .chain(self.tx_engine.as_ref().map(|tx| ("tx", tx)));
        for (name, engine) in engines {
            if engine.csr_offset.checked_add(regs::SGDMA_CSR_LEN).is_none()
                || engine
                    .descriptor_offset
                    .checked_add(regs::DESCRIPTOR_LEN)
                    .is_none()
            {
                bail!("{} engine registers overflow the SGDMA BAR offset", name);
            }
        }
        Ok(())
    }

    /// Mask selecting the offset within one ATT window.
    pub fn window_offset_mask(&self) -> u64 {
        self.window_size - 1
    }

    /// Byte offset of ATT row `slot` within the CRA BAR, or `None` if it
    /// does not fit in 32 bits. Every row below `att_entries` of a validated
    /// config fits.
    pub fn att_row_offset(&self, slot: u32) -> Option<u32> {
        regs::ATT_ENTRY_STRIDE
            .checked_mul(slot)?
            .checked_add(self.att_offset)?
            .checked_add(self.cra_offset)
    }
}
