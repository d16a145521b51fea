// Licensed under the Apache-2.0 license

//! Coalescing scatter-gather entries into ATT windows, and programming the
//! ATT rows and SGDMA descriptors that describe them.
//!
//! The PCIe TX port gives the FPGA a narrow Avalon view of host memory: ATT
//! row `k` maps Avalon addresses `[tx_port + k * window, tx_port + (k + 1) *
//! window)` onto the host window whose base is stored in the row. Each
//! descriptor must therefore stay inside one window, and a row can only be
//! rewritten once the descriptor using it has retired.

use crate::bar::Region;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::regs::*;
use crate::sg::SgEntry;
use log::{debug, warn};
use piecomm_config::DeviceConfig;
use poll_common::{poll_with_backoff, PollError};
use std::time::Duration;
use tock_registers::LocalRegisterCopy;

/// Bus-contiguous bytes inside a single ATT window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoalescedRun {
    pub bus_address: u64,
    pub len: u64,
}

/// Merges `entries` into the fewest runs that are bus-contiguous and do not
/// cross a `window_size` boundary. Entries that cross a boundary themselves
/// are split.
pub fn coalesce(entries: &[SgEntry], window_size: u64) -> Vec<CoalescedRun> {
    let offset_mask = window_size - 1;
    let mut runs = Vec::new();
    let mut current: Option<CoalescedRun> = None;

    for entry in entries {
        let mut addr = entry.bus_address;
        let mut remaining = entry.len;
        while remaining > 0 {
            let piece = remaining.min(window_size - (addr & offset_mask));
            match current.as_mut() {
                Some(run)
                    if run.bus_address + run.len == addr
                        && (run.bus_address & !offset_mask) == (addr & !offset_mask) =>
                {
                    run.len += piece;
                }
                _ => {
                    runs.extend(current.take());
                    current = Some(CoalescedRun {
                        bus_address: addr,
                        len: piece,
                    });
                }
            }
            addr += piece;
            remaining -= piece;
        }
    }
    runs.extend(current);
    runs
}

/// Writes one ATT row and one descriptor per run, cycling through the ATT.
pub struct DescriptorWriter<'a> {
    config: &'a DeviceConfig,
    cra: &'a Region,
    engine: &'a Engine<'a>,
    use_64bit: bool,
    written: u64,
}

impl<'a> DescriptorWriter<'a> {
    pub fn new(
        config: &'a DeviceConfig,
        cra: &'a Region,
        engine: &'a Engine<'a>,
        use_64bit: bool,
    ) -> Self {
        Self {
            config,
            cra,
            engine,
            use_64bit,
            written: 0,
        }
    }

    pub fn runs_written(&self) -> u64 {
        self.written
    }

    /// Waits until the descriptor FIFO has room, and, once the ATT has
    /// wrapped, until the run that last used the next row has retired.
    fn wait_for_room(&self) -> Result<()> {
        let depth = self.config.descriptor_fifo_depth;
        let rows = self.config.att_entries;
        let reusing_row = self.written >= u64::from(rows);
        let timeout = Duration::from_millis(self.config.fifo_timeout_ms);
        let interval = Duration::from_micros(self.config.poll_interval_us);

        let mut last_fill = 0;
        let mut warned = false;
        let result = poll_with_backoff(timeout, interval, |backoff| {
            let fill = self.engine.fill_level()?;
            last_fill = fill;
            let mut ready = fill < depth;
            if ready && reusing_row {
                let busy = self.engine.is_busy()?;
                ready = fill + u32::from(busy) < rows;
            }
            if !ready && backoff.is_sleeping() && !warned {
                warn!(
                    "Descriptor FIFO still at {} after {} polls, run {}",
                    fill,
                    backoff.attempts(),
                    self.written
                );
                warned = true;
            }
            Ok::<_, Error>(ready.then_some(()))
        });
        match result {
            Ok(()) => Ok(()),
            Err(PollError::Failed(e)) => Err(e),
            Err(PollError::Timeout { waited, attempts }) => {
                debug!("Gave up on descriptor FIFO after {} polls", attempts);
                Err(Error::FifoStalled {
                    fill_level: last_fill,
                    waited,
                })
            }
        }
    }

    pub fn write_run(&mut self, run: &CoalescedRun) -> Result<()> {
        let window = self.config.window_size;
        let offset_mask = self.config.window_offset_mask();
        let window_base = run.bus_address & !offset_mask;
        if !self.use_64bit && window_base > u64::from(u32::MAX) {
            return Err(Error::AddressTooWide {
                bus_address: run.bus_address,
            });
        }

        self.wait_for_room()?;

        let slot = (self.written % u64::from(self.config.att_entries)) as u32;
        let row = self.config.att_row_offset(slot).ok_or(Error::OutOfRange {
            window: self.cra.index(),
            offset: u64::from(slot) * u64::from(ATT_ENTRY_STRIDE),
            len: ATT_ENTRY_STRIDE as usize,
            window_len: self.cra.len(),
        })?;
        let mut low = LocalRegisterCopy::<u32, AttEntryLow::Register>::new(window_base as u32);
        if self.use_64bit {
            low.modify(AttEntryLow::ADDRESS_SPACE::Bits64);
            self.cra.write32(row + ATT_ENTRY_LOW, low.get())?;
            self.cra.write32(row + ATT_ENTRY_HIGH, (window_base >> 32) as u32)?;
        } else {
            self.cra.write32(row + ATT_ENTRY_LOW, low.get())?;
        }

        let avalon_address = u64::from(self.config.tx_port_avalon_offset)
            + u64::from(slot) * window
            + (run.bus_address & offset_mask);
        debug!(
            "Run {}: ATT row {} -> {:#x}, descriptor {:#x} len {:#x}",
            self.written, slot, window_base, avalon_address, run.len
        );
        self.engine.write_descriptor(avalon_address as u32, run.len as u32)?;
        self.written += 1;
        Ok(())
    }
}
