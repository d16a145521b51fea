// Licensed under the Apache-2.0 license

//! The stream path: pin, map, program the ATT and descriptors, wait for the
//! engine, then release. Runs entirely under the device lock.

use crate::att::{coalesce, DescriptorWriter};
use crate::bar::BarTable;
use crate::completion::Completion;
use crate::device::DeviceState;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::sg::{DmaDirection, DmaMapper, MappedSg, PagePinner, PageRange, PinnedBuffer};
use log::{debug, error};
use piecomm_config::DeviceConfig;
use std::time::Duration;

pub(crate) struct DmaContext<'a> {
    pub config: &'a DeviceConfig,
    pub bars: &'a BarTable,
    pub pinner: &'a dyn PagePinner,
    pub mapper: &'a dyn DmaMapper,
    pub completion: &'a dyn Completion,
}

impl<'a> DmaContext<'a> {
    fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.config.completion_timeout_ms)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.config.poll_interval_us)
    }

    pub fn engine(&self, dir: DmaDirection) -> Result<Engine<'a>> {
        let cfg = match dir {
            DmaDirection::FromDevice => self.config.rx_engine,
            DmaDirection::ToDevice => self.config.tx_engine.ok_or(Error::NoEngine)?,
        };
        let region = self.bars.region(self.config.sgdma_bar)?;
        Ok(Engine::new(region, cfg, dir))
    }

    /// Moves `len` bytes at `addr` with the engine for `dir`. `addr` must
    /// stay valid and otherwise untouched until this returns.
    pub fn stream_transfer(
        &self,
        state: &mut DeviceState,
        dir: DmaDirection,
        addr: u64,
        len: usize,
    ) -> Result<usize> {
        if state.needs_recovery {
            return Err(Error::NeedsRecovery);
        }
        let engine = self.engine(dir)?;
        if len == 0 {
            return Ok(0);
        }
        let cra = self.bars.region(self.config.cra_bar)?;

        let range = PageRange::covering(addr, len, self.config.page_size);
        debug!(
            "{:?} transfer of {:#x} bytes at {:#x}: {} pages",
            dir,
            len,
            addr,
            range.num_pages()
        );
        let mut pinned = PinnedBuffer::pin(self.pinner, &range, dir)?;
        if dir == DmaDirection::FromDevice {
            pinned.set_dirty();
        }
        let mapped = MappedSg::map(self.mapper, pinned.pages(), dir)?;
        let use_64bit = self.mapper.supports_64bit();
        if !use_64bit {
            mapped.check_32bit()?;
        }
        let runs = coalesce(mapped.entries(), self.config.window_size);
        debug!(
            "{} scatter-gather entries coalesced into {} runs",
            mapped.entries().len(),
            runs.len()
        );

        let mut writer = DescriptorWriter::new(self.config, cra, &engine, use_64bit);
        let written = runs.iter().try_for_each(|run| writer.write_run(run));
        let outcome = match written {
            Ok(()) => self
                .completion
                .wait_idle(&engine, self.completion_timeout()),
            Err(e) if e.is_timeout() || writer.runs_written() == 0 => Err(e),
            Err(e) => {
                // Descriptors already queued still target the pinned pages.
                if let Err(wait_err) = self
                    .completion
                    .wait_idle(&engine, self.completion_timeout())
                {
                    error!("Engine did not drain after failed transfer: {}", wait_err);
                    Err(wait_err)
                } else {
                    Err(e)
                }
            }
        };

        if let Err(e) = &outcome {
            if e.is_timeout() {
                error!("{}; resetting engine, device needs recovery", e);
                state.needs_recovery = true;
                let reset = engine.reset(self.completion_timeout(), self.poll_interval());
                if let Err(reset_err) = reset {
                    error!("Engine reset failed: {}", reset_err);
                }
            }
        }

        drop(mapped);
        pinned.release();
        outcome.map(|()| len)
    }
}
