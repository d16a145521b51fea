// Licensed under the Apache-2.0 license

use crate::bar::BarTable;
use crate::command::{CommandKind, IoCmd, TransferCommand};
use crate::completion::{Completion, PollingCompletion};
use crate::dma::DmaContext;
use crate::error::{Error, Result};
use crate::register;
use crate::regs::{ATT_ENTRY_STRIDE, DESCRIPTOR_LEN, SGDMA_CSR_LEN};
use crate::sg::{DmaDirection, DmaMapper, PagePinner};
use anyhow::anyhow;
use bitflags::bitflags;
use log::{debug, info, warn};
use piecomm_config::{DeviceConfig, EngineConfig};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Fail with `WouldBlock` instead of waiting for the device lock.
        const NONBLOCK = 1 << 0;
    }
}

/// Everything guarded by the device lock.
pub(crate) struct DeviceState {
    pub staging: Vec<u8>,
    pub needs_recovery: bool,
}

impl DeviceState {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            staging: vec![0; config.staging_size],
            needs_recovery: false,
        }
    }
}

#[derive(Default)]
struct Binding {
    owner: Option<u32>,
    sessions: usize,
    /// Bumped by `recover`; sessions from an older generation are stale.
    generation: u64,
}

/// One attached card.
pub struct FpgaDevice {
    config: DeviceConfig,
    bars: BarTable,
    state: Mutex<DeviceState>,
    binding: Mutex<Binding>,
    pinner: Arc<dyn PagePinner>,
    mapper: Arc<dyn DmaMapper>,
    completion: Arc<dyn Completion>,
}

impl FpgaDevice {
    pub fn new(
        config: DeviceConfig,
        bars: BarTable,
        pinner: Arc<dyn PagePinner>,
        mapper: Arc<dyn DmaMapper>,
    ) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        check_layout(&config, &bars)?;
        let completion = Arc::new(PollingCompletion::new(Duration::from_micros(
            config.poll_interval_us,
        )));
        info!(
            "Attached FPGA {:04x}:{:04x}, BAR lengths {:x?}",
            config.vendor_id,
            config.device_id,
            bars.lengths()
        );
        Ok(Self {
            state: Mutex::new(DeviceState::new(&config)),
            binding: Mutex::new(Binding::default()),
            config,
            bars,
            pinner,
            mapper,
            completion,
        })
    }

    pub fn with_completion(mut self, completion: Arc<dyn Completion>) -> Self {
        self.completion = completion;
        self
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn bars(&self) -> &BarTable {
        &self.bars
    }

    /// Binds the calling process to the device.
    pub fn open(&self, flags: OpenFlags) -> Result<Session<'_>> {
        self.open_as(std::process::id(), flags)
    }

    pub(crate) fn open_as(&self, pid: u32, flags: OpenFlags) -> Result<Session<'_>> {
        let mut binding = self.binding.lock().map_err(|_| Error::Interrupted)?;
        match binding.owner {
            Some(owner) if owner != pid => return Err(Error::NotOwner { owner }),
            _ => {}
        }
        binding.owner = Some(pid);
        binding.sessions += 1;
        info!("Process {} opened the device ({:?})", pid, flags);
        Ok(Session {
            device: self,
            flags,
            pid,
            generation: binding.generation,
            closed: false,
        })
    }

    pub fn needs_recovery(&self) -> bool {
        match self.state.lock() {
            Ok(state) => state.needs_recovery,
            Err(_) => true,
        }
    }

    /// Brings the device back to its just-attached state after a timeout.
    /// Open sessions become stale and must be reopened.
    pub fn recover(&self) -> Result<()> {
        if self.state.is_poisoned() {
            self.state.clear_poison();
        }
        let mut state = self.state.lock().map_err(|_| Error::Interrupted)?;
        if self.binding.is_poisoned() {
            self.binding.clear_poison();
        }
        let mut binding = self.binding.lock().map_err(|_| Error::Interrupted)?;

        let dma = self.dma_context();
        for dir in [DmaDirection::FromDevice, DmaDirection::ToDevice] {
            match dma.engine(dir) {
                Ok(engine) => engine.reset(
                    Duration::from_millis(self.config.completion_timeout_ms),
                    Duration::from_micros(self.config.poll_interval_us),
                )?,
                Err(Error::NoEngine) => {}
                Err(e) => return Err(e),
            }
        }
        *state = DeviceState::new(&self.config);
        binding.owner = None;
        binding.sessions = 0;
        binding.generation += 1;
        info!("Device recovered");
        Ok(())
    }

    fn lock_state(&self, flags: OpenFlags) -> Result<MutexGuard<'_, DeviceState>> {
        if flags.contains(OpenFlags::NONBLOCK) {
            match self.state.try_lock() {
                Ok(guard) => Ok(guard),
                Err(TryLockError::WouldBlock) => {
                    warn!("Device lock held, not waiting");
                    Err(Error::WouldBlock)
                }
                Err(TryLockError::Poisoned(_)) => Err(Error::Interrupted),
            }
        } else {
            self.state.lock().map_err(|_| Error::Interrupted)
        }
    }

    fn dma_context(&self) -> DmaContext<'_> {
        DmaContext {
            config: &self.config,
            bars: &self.bars,
            pinner: self.pinner.as_ref(),
            mapper: self.mapper.as_ref(),
            completion: self.completion.as_ref(),
        }
    }
}

fn check_engine(bars: &BarTable, index: u8, engine: &EngineConfig) -> Result<()> {
    let region = bars.region(index)?;
    region.check_range(engine.csr_offset.into(), SGDMA_CSR_LEN as usize)?;
    region.check_range(engine.descriptor_offset.into(), DESCRIPTOR_LEN as usize)?;
    Ok(())
}

/// The CRA and SGDMA BARs must be mapped and large enough for the register
/// blocks the config places in them.
fn check_layout(config: &DeviceConfig, bars: &BarTable) -> Result<()> {
    let cra = bars.region(config.cra_bar)?;
    let att = config
        .att_row_offset(0)
        .ok_or_else(|| Error::Config(anyhow!("ATT offset does not fit in 32 bits")))?;
    cra.check_range(
        att.into(),
        config.att_entries as usize * ATT_ENTRY_STRIDE as usize,
    )?;
    check_engine(bars, config.sgdma_bar, &config.rx_engine)?;
    if let Some(tx) = &config.tx_engine {
        check_engine(bars, config.sgdma_bar, tx)?;
    }
    Ok(())
}

/// An open handle on the device, bound to one process.
pub struct Session<'a> {
    device: &'a FpgaDevice,
    flags: OpenFlags,
    pid: u32,
    generation: u64,
    closed: bool,
}

impl Session<'_> {
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    fn check_open(&self) -> Result<()> {
        let binding = self.device.binding.lock().map_err(|_| Error::Interrupted)?;
        if self.closed || binding.generation != self.generation {
            return Err(Error::NotOpen);
        }
        match binding.owner {
            Some(owner) if owner == self.pid => Ok(()),
            Some(owner) => Err(Error::NotOwner { owner }),
            None => Err(Error::NotOpen),
        }
    }

    /// Reads `buf.len()` bytes as described by a wire-format command record.
    pub fn read(&self, cmd: &[u8], buf: &mut [u8]) -> Result<usize> {
        let io = IoCmd::decode(cmd)?;
        io.check_user_addr(buf.as_ptr() as u64)?;
        self.read_cmd(&TransferCommand::try_from(&io)?, buf)
    }

    pub fn write(&self, cmd: &[u8], buf: &[u8]) -> Result<usize> {
        let io = IoCmd::decode(cmd)?;
        io.check_user_addr(buf.as_ptr() as u64)?;
        self.write_cmd(&TransferCommand::try_from(&io)?, buf)
    }

    pub fn read_cmd(&self, cmd: &TransferCommand, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        let mut state = self.device.lock_state(self.flags)?;
        match cmd.kind {
            CommandKind::Register => register::read(
                &self.device.bars,
                &mut state.staging,
                cmd.window,
                cmd.device_offset,
                buf,
            ),
            CommandKind::Stream => self.device.dma_context().stream_transfer(
                &mut state,
                DmaDirection::FromDevice,
                buf.as_mut_ptr() as u64,
                buf.len(),
            ),
        }
    }

    pub fn write_cmd(&self, cmd: &TransferCommand, buf: &[u8]) -> Result<usize> {
        self.check_open()?;
        let mut state = self.device.lock_state(self.flags)?;
        match cmd.kind {
            CommandKind::Register => register::write(
                &self.device.bars,
                &mut state.staging,
                cmd.window,
                cmd.device_offset,
                buf,
            ),
            CommandKind::Stream => self.device.dma_context().stream_transfer(
                &mut state,
                DmaDirection::ToDevice,
                buf.as_ptr() as u64,
                buf.len(),
            ),
        }
    }

    pub fn read_u8(&self, window: u8, offset: u32) -> Result<u8> {
        let mut byte = [0u8];
        self.read_cmd(&TransferCommand::register(window, offset), &mut byte)?;
        Ok(byte[0])
    }

    pub fn write_u8(&self, window: u8, offset: u32, value: u8) -> Result<()> {
        self.write_cmd(&TransferCommand::register(window, offset), &[value])?;
        Ok(())
    }

    pub fn read_u32(&self, window: u8, offset: u32) -> Result<u32> {
        self.check_open()?;
        let _state = self.device.lock_state(self.flags)?;
        register::read_u32(&self.device.bars, window, offset)
    }

    pub fn write_u32(&self, window: u8, offset: u32, value: u32) -> Result<()> {
        self.check_open()?;
        let _state = self.device.lock_state(self.flags)?;
        register::write_u32(&self.device.bars, window, offset, value)
    }

    /// Releases the binding. Dropping the session does the same.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::NotOpen);
        }
        self.closed = true;
        let mut binding = self.device.binding.lock().map_err(|_| Error::Interrupted)?;
        if binding.generation != self.generation {
            return Err(Error::NotOpen);
        }
        binding.sessions = binding.sessions.saturating_sub(1);
        if binding.sessions == 0 {
            binding.owner = None;
        }
        debug!(
            "Process {} closed the device, {} sessions left",
            self.pid, binding.sessions
        );
        Ok(())
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.release();
        }
    }
}
