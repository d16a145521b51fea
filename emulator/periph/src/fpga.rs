/*++

Licensed under the Apache-2.0 license.

File Name:

    fpga.rs

Abstract:

    The PCIe FPGA card: a RAM BAR, the CRA address translation table and
    the SGDMA engines, clocked by BAR2 accesses.

--*/

use crate::host::DmaTarget;
use crate::sgdma::{Committed, Descriptor, SgdmaEngine};
use crate::stream::StreamSource;
use log::{debug, warn};
use piecomm_config::regs::{ATT_ENTRY_HIGH, ATT_ENTRY_STRIDE};
use piecomm_config::DeviceConfig;
use piecomm_driver::regs::AttEntryLow;
use piecomm_driver::{BarIo, BarTable, CompletionSignal, DmaDirection};
use std::sync::{Arc, Mutex};
use tock_registers::LocalRegisterCopy;

pub const BAR0_LEN: usize = 0x1_0000;
pub const BAR2_LEN: usize = 0x8000;

/// One register write the card accepted, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteRecord {
    AttLow { slot: u32, value: u32 },
    AttHigh { slot: u32, value: u32 },
    Descriptor {
        direction: DmaDirection,
        descriptor: Descriptor,
        queued: bool,
    },
}

/// A descriptor the card executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompletedTransfer {
    pub direction: DmaDirection,
    pub avalon_address: u32,
    pub bus_address: u64,
    pub len: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FpgaStats {
    /// Descriptors written while the FIFO was full.
    pub overflows: u32,
    /// ATT rows rewritten while an unretired descriptor still used them.
    pub att_hazards: u32,
    /// Descriptors whose Avalon range missed the ATT.
    pub att_faults: u32,
    /// Translated bus addresses the host refused.
    pub dma_faults: u32,
    pub retired: u64,
}

struct FpgaState {
    config: DeviceConfig,
    now: u64,
    ram: Vec<u8>,
    bar2: Vec<u8>,
    att: Vec<(u32, u32)>,
    rx: SgdmaEngine,
    tx: Option<SgdmaEngine>,
    host: Option<Arc<dyn DmaTarget>>,
    signal: Option<Arc<CompletionSignal>>,
    source: StreamSource,
    loopback: bool,
    sink: Vec<u8>,
    log: Vec<WriteRecord>,
    completed: Vec<CompletedTransfer>,
    stats: FpgaStats,
}

impl FpgaState {
    fn engine_mut(&mut self, direction: DmaDirection) -> Option<&mut SgdmaEngine> {
        match direction {
            DmaDirection::FromDevice => Some(&mut self.rx),
            DmaDirection::ToDevice => self.tx.as_mut(),
        }
    }

    fn engines(&self) -> impl Iterator<Item = &SgdmaEngine> {
        std::iter::once(&self.rx).chain(self.tx.iter())
    }

    fn att_slot(&self, offset: u32) -> Option<(u32, u32)> {
        let base = self.config.att_row_offset(0)?;
        let rel = offset.checked_sub(base)?;
        let slot = rel / ATT_ENTRY_STRIDE;
        (slot < self.config.att_entries).then_some((slot, rel % ATT_ENTRY_STRIDE))
    }

    /// ATT slot and window offset an Avalon address falls in.
    fn avalon_slot(&self, avalon_address: u32) -> Option<(u32, u64)> {
        let rel = u64::from(avalon_address.checked_sub(self.config.tx_port_avalon_offset)?);
        let slot = rel / self.config.window_size;
        (slot < u64::from(self.config.att_entries))
            .then_some((slot as u32, rel % self.config.window_size))
    }

    fn translate(&self, avalon_address: u32, len: usize) -> Option<u64> {
        let (slot, offset) = self.avalon_slot(avalon_address)?;
        if offset + len as u64 > self.config.window_size {
            return None;
        }
        let (low, high) = self.att[slot as usize];
        let low_reg = LocalRegisterCopy::<u32, AttEntryLow::Register>::new(low);
        let base = if low_reg.matches_all(AttEntryLow::ADDRESS_SPACE::Bits64) {
            (u64::from(high) << 32) | u64::from(low)
        } else {
            u64::from(low)
        };
        Some((base & !self.config.window_offset_mask()) + offset)
    }

    fn read32(&mut self, offset: u32) -> u32 {
        self.now += 1;
        let now = self.now;
        let value = match self.csr_target(offset) {
            Some((direction, rel)) => self
                .engine_mut(direction)
                .map_or(0, |engine| engine.read_csr(rel, now)),
            None => {
                let i = offset as usize;
                u32::from_le_bytes([
                    self.bar2[i],
                    self.bar2[i + 1],
                    self.bar2[i + 2],
                    self.bar2[i + 3],
                ])
            }
        };
        self.advance();
        value
    }

    fn write32(&mut self, offset: u32, value: u32) {
        self.now += 1;
        let now = self.now;
        let i = offset as usize;
        self.bar2[i..i + 4].copy_from_slice(&value.to_le_bytes());

        if let Some((slot, field)) = self.att_slot(offset) {
            self.write_att(slot, field, value);
        } else if let Some((direction, rel)) = self.csr_target(offset) {
            if let Some(engine) = self.engine_mut(direction) {
                engine.write_csr(rel, value, now);
            }
        } else if let Some((direction, rel)) = self.descriptor_target(offset) {
            let committed = self
                .engine_mut(direction)
                .and_then(|engine| engine.write_descriptor(rel, value, now));
            if let Some(committed) = committed {
                self.record_descriptor(direction, committed);
            }
        }
        self.advance();
    }

    fn csr_target(&self, offset: u32) -> Option<(DmaDirection, u32)> {
        self.engines()
            .find_map(|e| e.csr_offset(offset).map(|rel| (e.direction, rel)))
    }

    fn descriptor_target(&self, offset: u32) -> Option<(DmaDirection, u32)> {
        self.engines()
            .find_map(|e| e.descriptor_port_offset(offset).map(|rel| (e.direction, rel)))
    }

    fn write_att(&mut self, slot: u32, field: u32, value: u32) {
        let in_use = self.engines().any(|e| {
            e.pending().any(|d| {
                self.avalon_slot(d.host_side_address(e.direction))
                    .is_some_and(|(s, _)| s == slot)
            })
        });
        if in_use {
            warn!("ATT row {} rewritten while a descriptor still uses it", slot);
            self.stats.att_hazards += 1;
        }
        let row = &mut self.att[slot as usize];
        if field == ATT_ENTRY_HIGH {
            row.1 = value;
            self.log.push(WriteRecord::AttHigh { slot, value });
        } else {
            row.0 = value;
            self.log.push(WriteRecord::AttLow { slot, value });
        }
    }

    fn record_descriptor(&mut self, direction: DmaDirection, committed: Committed) {
        let (descriptor, queued) = match committed {
            Committed::Queued(d) => (d, true),
            Committed::Overflowed(d) => {
                warn!("{:?} descriptor FIFO overflow", direction);
                self.stats.overflows += 1;
                (d, false)
            }
            Committed::Dropped(d) => (d, false),
        };
        self.log.push(WriteRecord::Descriptor {
            direction,
            descriptor,
            queued,
        });
    }

    /// Runs every descriptor whose time has come. Host-to-device first so a
    /// looped-back stream is visible to the receive engine in the same tick.
    fn advance(&mut self) {
        let now = self.now;
        let mut went_idle = false;
        loop {
            let mut progress = false;
            for direction in [DmaDirection::ToDevice, DmaDirection::FromDevice] {
                let Some(engine) = self.engine_mut(direction) else {
                    continue;
                };
                engine.start_next(now);
                let Some(descriptor) = engine.due(now) else {
                    continue;
                };
                if !self.execute(direction, &descriptor) {
                    continue;
                }
                if let Some(engine) = self.engine_mut(direction) {
                    engine.retire(now);
                    went_idle |= engine.is_idle();
                    self.stats.retired += 1;
                }
                progress = true;
            }
            if !progress {
                break;
            }
        }
        if went_idle {
            if let Some(signal) = &self.signal {
                signal.notify();
            }
        }
    }

    /// Moves the data for one descriptor. Returns false if a receive
    /// descriptor has to keep waiting for stream data.
    fn execute(&mut self, direction: DmaDirection, descriptor: &Descriptor) -> bool {
        let avalon_address = descriptor.host_side_address(direction);
        let len = descriptor.len as usize;
        match direction {
            DmaDirection::FromDevice => {
                let Some(data) = self.source.take(len, descriptor.end_on_eop()) else {
                    return false;
                };
                self.dma(direction, avalon_address, data.len(), |host, bus| {
                    host.dma_write(bus, &data).map(|()| None)
                });
            }
            DmaDirection::ToDevice => {
                let data = self.dma(direction, avalon_address, len, |host, bus| {
                    let mut buf = vec![0u8; len];
                    host.dma_read(bus, &mut buf).map(|()| Some(buf))
                });
                if let Some(data) = data {
                    if self.loopback {
                        self.source.push(&data, false);
                    } else {
                        self.sink.extend_from_slice(&data);
                    }
                }
            }
        }
        true
    }

    fn dma<F>(
        &mut self,
        direction: DmaDirection,
        avalon_address: u32,
        len: usize,
        access: F,
    ) -> Option<Vec<u8>>
    where
        F: FnOnce(&dyn DmaTarget, u64) -> Result<Option<Vec<u8>>, crate::host::DmaFault>,
    {
        let Some(bus_address) = self.translate(avalon_address, len) else {
            warn!(
                "Avalon range {:#x}+{:#x} is not covered by the ATT",
                avalon_address, len
            );
            self.stats.att_faults += 1;
            return None;
        };
        debug!(
            "{:?} DMA of {:#x} bytes, Avalon {:#x} -> bus {:#x}",
            direction, len, avalon_address, bus_address
        );
        self.completed.push(CompletedTransfer {
            direction,
            avalon_address,
            bus_address,
            len,
        });
        let host = self.host.clone()?;
        match access(host.as_ref(), bus_address) {
            Ok(data) => data,
            Err(fault) => {
                warn!("DMA fault at bus address {:#x}", fault.bus_address);
                self.stats.dma_faults += 1;
                None
            }
        }
    }
}

/// A software model of the card. Clones share the same device.
#[derive(Clone)]
pub struct EmulatedFpga {
    state: Arc<Mutex<FpgaState>>,
}

impl EmulatedFpga {
    pub fn new(config: &DeviceConfig) -> Self {
        let depth = config.descriptor_fifo_depth;
        let rx = SgdmaEngine::new(config.rx_engine, DmaDirection::FromDevice, depth);
        let tx = config
            .tx_engine
            .map(|cfg| SgdmaEngine::new(cfg, DmaDirection::ToDevice, depth));
        Self {
            state: Arc::new(Mutex::new(FpgaState {
                config: config.clone(),
                now: 0,
                ram: vec![0; BAR0_LEN],
                bar2: vec![0; BAR2_LEN],
                att: vec![(0, 0); config.att_entries as usize],
                rx,
                tx,
                host: None,
                signal: None,
                source: StreamSource::default(),
                loopback: false,
                sink: Vec::new(),
                log: Vec::new(),
                completed: Vec::new(),
                stats: FpgaStats::default(),
            })),
        }
    }

    /// BAR0 and BAR2 handles for the driver. BAR1 is not implemented.
    pub fn bars(&self) -> BarTable {
        let mut bars = BarTable::new();
        for index in [0u8, 2] {
            let bar = EmulatedBar {
                index,
                state: self.state.clone(),
            };
            // Indices 0 and 2 are always valid.
            let _ = bars.insert(piecomm_driver::Region::new(index, Box::new(bar)));
        }
        bars
    }

    pub fn connect_host(&self, host: Arc<dyn DmaTarget>) {
        self.state.lock().unwrap().host = Some(host);
    }

    /// Raise `signal` whenever an engine drains.
    pub fn set_completion_signal(&self, signal: Arc<CompletionSignal>) {
        self.state.lock().unwrap().signal = Some(signal);
    }

    /// Ticks between a descriptor starting and completing.
    pub fn set_latency(&self, direction: DmaDirection, ticks: u64) {
        if let Some(engine) = self.state.lock().unwrap().engine_mut(direction) {
            engine.latency = ticks;
        }
    }

    /// The next `polls` fill level reads report a full FIFO.
    pub fn report_fifo_full(&self, direction: DmaDirection, polls: u32) {
        if let Some(engine) = self.state.lock().unwrap().engine_mut(direction) {
            engine.full_polls = polls;
        }
    }

    /// Holds the busy bit regardless of the FIFO. Survives a dispatcher reset.
    pub fn set_stuck_busy(&self, direction: DmaDirection, stuck: bool) {
        if let Some(engine) = self.state.lock().unwrap().engine_mut(direction) {
            engine.stuck_busy = stuck;
        }
    }

    /// Routes the host-to-device stream back into the receive engine.
    pub fn set_loopback(&self, enabled: bool) {
        self.state.lock().unwrap().loopback = enabled;
    }

    /// Feeds the receive engine from the free-running pulse counter.
    pub fn set_counter_source(&self, enabled: bool) {
        self.state.lock().unwrap().source.set_counter(enabled);
    }

    pub fn push_packet(&self, data: &[u8], eop: bool) {
        let mut state = self.state.lock().unwrap();
        state.source.push(data, eop);
        state.advance();
    }

    /// Advances the clock without a register access.
    pub fn tick(&self, ticks: u64) {
        let mut state = self.state.lock().unwrap();
        state.now += ticks;
        state.advance();
    }

    pub fn take_sink(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().unwrap().sink)
    }

    pub fn log(&self) -> Vec<WriteRecord> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn stats(&self) -> FpgaStats {
        self.state.lock().unwrap().stats
    }

    pub fn completed(&self) -> Vec<CompletedTransfer> {
        self.state.lock().unwrap().completed.clone()
    }

    pub fn ram(&self) -> Vec<u8> {
        self.state.lock().unwrap().ram.clone()
    }

    pub fn att_row(&self, slot: u32) -> (u32, u32) {
        self.state.lock().unwrap().att[slot as usize]
    }
}

/// Driver-facing view of one BAR.
struct EmulatedBar {
    index: u8,
    state: Arc<Mutex<FpgaState>>,
}

impl BarIo for EmulatedBar {
    fn len(&self) -> usize {
        match self.index {
            0 => BAR0_LEN,
            _ => BAR2_LEN,
        }
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let mut state = self.state.lock().unwrap();
        match self.index {
            0 => {
                let mut word = [0u8; 4];
                word.copy_from_slice(&state.ram[offset..offset + 4]);
                u32::from_le_bytes(word)
            }
            _ => state.read32(offset as u32),
        }
    }

    fn write_u32(&self, offset: usize, value: u32) {
        let mut state = self.state.lock().unwrap();
        match self.index {
            0 => state.ram[offset..offset + 4].copy_from_slice(&value.to_le_bytes()),
            _ => state.write32(offset as u32, value),
        }
    }

    // Byte accesses see BAR2 as plain memory; only word accesses reach the
    // ATT and the engines.
    fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        let state = self.state.lock().unwrap();
        let mem = match self.index {
            0 => &state.ram,
            _ => &state.bar2,
        };
        buf.copy_from_slice(&mem[offset..offset + buf.len()]);
    }

    fn write_bytes(&self, offset: usize, buf: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let mem = match self.index {
            0 => &mut state.ram,
            _ => &mut state.bar2,
        };
        mem[offset..offset + buf.len()].copy_from_slice(buf);
    }
}
