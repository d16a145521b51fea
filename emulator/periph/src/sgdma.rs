/*++

Licensed under the Apache-2.0 license.

File Name:

    sgdma.rs

Abstract:

    Modular SGDMA dispatcher model: CSR block, descriptor port and a
    bounded descriptor FIFO. Data movement is done by the owning card model
    once a descriptor is due.

--*/

use piecomm_config::regs::*;
use piecomm_config::EngineConfig;
use piecomm_driver::regs::{DescriptorControl, SgdmaControl, SgdmaFillLevel, SgdmaStatus};
use piecomm_driver::DmaDirection;
use std::collections::VecDeque;
use tock_registers::LocalRegisterCopy;

/// Ticks the dispatcher reports RESETTING after a reset request.
const RESET_TICKS: u64 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Descriptor {
    pub read_address: u32,
    pub write_address: u32,
    pub len: u32,
    pub control: u32,
}

impl Descriptor {
    /// The Avalon address on the PCIe side of the transfer.
    pub fn host_side_address(&self, direction: DmaDirection) -> u32 {
        match direction {
            DmaDirection::FromDevice => self.write_address,
            DmaDirection::ToDevice => self.read_address,
        }
    }

    pub fn end_on_eop(&self) -> bool {
        LocalRegisterCopy::<u32, DescriptorControl::Register>::new(self.control)
            .is_set(DescriptorControl::END_ON_EOP)
    }

    fn go(&self) -> bool {
        LocalRegisterCopy::<u32, DescriptorControl::Register>::new(self.control)
            .is_set(DescriptorControl::GO)
    }
}

/// Result of a write to the descriptor port.
pub enum Committed {
    Queued(Descriptor),
    Overflowed(Descriptor),
    Dropped(Descriptor),
}

pub struct SgdmaEngine {
    pub cfg: EngineConfig,
    pub direction: DmaDirection,
    depth: usize,
    control: LocalRegisterCopy<u32, SgdmaControl::Register>,
    staged: [u32; 3],
    fifo: VecDeque<Descriptor>,
    executing: Option<(Descriptor, u64)>,
    resetting_until: u64,

    pub latency: u64,
    pub full_polls: u32,
    pub stuck_busy: bool,
}

impl SgdmaEngine {
    pub fn new(cfg: EngineConfig, direction: DmaDirection, depth: u32) -> Self {
        Self {
            cfg,
            direction,
            depth: depth as usize,
            control: LocalRegisterCopy::new(0),
            staged: [0; 3],
            fifo: VecDeque::new(),
            executing: None,
            resetting_until: 0,
            latency: 0,
            full_polls: 0,
            stuck_busy: false,
        }
    }

    pub fn csr_offset(&self, offset: u32) -> Option<u32> {
        offset
            .checked_sub(self.cfg.csr_offset)
            .filter(|rel| *rel < SGDMA_CSR_LEN)
    }

    pub fn descriptor_port_offset(&self, offset: u32) -> Option<u32> {
        offset
            .checked_sub(self.cfg.descriptor_offset)
            .filter(|rel| *rel < DESCRIPTOR_LEN)
    }

    fn resetting(&self, now: u64) -> bool {
        now < self.resetting_until
    }

    pub fn is_busy(&self) -> bool {
        self.executing.is_some() || self.stuck_busy
    }

    pub fn is_idle(&self) -> bool {
        !self.is_busy() && self.fifo.is_empty()
    }

    /// Every descriptor not yet retired, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &Descriptor> {
        self.executing
            .iter()
            .map(|(d, _)| d)
            .chain(self.fifo.iter())
    }

    pub fn read_csr(&mut self, rel: u32, now: u64) -> u32 {
        match rel {
            SGDMA_CSR_STATUS => {
                let mut status = LocalRegisterCopy::<u32, SgdmaStatus::Register>::new(0);
                status.modify(SgdmaStatus::RESPONSE_BUFFER_EMPTY::SET);
                if self.is_busy() {
                    status.modify(SgdmaStatus::BUSY::SET);
                }
                if self.fifo.is_empty() {
                    status.modify(SgdmaStatus::DESCRIPTOR_BUFFER_EMPTY::SET);
                }
                if self.fifo.len() >= self.depth || self.full_polls > 0 {
                    status.modify(SgdmaStatus::DESCRIPTOR_BUFFER_FULL::SET);
                }
                if self.resetting(now) {
                    status.modify(SgdmaStatus::RESETTING::SET);
                }
                status.get()
            }
            SGDMA_CSR_CONTROL => self.control.get(),
            SGDMA_CSR_FILL_LEVEL => {
                let fill = if self.full_polls > 0 {
                    self.full_polls -= 1;
                    self.depth as u32
                } else {
                    self.fifo.len() as u32
                };
                let mut reg = LocalRegisterCopy::<u32, SgdmaFillLevel::Register>::new(0);
                match self.direction {
                    DmaDirection::FromDevice => {
                        reg.modify(SgdmaFillLevel::WRITE_FILL_LEVEL.val(fill))
                    }
                    DmaDirection::ToDevice => reg.modify(SgdmaFillLevel::READ_FILL_LEVEL.val(fill)),
                }
                reg.get()
            }
            _ => 0,
        }
    }

    pub fn write_csr(&mut self, rel: u32, value: u32, now: u64) {
        if rel != SGDMA_CSR_CONTROL {
            return;
        }
        let control = LocalRegisterCopy::<u32, SgdmaControl::Register>::new(value);
        if control.is_set(SgdmaControl::RESET_DISPATCHER) {
            self.fifo.clear();
            self.executing = None;
            self.staged = [0; 3];
            self.resetting_until = now + RESET_TICKS;
            self.control.set(0);
            return;
        }
        self.control.set(value);
    }

    pub fn write_descriptor(&mut self, rel: u32, value: u32, now: u64) -> Option<Committed> {
        match rel {
            DESCRIPTOR_READ_ADDRESS => self.staged[0] = value,
            DESCRIPTOR_WRITE_ADDRESS => self.staged[1] = value,
            DESCRIPTOR_LENGTH => self.staged[2] = value,
            DESCRIPTOR_CONTROL => {
                let descriptor = Descriptor {
                    read_address: self.staged[0],
                    write_address: self.staged[1],
                    len: self.staged[2],
                    control: value,
                };
                if !descriptor.go() {
                    return None;
                }
                if self.resetting(now) {
                    return Some(Committed::Dropped(descriptor));
                }
                if self.fifo.len() >= self.depth {
                    return Some(Committed::Overflowed(descriptor));
                }
                self.fifo.push_back(descriptor);
                return Some(Committed::Queued(descriptor));
            }
            _ => {}
        }
        None
    }

    /// Moves the next queued descriptor into execution if the dispatcher is
    /// free.
    pub fn start_next(&mut self, now: u64) {
        if self.executing.is_none() && !self.resetting(now) {
            if let Some(descriptor) = self.fifo.pop_front() {
                self.executing = Some((descriptor, now + self.latency));
            }
        }
    }

    /// The executing descriptor, once its latency has elapsed.
    pub fn due(&self, now: u64) -> Option<Descriptor> {
        match self.executing {
            Some((descriptor, ready_at)) if ready_at <= now && !self.resetting(now) => {
                Some(descriptor)
            }
            _ => None,
        }
    }

    pub fn retire(&mut self, now: u64) {
        self.executing = None;
        self.start_next(now);
    }
}
