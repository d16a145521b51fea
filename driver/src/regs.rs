// Licensed under the Apache-2.0 license

//! Bit layouts of the PCIe CRA and modular SGDMA registers.

pub use piecomm_config::regs::*;
use tock_registers::register_bitfields;

register_bitfields! {
    u32,
    pub SgdmaStatus [
        BUSY OFFSET(0) NUMBITS(1) [],
        DESCRIPTOR_BUFFER_EMPTY OFFSET(1) NUMBITS(1) [],
        DESCRIPTOR_BUFFER_FULL OFFSET(2) NUMBITS(1) [],
        RESPONSE_BUFFER_EMPTY OFFSET(3) NUMBITS(1) [],
        RESPONSE_BUFFER_FULL OFFSET(4) NUMBITS(1) [],
        STOPPED OFFSET(5) NUMBITS(1) [],
        RESETTING OFFSET(6) NUMBITS(1) [],
        STOPPED_ON_ERROR OFFSET(7) NUMBITS(1) [],
        STOPPED_ON_EARLY_TERMINATION OFFSET(8) NUMBITS(1) [],
        IRQ OFFSET(9) NUMBITS(1) [],
    ],
    pub SgdmaControl [
        STOP OFFSET(0) NUMBITS(1) [],
        RESET_DISPATCHER OFFSET(1) NUMBITS(1) [],
        STOP_ON_ERROR OFFSET(2) NUMBITS(1) [],
        STOP_ON_EARLY_TERMINATION OFFSET(3) NUMBITS(1) [],
        GLOBAL_INTERRUPT_ENABLE OFFSET(4) NUMBITS(1) [],
        STOP_DESCRIPTORS OFFSET(5) NUMBITS(1) [],
    ],
    pub SgdmaFillLevel [
        READ_FILL_LEVEL OFFSET(0) NUMBITS(16) [],
        WRITE_FILL_LEVEL OFFSET(16) NUMBITS(16) [],
    ],
    pub DescriptorControl [
        TRANSMIT_CHANNEL OFFSET(0) NUMBITS(8) [],
        GENERATE_SOP OFFSET(8) NUMBITS(1) [],
        GENERATE_EOP OFFSET(9) NUMBITS(1) [],
        PARK_READS OFFSET(10) NUMBITS(1) [],
        PARK_WRITES OFFSET(11) NUMBITS(1) [],
        END_ON_EOP OFFSET(12) NUMBITS(1) [],
        TRANSFER_COMPLETE_IRQ OFFSET(14) NUMBITS(1) [],
        EARLY_TERMINATION_IRQ OFFSET(15) NUMBITS(1) [],
        // The read master reports this as the transmit error; the dispatcher
        // raises an interrupt if the write master asserts any of these bits.
        ERROR_IRQ OFFSET(16) NUMBITS(8) [],
        EARLY_DONE_ENABLE OFFSET(24) NUMBITS(1) [],
        // Commits the descriptor to the dispatcher.
        GO OFFSET(31) NUMBITS(1) [],
    ],
    pub AttEntryLow [
        ADDRESS_SPACE OFFSET(0) NUMBITS(2) [
            Bits32 = 0,
            Bits64 = 1,
        ],
        // Low bits are masked by the window size; only the window base is kept.
        ADDRESS OFFSET(2) NUMBITS(30) [],
    ],
}
