/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    File contains exports for the PCIe FPGA card emulator.

--*/

mod fpga;
mod host;
mod sgdma;
mod stream;

pub use fpga::{CompletedTransfer, EmulatedFpga, FpgaStats, WriteRecord, BAR0_LEN, BAR2_LEN};
pub use host::{BusLayout, DmaFault, DmaTarget, EmulatedHost, HostStats};
pub use sgdma::Descriptor;
