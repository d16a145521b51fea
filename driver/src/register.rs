// Licensed under the Apache-2.0 license

//! The register path: copies between a BAR and the caller's buffer through
//! the device's staging buffer, one staging-sized chunk at a time.

use crate::bar::BarTable;
use crate::error::Result;

pub(crate) fn read(
    bars: &BarTable,
    staging: &mut [u8],
    window: u8,
    offset: u32,
    buf: &mut [u8],
) -> Result<usize> {
    let region = bars.region(window)?;
    region.check_range(offset.into(), buf.len())?;

    let mut device_offset = u64::from(offset);
    for chunk in buf.chunks_mut(staging.len()) {
        let stage = &mut staging[..chunk.len()];
        region.read_bytes(device_offset, stage)?;
        chunk.copy_from_slice(stage);
        device_offset += chunk.len() as u64;
    }
    Ok(buf.len())
}

pub(crate) fn write(
    bars: &BarTable,
    staging: &mut [u8],
    window: u8,
    offset: u32,
    buf: &[u8],
) -> Result<usize> {
    let region = bars.region(window)?;
    region.check_range(offset.into(), buf.len())?;

    let mut device_offset = u64::from(offset);
    for chunk in buf.chunks(staging.len()) {
        let stage = &mut staging[..chunk.len()];
        stage.copy_from_slice(chunk);
        region.write_bytes(device_offset, stage)?;
        device_offset += chunk.len() as u64;
    }
    Ok(buf.len())
}

pub(crate) fn read_u32(bars: &BarTable, window: u8, offset: u32) -> Result<u32> {
    bars.region(window)?.read32(offset)
}

pub(crate) fn write_u32(bars: &BarTable, window: u8, offset: u32, value: u32) -> Result<()> {
    bars.region(window)?.write32(offset, value)
}
