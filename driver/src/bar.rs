// Licensed under the Apache-2.0 license

//! Bounds-checked handles over the card's memory-mapped BARs.

use crate::error::{Error, Result};
use crate::regs::NUM_BARS;

/// Raw access to one mapped address range.
///
/// Implementations do no checking of their own; offsets are validated by
/// [`Region`] before they get here.
pub trait BarIo: Send + Sync {
    fn len(&self) -> usize;
    fn read_u32(&self, offset: usize) -> u32;
    fn write_u32(&self, offset: usize, value: u32);
    fn read_bytes(&self, offset: usize, buf: &mut [u8]);
    fn write_bytes(&self, offset: usize, buf: &[u8]);
}

/// One BAR, identified by its index on the card.
pub struct Region {
    index: u8,
    io: Box<dyn BarIo>,
}

impl Region {
    pub fn new(index: u8, io: Box<dyn BarIo>) -> Self {
        Self { index, io }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn len(&self) -> usize {
        self.io.len()
    }

    pub fn is_empty(&self) -> bool {
        self.io.len() == 0
    }

    /// Returns `offset` as an index into the region if `[offset, offset + len)`
    /// lies inside it.
    pub fn check_range(&self, offset: u64, len: usize) -> Result<usize> {
        let window_len = self.io.len();
        let out_of_range = || Error::OutOfRange {
            window: self.index,
            offset,
            len,
            window_len,
        };
        let start = usize::try_from(offset).map_err(|_| out_of_range())?;
        match start.checked_add(len) {
            Some(end) if end <= window_len => Ok(start),
            _ => Err(out_of_range()),
        }
    }

    fn check_word(&self, offset: u32) -> Result<usize> {
        if offset % 4 != 0 {
            return Err(Error::Misaligned {
                offset: offset.into(),
            });
        }
        self.check_range(offset.into(), 4)
    }

    pub fn read32(&self, offset: u32) -> Result<u32> {
        let offset = self.check_word(offset)?;
        Ok(self.io.read_u32(offset))
    }

    pub fn write32(&self, offset: u32, value: u32) -> Result<()> {
        let offset = self.check_word(offset)?;
        self.io.write_u32(offset, value);
        Ok(())
    }

    pub fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let offset = self.check_range(offset, buf.len())?;
        self.io.read_bytes(offset, buf);
        Ok(())
    }

    pub fn write_bytes(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let offset = self.check_range(offset, buf.len())?;
        self.io.write_bytes(offset, buf);
        Ok(())
    }
}

/// The BARs of one card, filled in once at attach.
#[derive(Default)]
pub struct BarTable {
    regions: [Option<Region>; NUM_BARS],
}

impl BarTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, region: Region) -> Result<()> {
        let index = region.index();
        let slot = self
            .regions
            .get_mut(usize::from(index))
            .ok_or(Error::InvalidWindow { index })?;
        *slot = Some(region);
        Ok(())
    }

    pub fn with(mut self, index: u8, io: Box<dyn BarIo>) -> Result<Self> {
        self.insert(Region::new(index, io))?;
        Ok(self)
    }

    /// Looks up a mapped, non-empty BAR.
    pub fn region(&self, index: u8) -> Result<&Region> {
        match self.regions.get(usize::from(index)) {
            Some(Some(region)) if !region.is_empty() => Ok(region),
            _ => Err(Error::InvalidWindow { index }),
        }
    }

    /// Mapped length of every BAR, zero for the ones that are absent.
    pub fn lengths(&self) -> [usize; NUM_BARS] {
        let mut lengths = [0; NUM_BARS];
        for (len, region) in lengths.iter_mut().zip(self.regions.iter()) {
            *len = region.as_ref().map_or(0, Region::len);
        }
        lengths
    }
}
