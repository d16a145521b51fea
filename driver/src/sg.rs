// Licensed under the Apache-2.0 license

//! Pinning a user buffer and describing it as a scatter-gather list.

use crate::error::{Error, Result};
use log::{debug, error};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmaDirection {
    /// The engine writes into host memory (a read from the caller's view).
    FromDevice,
    /// The engine reads host memory.
    ToDevice,
}

/// The pages covering `[addr, addr + len)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRange {
    pub addr: u64,
    pub len: usize,
    pub page_size: usize,
}

impl PageRange {
    pub fn covering(addr: u64, len: usize, page_size: usize) -> Self {
        Self {
            addr,
            len,
            page_size,
        }
    }

    /// Offset of `addr` inside its page.
    pub fn first_offset(&self) -> usize {
        (self.addr % self.page_size as u64) as usize
    }

    pub fn first_page(&self) -> u64 {
        self.addr - self.first_offset() as u64
    }

    pub fn num_pages(&self) -> usize {
        if self.len == 0 {
            return 0;
        }
        (self.first_offset() + self.len).div_ceil(self.page_size)
    }

    pub fn page_addr(&self, i: usize) -> u64 {
        self.first_page() + (i * self.page_size) as u64
    }

    /// Part of page `i` that belongs to the buffer, as `(offset, len)`.
    /// Only the first and last pages can be partial.
    pub fn chunk(&self, i: usize) -> (usize, usize) {
        let start = if i == 0 { self.first_offset() } else { 0 };
        let buffer_end = self.first_offset() + self.len;
        let end = buffer_end.min((i + 1) * self.page_size) - i * self.page_size;
        (start, end - start)
    }

    pub fn pages(&self) -> impl Iterator<Item = (u64, usize, usize)> + '_ {
        (0..self.num_pages()).map(|i| {
            let (offset, len) = self.chunk(i);
            (self.page_addr(i), offset, len)
        })
    }
}

/// One page of the caller's buffer, held resident for the transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PinnedPage {
    pub page_addr: u64,
    pub offset: usize,
    pub len: usize,
    /// Physical frame number, where the pinner can tell.
    pub pfn: Option<u64>,
}

/// A device-visible piece of the buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SgEntry {
    pub bus_address: u64,
    pub len: u64,
}

pub trait PagePinner: Send + Sync {
    /// Pins the pages of `range` in ascending order. May return fewer pages
    /// than `range.num_pages()`; the ones returned are pinned either way.
    fn pin(&self, range: &PageRange, dir: DmaDirection) -> Result<Vec<PinnedPage>>;

    fn unpin(&self, page: &PinnedPage, dirty: bool);
}

/// The platform's DMA mapping layer (an IOMMU, or the identity).
pub trait DmaMapper: Send + Sync {
    fn supports_64bit(&self) -> bool;

    /// Produces bus addresses for `pages`, in order. Adjacent pages may be
    /// merged into a single entry.
    fn map(&self, pages: &[PinnedPage], dir: DmaDirection) -> Result<Vec<SgEntry>>;

    fn unmap(&self, entries: &[SgEntry], dir: DmaDirection);
}

/// Pages pinned for one transfer. Every page is unpinned exactly once, when
/// this is dropped.
pub struct PinnedBuffer<'a> {
    pinner: &'a dyn PagePinner,
    pages: Vec<PinnedPage>,
    dirty: bool,
}

impl<'a> PinnedBuffer<'a> {
    pub fn pin(pinner: &'a dyn PagePinner, range: &PageRange, dir: DmaDirection) -> Result<Self> {
        let expected = range.num_pages();
        let pages = pinner.pin(range, dir)?;
        let pinned = pages.len();
        let buffer = Self {
            pinner,
            pages,
            dirty: false,
        };
        if pinned != expected {
            error!(
                "Pinned {} of {} pages at {:#x}, releasing",
                pinned, expected, range.addr
            );
            drop(buffer);
            return Err(Error::ShortPin { pinned, expected });
        }
        debug!("Pinned {} pages at {:#x}", pinned, range.first_page());
        Ok(buffer)
    }

    pub fn pages(&self) -> &[PinnedPage] {
        &self.pages
    }

    /// Marks every page as written by the device.
    pub fn set_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn release(self) {}
}

impl Drop for PinnedBuffer<'_> {
    fn drop(&mut self) {
        for page in self.pages.drain(..) {
            self.pinner.unpin(&page, self.dirty);
        }
    }
}

/// A scatter-gather list that stays mapped for device access until dropped.
pub struct MappedSg<'a> {
    mapper: &'a dyn DmaMapper,
    entries: Vec<SgEntry>,
    dir: DmaDirection,
}

impl<'a> MappedSg<'a> {
    pub fn map(mapper: &'a dyn DmaMapper, pages: &[PinnedPage], dir: DmaDirection) -> Result<Self> {
        let entries = mapper.map(pages, dir)?;
        debug!(
            "Mapped {} pages into {} scatter-gather entries",
            pages.len(),
            entries.len()
        );
        Ok(Self {
            mapper,
            entries,
            dir,
        })
    }

    pub fn entries(&self) -> &[SgEntry] {
        &self.entries
    }

    /// Fails if any entry ends above 4 GiB.
    pub fn check_32bit(&self) -> Result<()> {
        for entry in &self.entries {
            let end = entry.bus_address + entry.len.saturating_sub(1);
            if end > u64::from(u32::MAX) {
                return Err(Error::AddressTooWide {
                    bus_address: entry.bus_address,
                });
            }
        }
        Ok(())
    }
}

impl Drop for MappedSg<'_> {
    fn drop(&mut self) {
        self.mapper.unmap(&self.entries, self.dir);
    }
}
