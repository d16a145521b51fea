// Licensed under the Apache-2.0 license

use crate::error::{Error, Result};
use crate::sg::{DmaDirection, DmaMapper, PagePinner, PageRange, PinnedPage, SgEntry};
use log::{debug, warn};
use std::ffi::c_void;
use std::fs::File;
use std::os::unix::fs::FileExt;

const PAGEMAP_PRESENT: u64 = 1 << 63;
const PAGEMAP_PFN_MASK: u64 = 0x3f_ffff_ffff_ffff;

/// Keeps pages resident with `mlock` and looks up their frames in
/// `/proc/self/pagemap`.
///
/// Frame numbers read as zero without `CAP_SYS_ADMIN`; such pages count as
/// not pinned.
pub struct LockedPagePinner {
    pagemap: File,
    page_size: usize,
}

impl LockedPagePinner {
    pub fn new(page_size: usize) -> std::io::Result<Self> {
        Ok(Self {
            pagemap: File::open("/proc/self/pagemap")?,
            page_size,
        })
    }

    fn lock(&self, page_addr: u64) -> std::io::Result<()> {
        // SAFETY: mlock only changes residency; it does not touch contents.
        if unsafe { libc::mlock(page_addr as *const c_void, self.page_size) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn unlock(&self, page_addr: u64) {
        // SAFETY: See `lock`.
        if unsafe { libc::munlock(page_addr as *const c_void, self.page_size) } < 0 {
            warn!(
                "munlock of {:#x} failed: {}",
                page_addr,
                std::io::Error::last_os_error()
            );
        }
    }

    fn frame(&self, page_addr: u64) -> std::io::Result<Option<u64>> {
        let mut entry = [0u8; 8];
        let index = page_addr / self.page_size as u64;
        self.pagemap.read_exact_at(&mut entry, index * 8)?;
        let entry = u64::from_le_bytes(entry);
        if entry & PAGEMAP_PRESENT == 0 {
            return Ok(None);
        }
        Ok(Some(entry & PAGEMAP_PFN_MASK).filter(|pfn| *pfn != 0))
    }
}

impl PagePinner for LockedPagePinner {
    fn pin(&self, range: &PageRange, _dir: DmaDirection) -> Result<Vec<PinnedPage>> {
        let mut pages = Vec::with_capacity(range.num_pages());
        for (page_addr, offset, len) in range.pages() {
            if let Err(e) = self.lock(page_addr) {
                warn!("mlock of {:#x} failed: {}", page_addr, e);
                break;
            }
            match self.frame(page_addr) {
                Ok(Some(pfn)) => pages.push(PinnedPage {
                    page_addr,
                    offset,
                    len,
                    pfn: Some(pfn),
                }),
                Ok(None) => {
                    warn!("No frame for page {:#x}", page_addr);
                    self.unlock(page_addr);
                    break;
                }
                Err(e) => {
                    warn!("pagemap read for {:#x} failed: {}", page_addr, e);
                    self.unlock(page_addr);
                    break;
                }
            }
        }
        Ok(pages)
    }

    fn unpin(&self, page: &PinnedPage, dirty: bool) {
        self.unlock(page.page_addr);
        if dirty {
            debug!("Released device-written page {:#x}", page.page_addr);
        }
    }
}

/// Bus address = physical address, for machines without an IOMMU.
pub struct PhysicalMapper {
    page_size: usize,
    supports_64bit: bool,
}

impl PhysicalMapper {
    pub fn new(page_size: usize, supports_64bit: bool) -> Self {
        Self {
            page_size,
            supports_64bit,
        }
    }
}

impl DmaMapper for PhysicalMapper {
    fn supports_64bit(&self) -> bool {
        self.supports_64bit
    }

    fn map(&self, pages: &[PinnedPage], _dir: DmaDirection) -> Result<Vec<SgEntry>> {
        pages
            .iter()
            .map(|page| {
                let pfn = page.pfn.ok_or_else(|| {
                    Error::Io(std::io::Error::other(format!(
                        "page {:#x} has no frame number",
                        page.page_addr
                    )))
                })?;
                Ok(SgEntry {
                    bus_address: pfn * self.page_size as u64 + page.offset as u64,
                    len: page.len as u64,
                })
            })
            .collect()
    }

    fn unmap(&self, _entries: &[SgEntry], _dir: DmaDirection) {}
}
