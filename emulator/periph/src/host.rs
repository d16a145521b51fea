/*++

Licensed under the Apache-2.0 license.

File Name:

    host.rs

Abstract:

    Host side of the emulated PCIe link: page pinning, an IOMMU-style bus
    address assignment, and the bus-to-host translation the card's DMA
    masters go through.

--*/

use piecomm_driver::{
    DmaDirection, DmaMapper, Error, PagePinner, PageRange, PinnedPage, Result, SgEntry,
};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// How bus addresses are assigned to the pages of one transfer.
#[derive(Clone, Debug)]
pub enum BusLayout {
    /// Page `i` at `base + i * page_size`.
    Contiguous { base: u64 },
    /// Page `i` at `base + i * stride`.
    Strided { base: u64, stride: u64 },
    /// Page `i` at `pages[i]`.
    Explicit(Vec<u64>),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostStats {
    pub pins: u64,
    pub unpins: u64,
    pub dirty_unpins: u64,
    pub unbalanced_unpins: u64,
    pub maps: u64,
    pub unmaps: u64,
    pub pinned_now: u64,
    pub max_pinned: u64,
}

/// A DMA access the card could not complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaFault {
    pub bus_address: u64,
}

/// Memory reachable by the card's DMA masters.
pub trait DmaTarget: Send + Sync {
    fn dma_write(&self, bus_address: u64, data: &[u8]) -> std::result::Result<(), DmaFault>;
    fn dma_read(&self, bus_address: u64, buf: &mut [u8]) -> std::result::Result<(), DmaFault>;
}

#[derive(Clone, Copy)]
struct Mapping {
    host: u64,
    len: u64,
}

struct HostState {
    layout: BusLayout,
    merge_adjacent: bool,
    supports_64bit: bool,
    short_pin: Option<usize>,
    pinned: BTreeMap<u64, u64>,
    mappings: BTreeMap<u64, Mapping>,
    stats: HostStats,
}

/// Pins and maps real process memory. The emulated card reads and writes
/// that memory through the bus addresses handed out by `map`.
pub struct EmulatedHost {
    page_size: usize,
    state: Mutex<HostState>,
}

impl EmulatedHost {
    pub fn new(page_size: usize, layout: BusLayout) -> Self {
        Self {
            page_size,
            state: Mutex::new(HostState {
                layout,
                merge_adjacent: false,
                supports_64bit: true,
                short_pin: None,
                pinned: BTreeMap::new(),
                mappings: BTreeMap::new(),
                stats: HostStats::default(),
            }),
        }
    }

    pub fn set_layout(&self, layout: BusLayout) {
        self.state.lock().unwrap().layout = layout;
    }

    /// Lets `map` merge bus-adjacent pages into one entry, as some IOMMU
    /// drivers do.
    pub fn set_merge_adjacent(&self, merge: bool) {
        self.state.lock().unwrap().merge_adjacent = merge;
    }

    pub fn set_supports_64bit(&self, supported: bool) {
        self.state.lock().unwrap().supports_64bit = supported;
    }

    /// Pin at most `pages` pages per request.
    pub fn set_short_pin(&self, pages: Option<usize>) {
        self.state.lock().unwrap().short_pin = pages;
    }

    pub fn stats(&self) -> HostStats {
        self.state.lock().unwrap().stats
    }

    pub fn mapped_ranges(&self) -> usize {
        self.state.lock().unwrap().mappings.len()
    }

    fn page_bus(&self, layout: &BusLayout, i: usize) -> Result<u64> {
        match layout {
            BusLayout::Contiguous { base } => Ok(base + (i * self.page_size) as u64),
            BusLayout::Strided { base, stride } => Ok(base + i as u64 * stride),
            BusLayout::Explicit(pages) => pages.get(i).copied().ok_or_else(|| {
                Error::Io(std::io::Error::other(format!(
                    "no bus address for page {i}"
                )))
            }),
        }
    }

    fn translate(
        &self,
        bus_address: u64,
        len: usize,
    ) -> std::result::Result<Vec<(u64, usize)>, DmaFault> {
        let state = self.state.lock().unwrap();
        let mut pieces = Vec::new();
        let mut bus = bus_address;
        let end = bus_address + len as u64;
        while bus < end {
            let (start, mapping) = state
                .mappings
                .range(..=bus)
                .next_back()
                .filter(|(start, m)| bus < *start + m.len)
                .ok_or(DmaFault { bus_address: bus })?;
            let n = (start + mapping.len).min(end) - bus;
            pieces.push((mapping.host + (bus - start), n as usize));
            bus += n;
        }
        Ok(pieces)
    }
}

impl PagePinner for EmulatedHost {
    fn pin(&self, range: &PageRange, _dir: DmaDirection) -> Result<Vec<PinnedPage>> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let limit = state.short_pin.unwrap_or(usize::MAX);
        let pages: Vec<_> = range
            .pages()
            .take(limit)
            .map(|(page_addr, offset, len)| PinnedPage {
                page_addr,
                offset,
                len,
                pfn: Some(page_addr / self.page_size as u64),
            })
            .collect();
        for page in &pages {
            *state.pinned.entry(page.page_addr).or_default() += 1;
        }
        state.stats.pins += pages.len() as u64;
        state.stats.pinned_now += pages.len() as u64;
        state.stats.max_pinned = state.stats.max_pinned.max(state.stats.pinned_now);
        Ok(pages)
    }

    fn unpin(&self, page: &PinnedPage, dirty: bool) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        match state.pinned.get_mut(&page.page_addr) {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    state.pinned.remove(&page.page_addr);
                }
                state.stats.unpins += 1;
                state.stats.pinned_now -= 1;
                if dirty {
                    state.stats.dirty_unpins += 1;
                }
            }
            None => state.stats.unbalanced_unpins += 1,
        }
    }
}

impl DmaMapper for EmulatedHost {
    fn supports_64bit(&self) -> bool {
        self.state.lock().unwrap().supports_64bit
    }

    fn map(&self, pages: &[PinnedPage], _dir: DmaDirection) -> Result<Vec<SgEntry>> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let page_buses = (0..pages.len())
            .map(|i| self.page_bus(&state.layout, i))
            .collect::<Result<Vec<_>>>()?;
        let mut entries: Vec<SgEntry> = Vec::with_capacity(pages.len());
        for (page, page_bus) in pages.iter().zip(page_buses) {
            let bus = page_bus + page.offset as u64;
            let len = page.len as u64;
            state.mappings.insert(
                bus,
                Mapping {
                    host: page.page_addr + page.offset as u64,
                    len,
                },
            );
            match entries.last_mut() {
                Some(last) if state.merge_adjacent && last.bus_address + last.len == bus => {
                    last.len += len;
                }
                _ => entries.push(SgEntry {
                    bus_address: bus,
                    len,
                }),
            }
        }
        state.stats.maps += 1;
        Ok(entries)
    }

    fn unmap(&self, entries: &[SgEntry], _dir: DmaDirection) {
        let mut state = self.state.lock().unwrap();
        for entry in entries {
            let starts: Vec<u64> = state
                .mappings
                .range(entry.bus_address..entry.bus_address + entry.len)
                .map(|(start, _)| *start)
                .collect();
            for start in starts {
                state.mappings.remove(&start);
            }
        }
        state.stats.unmaps += 1;
    }
}

impl DmaTarget for EmulatedHost {
    fn dma_write(&self, bus_address: u64, data: &[u8]) -> std::result::Result<(), DmaFault> {
        let mut copied = 0;
        for (host, n) in self.translate(bus_address, data.len())? {
            // SAFETY: `host` lies inside a page pinned and mapped for this
            // transfer; the owner of the buffer is blocked in the driver
            // until the transfer completes.
            unsafe {
                std::ptr::copy_nonoverlapping(data[copied..].as_ptr(), host as *mut u8, n);
            }
            copied += n;
        }
        Ok(())
    }

    fn dma_read(&self, bus_address: u64, buf: &mut [u8]) -> std::result::Result<(), DmaFault> {
        let mut copied = 0;
        for (host, n) in self.translate(bus_address, buf.len())? {
            // SAFETY: See `dma_write`.
            unsafe {
                std::ptr::copy_nonoverlapping(host as *const u8, buf[copied..].as_mut_ptr(), n);
            }
            copied += n;
        }
        Ok(())
    }
}
