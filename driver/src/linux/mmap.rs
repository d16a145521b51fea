// Licensed under the Apache-2.0 license

use crate::bar::BarIo;
use std::ffi::c_void;
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::Path;

/// A BAR mapped from a sysfs `resourceN` file.
pub struct MappedBar {
    addr: *mut c_void,
    len: usize,
}

// SAFETY: The mapping is device memory shared with the card; every access
// is a single volatile load or store.
unsafe impl Send for MappedBar {}
// SAFETY: See above.
unsafe impl Sync for MappedBar {}

impl MappedBar {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| std::io::Error::other("resource larger than the address space"))?;
        if len == 0 {
            return Err(std::io::Error::other(format!(
                "{} is empty",
                path.display()
            )));
        }
        // SAFETY: The fd is valid for the duration of the call; the result
        // is checked before use.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self { addr, len })
    }

    fn ptr(&self, offset: usize) -> *mut u8 {
        // SAFETY: Callers (through `Region`) keep offset within the mapping.
        unsafe { self.addr.cast::<u8>().add(offset) }
    }
}

impl BarIo for MappedBar {
    fn len(&self) -> usize {
        self.len
    }

    fn read_u32(&self, offset: usize) -> u32 {
        // SAFETY: `Region` checked bounds and 4-byte alignment.
        unsafe { self.ptr(offset).cast::<u32>().read_volatile() }
    }

    fn write_u32(&self, offset: usize, value: u32) {
        // SAFETY: `Region` checked bounds and 4-byte alignment.
        unsafe { self.ptr(offset).cast::<u32>().write_volatile(value) }
    }

    fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            // SAFETY: `Region` checked the whole range.
            *b = unsafe { self.ptr(offset + i).read_volatile() };
        }
    }

    fn write_bytes(&self, offset: usize, buf: &[u8]) {
        for (i, b) in buf.iter().enumerate() {
            // SAFETY: `Region` checked the whole range.
            unsafe { self.ptr(offset + i).write_volatile(*b) };
        }
    }
}

impl Drop for MappedBar {
    fn drop(&mut self) {
        // SAFETY: self holds a live mapping of `len` bytes.
        if unsafe { libc::munmap(self.addr, self.len) } < 0 {
            log::error!("munmap failed: {}", std::io::Error::last_os_error());
        }
    }
}
