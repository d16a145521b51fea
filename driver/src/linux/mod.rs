// Licensed under the Apache-2.0 license

//! Backends for running against a real card from user space: BARs mapped
//! through sysfs, buffers pinned with `mlock`.

mod lockmem;
mod mmap;
pub mod pci;

pub use lockmem::{LockedPagePinner, PhysicalMapper};
pub use mmap::MappedBar;
