// Licensed under the Apache-2.0 license

//! Finding the card in sysfs and mapping its BARs.

use super::{LockedPagePinner, MappedBar, PhysicalMapper};
use crate::bar::{BarTable, Region};
use crate::device::FpgaDevice;
use crate::error::Result;
use crate::regs::NUM_BARS;
use log::{debug, info};
use piecomm_config::DeviceConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn devices_dir(sysfs_root: &Path) -> PathBuf {
    sysfs_root.join("bus/pci/devices")
}

fn read_id(path: &Path) -> Option<u16> {
    let s = std::fs::read_to_string(path).ok()?;
    let s = s.trim();
    u16::from_str_radix(s.strip_prefix("0x").unwrap_or(s), 16).ok()
}

/// Addresses (`dddd:bb:dd.f`) of every function with the given ids, sorted.
pub fn find_devices(sysfs_root: &Path, vendor: u16, device: u16) -> Result<Vec<String>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(devices_dir(sysfs_root))? {
        let entry = entry?;
        let path = entry.path();
        if read_id(&path.join("vendor")) == Some(vendor)
            && read_id(&path.join("device")) == Some(device)
        {
            found.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    found.sort();
    Ok(found)
}

/// Maps BAR0..2 of the function at `address`. BARs the card does not
/// implement are left empty.
pub fn attach(sysfs_root: &Path, address: &str) -> Result<BarTable> {
    let dir = devices_dir(sysfs_root).join(address);
    let mut bars = BarTable::new();
    for index in 0..NUM_BARS as u8 {
        let path = dir.join(format!("resource{index}"));
        let len = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        if len == 0 {
            debug!("{} BAR{} not present", address, index);
            continue;
        }
        bars.insert(Region::new(index, Box::new(MappedBar::open(&path)?)))?;
        debug!("{} BAR{} mapped, {:#x} bytes", address, index, len);
    }
    Ok(bars)
}

/// Attaches the first card matching `config`'s ids, with `mlock` pinning and
/// physical bus addresses.
pub fn open_first(sysfs_root: &Path, config: DeviceConfig) -> Result<Option<FpgaDevice>> {
    let Some(address) = find_devices(sysfs_root, config.vendor_id, config.device_id)?
        .into_iter()
        .next()
    else {
        return Ok(None);
    };
    info!("Found FPGA at {}", address);
    let bars = attach(sysfs_root, &address)?;
    let pinner = Arc::new(LockedPagePinner::new(config.page_size)?);
    let mapper = Arc::new(PhysicalMapper::new(
        config.page_size,
        cfg!(target_pointer_width = "64"),
    ));
    FpgaDevice::new(config, bars, pinner, mapper).map(Some)
}
