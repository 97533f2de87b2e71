//! Device table: which flash regions TFS owns.

use alloc::string::String;
use alloc::vec::Vec;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{TfsError, TfsResult};
use crate::flash::{FlashDevice, Sector};

bitflags! {
    pub struct DeviceFlags: u32 {
        /// Volatile RAM emulating flash; contents do not survive a reset.
        const RAM = 0x1;
        /// Initialize the device at mount if its chain is unusable.
        const AUTOINIT = 0x2;
    }
}

/// One TFS region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawDevice", into = "RawDevice")]
pub struct TfsDevice {
    pub prefix: String,
    pub start: u32,
    /// Inclusive.
    pub end: u32,
    pub spare: u32,
    pub spare_size: u32,
    pub sector_count: usize,
    pub flags: DeviceFlags,
}

#[derive(Serialize, Deserialize)]
struct RawDevice {
    prefix: String,
    start: u32,
    end: u32,
    spare: u32,
    spare_size: u32,
    #[serde(default)]
    sector_count: usize,
    #[serde(default)]
    ram: bool,
    #[serde(default)]
    autoinit: bool,
}

impl From<RawDevice> for TfsDevice {
    fn from(raw: RawDevice) -> Self {
        let mut flags = DeviceFlags::empty();
        flags.set(DeviceFlags::RAM, raw.ram);
        flags.set(DeviceFlags::AUTOINIT, raw.autoinit);
        Self {
            prefix: raw.prefix,
            start: raw.start,
            end: raw.end,
            spare: raw.spare,
            spare_size: raw.spare_size,
            sector_count: raw.sector_count,
            flags,
        }
    }
}

impl From<TfsDevice> for RawDevice {
    fn from(dev: TfsDevice) -> Self {
        Self {
            ram: dev.flags.contains(DeviceFlags::RAM),
            autoinit: dev.flags.contains(DeviceFlags::AUTOINIT),
            prefix: dev.prefix,
            start: dev.start,
            end: dev.end,
            spare: dev.spare,
            spare_size: dev.spare_size,
            sector_count: dev.sector_count,
        }
    }
}

impl TfsDevice {
    pub fn new(prefix: &str, start: u32, end: u32, spare: u32, spare_size: u32) -> Self {
        Self {
            prefix: String::from(prefix),
            start,
            end,
            spare,
            spare_size,
            sector_count: 0,
            flags: DeviceFlags::empty(),
        }
    }

    pub fn with_flags(mut self, flags: DeviceFlags) -> Self {
        self.flags = flags;
        self
    }

    /// One past the last byte of the region.
    pub fn limit(&self) -> u32 {
        self.end + 1
    }

    pub fn size(&self) -> u32 {
        self.limit() - self.start
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr <= self.end
    }

    /// Sectors of the region, in address order.
    pub fn sectors<F: FlashDevice + ?Sized>(&self, flash: &F) -> TfsResult<Vec<Sector>> {
        let mut sectors = Vec::new();
        let mut addr = self.start;
        while addr < self.limit() {
            let s = flash.sector_at(addr).ok_or(TfsError::BadArgument)?;
            sectors.push(s);
            addr = s.end();
        }
        Ok(sectors)
    }

    /// Sector hosting the DSI region (the last one).
    pub fn last_sector<F: FlashDevice + ?Sized>(&self, flash: &F) -> TfsResult<Sector> {
        flash.sector_at(self.end).ok_or(TfsError::BadArgument)
    }

    pub fn spare_sector<F: FlashDevice + ?Sized>(&self, flash: &F) -> TfsResult<Sector> {
        flash.sector_at(self.spare).ok_or(TfsError::BadArgument)
    }

    pub fn is_ram(&self) -> bool {
        self.flags.contains(DeviceFlags::RAM)
    }

    fn validate<F: FlashDevice + ?Sized>(&mut self, flash: &F) -> TfsResult<()> {
        if self.prefix.is_empty() || self.end <= self.start {
            return Err(TfsError::BadArgument);
        }
        let first = flash.sector_at(self.start).ok_or(TfsError::BadArgument)?;
        let last = flash.sector_at(self.end).ok_or(TfsError::BadArgument)?;
        if first.base != self.start || last.end() != self.limit() {
            return Err(TfsError::BadArgument);
        }
        let sectors = self.sectors(flash)?;
        if sectors.len() < 2 {
            return Err(TfsError::PartitionTooSmall);
        }
        if self.sector_count != 0 && self.sector_count != sectors.len() {
            return Err(TfsError::BadArgument);
        }
        self.sector_count = sectors.len();

        let spare = flash.sector_at(self.spare).ok_or(TfsError::BadArgument)?;
        let largest = sectors.iter().map(|s| s.size).max().unwrap_or(0);
        if spare.base != self.spare || self.contains(self.spare) {
            return Err(TfsError::BadArgument);
        }
        if self.spare_size < largest || spare.size < largest {
            return Err(TfsError::PartitionTooSmall);
        }
        Ok(())
    }
}

/// Ordered set of devices. The first device receives names without a prefix.
#[derive(Debug, Clone)]
pub struct DeviceTable {
    devices: Vec<TfsDevice>,
    default: Vec<TfsDevice>,
    alternate: bool,
}

/// Field-level override of one device, keyed by prefix.
#[derive(Debug, Clone, Deserialize)]
struct DeviceOverride {
    prefix: String,
    start: Option<u32>,
    end: Option<u32>,
    spare: Option<u32>,
    spare_size: Option<u32>,
}

impl DeviceTable {
    pub fn new(devices: Vec<TfsDevice>) -> Self {
        Self {
            default: devices.clone(),
            devices,
            alternate: false,
        }
    }

    pub fn from_json(data: &[u8]) -> TfsResult<Self> {
        let devices: Vec<TfsDevice> = serde_json::from_slice(data).map_err(|e| {
            log::error!("tfs device table: {}", e);
            TfsError::BadArgument
        })?;
        Ok(Self::new(devices))
    }

    /// Check every device against the flash geometry and fill in sector
    /// counts.
    pub fn validate<F: FlashDevice + ?Sized>(&mut self, flash: &F) -> TfsResult<()> {
        if self.devices.is_empty() {
            return Err(TfsError::BadArgument);
        }
        for dev in self.devices.iter_mut() {
            dev.validate(flash)?;
        }
        for (i, a) in self.devices.iter().enumerate() {
            for b in &self.devices[i + 1..] {
                if a.prefix == b.prefix || (a.start <= b.end && b.start <= a.end) {
                    return Err(TfsError::BadArgument);
                }
            }
            if self.devices.iter().any(|d| d.contains(a.spare)) {
                return Err(TfsError::BadArgument);
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TfsDevice> {
        self.devices.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TfsDevice> {
        self.devices.iter()
    }

    pub fn is_alternate(&self) -> bool {
        self.alternate
    }

    /// Device a file name belongs to: longest matching prefix, else the first.
    pub fn device_for(&self, name: &str) -> usize {
        self.devices
            .iter()
            .enumerate()
            .filter(|(_, d)| name.starts_with(d.prefix.as_str()))
            .max_by_key(|(_, d)| d.prefix.len())
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    pub fn by_prefix(&self, prefix: &str) -> TfsResult<usize> {
        self.devices
            .iter()
            .position(|d| d.prefix == prefix)
            .ok_or(TfsError::UnknownDevicePrefix)
    }

    pub fn is_prefix(&self, name: &str) -> bool {
        self.devices.iter().any(|d| d.prefix == name)
    }

    /// Apply a JSON list of per-prefix overrides on top of the default table.
    pub fn with_override(&self, data: &[u8]) -> TfsResult<Self> {
        if self.alternate {
            return Err(TfsError::AlternateConfigInUse);
        }
        let overrides: Vec<DeviceOverride> = serde_json::from_slice(data).map_err(|e| {
            log::error!("tfs device override: {}", e);
            TfsError::BadArgument
        })?;
        let mut devices = self.default.clone();
        for ov in overrides {
            let dev = devices
                .iter_mut()
                .find(|d| d.prefix == ov.prefix)
                .ok_or(TfsError::UnknownDevicePrefix)?;
            dev.start = ov.start.unwrap_or(dev.start);
            dev.end = ov.end.unwrap_or(dev.end);
            dev.spare = ov.spare.unwrap_or(dev.spare);
            dev.spare_size = ov.spare_size.unwrap_or(dev.spare_size);
            dev.sector_count = 0;
        }
        Ok(Self {
            devices,
            default: self.default.clone(),
            alternate: true,
        })
    }

    pub fn default_table(&self) -> Self {
        Self::new(self.default.clone())
    }
}
