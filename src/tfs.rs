//! The TFS context: device table, configuration, open-file table and the
//! flash they all live on. Embedders own one `Tfs` and drive every call
//! through it; there is no global state.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use log::{error, info, warn};
use serde::Serialize;
use spin::Mutex;

use crate::chain::{check_device, read_header, ChainEnd, ChainIter, CheckReport};
use crate::config::TfsConfig;
use crate::defrag::{self, dsi_overhead, DefragOutcome, DefragState, DefragStatus};
use crate::device::{DeviceFlags, DeviceTable, TfsDevice};
use crate::error::{TfsError, TfsResult};
use crate::file::OpenFile;
use crate::flash::{crc_range, FlashDevice};
use crate::header::{FileFlags, FileHeader};
use crate::platform::{Headless, Platform};

/// A TFS context shared between tasks.
pub type LockedTfs<F> = Mutex<Tfs<F>>;

pub struct Tfs<F: FlashDevice> {
    pub(crate) flash: F,
    pub(crate) devices: DeviceTable,
    pub(crate) config: TfsConfig,
    pub(crate) platform: Box<dyn Platform>,
    pub(crate) slots: Vec<Option<OpenFile>>,
    /// Bumped whenever records may have moved.
    pub(crate) epoch: u32,
    pub(crate) script_running: bool,
}

/// A file as found by a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileEntry {
    /// Index into the device table; `None` for a manufactured header.
    pub device: Option<usize>,
    /// Header address (data address for a manufactured header).
    pub addr: u32,
    pub hdr: FileHeader,
}

impl FileEntry {
    pub fn name(&self) -> &str {
        self.hdr.name()
    }

    pub fn info(&self) -> &str {
        self.hdr.info()
    }

    pub fn size(&self) -> u32 {
        self.hdr.file_size
    }

    pub fn flags(&self) -> FileFlags {
        self.hdr.user_flags()
    }

    pub fn data_addr(&self) -> u32 {
        match self.device {
            Some(_) => self.hdr.data_addr(self.addr),
            None => self.addr,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        self.device.is_none()
    }
}

/// Space accounting of one device or of all of them.
///
/// `live_data + live_overhead + dead_data + dead_overhead + device_overhead
/// == total - free` always holds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemUsage {
    pub total: u32,
    pub free: u32,
    pub live_files: usize,
    pub live_data: u32,
    pub live_overhead: u32,
    pub dead_files: usize,
    pub dead_data: u32,
    pub dead_overhead: u32,
    /// Space held back for the defrag state table.
    pub device_overhead: u32,
}

impl MemUsage {
    fn merge(&mut self, other: &MemUsage) {
        self.total += other.total;
        self.free += other.free;
        self.live_files += other.live_files;
        self.live_data += other.live_data;
        self.live_overhead += other.live_overhead;
        self.dead_files += other.dead_files;
        self.dead_data += other.dead_data;
        self.dead_overhead += other.dead_overhead;
        self.device_overhead += other.device_overhead;
    }

    pub fn to_json(&self) -> TfsResult<String> {
        serde_json::to_string(self).map_err(|_| TfsError::AllocationFailed)
    }
}

/// What startup found and repaired.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MountReport {
    pub recovered: Vec<(String, DefragOutcome)>,
    pub restaged: Vec<String>,
    pub initialized: Vec<String>,
    pub stale_fixed: usize,
}

impl<F: FlashDevice> Tfs<F> {
    /// Build a context over `flash`. Nothing is written until [`Tfs::mount`].
    pub fn new(flash: F, mut devices: DeviceTable, config: TfsConfig) -> TfsResult<Self> {
        devices.validate(&flash)?;
        let mut slots = Vec::new();
        slots.resize_with(config.max_open, || None);
        Ok(Self {
            flash,
            devices,
            config,
            platform: Box::new(Headless),
            slots,
            epoch: 0,
            script_running: false,
        })
    }

    pub fn with_platform(mut self, platform: Box<dyn Platform>) -> Self {
        self.platform = platform;
        self
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn into_flash(self) -> F {
        self.flash
    }

    pub fn config(&self) -> &TfsConfig {
        &self.config
    }

    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    pub(crate) fn device(&self, idx: usize) -> TfsResult<&TfsDevice> {
        self.devices.get(idx).ok_or(TfsError::BadArgument)
    }

    pub(crate) fn legacy_delete(&self) -> bool {
        self.config.legacy_delete_compat
    }

    pub(crate) fn permits(&self, flags: FileFlags) -> bool {
        flags.level() <= self.config.user_level
    }

    /// Startup: finish interrupted defrags, settle interrupted restages,
    /// initialize unusable auto-init devices, then repair stale files.
    pub fn mount(&mut self) -> TfsResult<MountReport> {
        let legacy = self.legacy_delete();
        let mut report = MountReport::default();
        let mut held_spares = Vec::new();

        for idx in 0..self.devices.len() {
            let dev = self.device(idx)?.clone();
            let assessment = defrag::assess(&self.flash, &dev)?;
            if assessment.plan.is_none() {
                continue;
            }
            let outcome = defrag::resume(&mut self.flash, &dev, legacy, &mut *self.platform, assessment)?;
            if outcome == DefragOutcome::Aborted {
                warn!("tfs {}: defrag left unfinished", dev.prefix);
                held_spares.push(dev.spare);
            }
            report.recovered.push((dev.prefix.clone(), outcome));
        }

        for idx in 0..self.devices.len() {
            let dev = self.device(idx)?.clone();
            if held_spares.contains(&dev.spare) {
                continue;
            }
            if defrag::assess(&self.flash, &dev)?.status.state == DefragState::BuildingDsi
                && defrag::repair_restage(&mut self.flash, &dev)?
            {
                report.restaged.push(dev.prefix.clone());
            }
        }

        for idx in 0..self.devices.len() {
            let dev = self.device(idx)?;
            if !dev.flags.intersects(DeviceFlags::RAM | DeviceFlags::AUTOINIT) {
                continue;
            }
            let mut iter = ChainIter::new(&self.flash, dev, legacy).verify_tail();
            while iter.next().is_some() {}
            if let ChainEnd::Corrupt(at) = iter.end() {
                let prefix = dev.prefix.clone();
                warn!("tfs {}: chain unusable at 0x{:08x}, initializing", prefix, at);
                self.init_sectors(idx)?;
                report.initialized.push(prefix);
            }
        }

        report.stale_fixed = self.fix_stale()?;
        self.epoch = self.epoch.wrapping_add(1);
        info!(
            "tfs: mounted {} devices, {} stale files fixed",
            self.devices.len(),
            report.stale_fixed
        );
        Ok(report)
    }

    /// Active record named `name`; a non-stale copy wins over a stale one.
    pub(crate) fn lookup(&self, name: &str) -> Option<FileEntry> {
        let legacy = self.legacy_delete();
        let mut stale = None;
        for (idx, dev) in self.devices.iter().enumerate() {
            for rec in ChainIter::new(&self.flash, dev, legacy) {
                if !rec.hdr.is_active() || rec.hdr.name() != name {
                    continue;
                }
                let entry = FileEntry {
                    device: Some(idx),
                    addr: rec.addr,
                    hdr: rec.hdr,
                };
                if !rec.hdr.is_stale() {
                    return Some(entry);
                }
                stale.get_or_insert(entry);
            }
        }
        stale
    }

    /// Look `name` up, following one level of symbolic link.
    pub(crate) fn resolve(&self, name: &str) -> TfsResult<FileEntry> {
        if let Some(fake) = self.fake_header(name) {
            return Ok(fake);
        }
        let entry = self.lookup(name).ok_or(TfsError::NoSuchFile)?;
        if !entry.hdr.flags().contains(FileFlags::SYMLINK) {
            return Ok(entry);
        }
        match self.lookup(entry.info()) {
            Some(target) if !target.hdr.flags().contains(FileFlags::SYMLINK) => Ok(target),
            _ => Err(TfsError::LinkError),
        }
    }

    pub fn stat(&self, name: &str) -> Option<FileEntry> {
        self.resolve(name).ok()
    }

    pub fn lstat(&self, name: &str) -> Option<FileEntry> {
        self.fake_header(name).or_else(|| self.lookup(name))
    }

    /// `0x<addr>` names a header stored outside every device;
    /// `0x<addr>,<size>` names raw executable bytes.
    fn fake_header(&self, name: &str) -> Option<FileEntry> {
        if !self.config.fake_headers {
            return None;
        }
        let rest = name.strip_prefix("0x")?;
        let (addr, size) = match rest.split_once(',') {
            Some((addr, size)) => (addr, Some(size)),
            None => (rest, None),
        };
        let addr = u32::from_str_radix(addr, 16).ok()?;
        if self.devices.iter().any(|d| d.contains(addr)) {
            return None;
        }
        match size {
            None => {
                let hdr = read_header(&self.flash, addr).ok()??;
                hdr.crc_ok().then(|| FileEntry {
                    device: None,
                    addr: hdr.data_addr(addr),
                    hdr,
                })
            }
            Some(size) => {
                let size = parse_number(size)?;
                let crc = crc_range(&self.flash, addr, addr.checked_add(size)?).ok()?;
                let flags = FileFlags::EXECUTABLE | FileFlags::BINARY_EXEC;
                let mut hdr = FileHeader::new(name, "", flags, size, crc, 0).ok()?;
                hdr.reserved[0] = addr;
                hdr.seal();
                Some(FileEntry {
                    device: None,
                    addr,
                    hdr,
                })
            }
        }
    }

    /// Entry of a runnable file.
    pub fn executable(&self, name: &str) -> TfsResult<FileEntry> {
        let entry = self.resolve(name)?;
        if entry.flags().intersects(FileFlags::EXECUTABLE | FileFlags::BINARY_EXEC) {
            Ok(entry)
        } else {
            Err(TfsError::NotExecutable)
        }
    }

    /// Active files whose name starts with `filter`, in device and chain
    /// order.
    pub fn list(&self, filter: Option<&str>) -> Vec<FileEntry> {
        let legacy = self.legacy_delete();
        let mut out = Vec::new();
        for (idx, dev) in self.devices.iter().enumerate() {
            for rec in ChainIter::new(&self.flash, dev, legacy) {
                if rec.hdr.is_active() && filter.map_or(true, |f| rec.hdr.name().starts_with(f)) {
                    out.push(FileEntry {
                        device: Some(idx),
                        addr: rec.addr,
                        hdr: rec.hdr,
                    });
                }
            }
        }
        out
    }

    /// Full verification of one device.
    pub fn check(&self, prefix: &str) -> TfsResult<CheckReport> {
        let idx = self.devices.by_prefix(prefix)?;
        check_device(&self.flash, self.device(idx)?, self.legacy_delete())
    }

    /// Verify every device, logging each failure; returns the first one.
    pub fn check_all(&self) -> TfsResult<()> {
        let mut first = Ok(());
        for dev in self.devices.iter() {
            if let Err(e) = check_device(&self.flash, dev, self.legacy_delete()) {
                error!("tfs {}: check failed: {}", dev.prefix, e);
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        first
    }

    fn device_usage(&self, dev: &TfsDevice) -> TfsResult<MemUsage> {
        let mut u = MemUsage {
            total: dev.size(),
            ..MemUsage::default()
        };
        let mut iter = ChainIter::new(&self.flash, dev, self.legacy_delete());
        for rec in iter.by_ref() {
            let data = rec.hdr.file_size;
            let overhead = rec.hdr.next - rec.addr - data;
            if rec.hdr.is_active() {
                u.live_files += 1;
                u.live_data += data;
                u.live_overhead += overhead;
            } else {
                u.dead_files += 1;
                u.dead_data += data;
                u.dead_overhead += overhead;
            }
        }
        let room = dev.limit() - iter.finish()?;
        u.device_overhead = dsi_overhead(u.live_files, dev.sector_count).min(room);
        u.free = room - u.device_overhead;
        Ok(u)
    }

    /// Space accounting for one device, or all of them.
    pub fn mem_usage(&self, prefix: Option<&str>) -> TfsResult<MemUsage> {
        match prefix {
            Some(p) => {
                let idx = self.devices.by_prefix(p)?;
                self.device_usage(self.device(idx)?)
            }
            None => {
                let mut total = MemUsage::default();
                for dev in self.devices.iter() {
                    total.merge(&self.device_usage(dev)?);
                }
                Ok(total)
            }
        }
    }

    fn check_defrag_allowed(&self) -> TfsResult<()> {
        if self.script_running {
            return Err(TfsError::CannotRunFromStartupScript);
        }
        if !self.config.defrag_enabled {
            return Err(TfsError::DefragDisabled);
        }
        Ok(())
    }

    pub(crate) fn defrag_device(&mut self, idx: usize) -> TfsResult<DefragOutcome> {
        if self.platform.abort_requested() {
            warn!("tfs: defrag aborted from console");
            return Ok(DefragOutcome::Aborted);
        }
        let dev = self.device(idx)?.clone();
        let legacy = self.legacy_delete();
        let outcome = defrag::run(&mut self.flash, &dev, legacy, &mut *self.platform)?;
        if outcome != DefragOutcome::NothingToDo {
            self.epoch = self.epoch.wrapping_add(1);
        }
        Ok(outcome)
    }

    /// Explicit defrag of the device with `prefix`.
    pub fn defrag(&mut self, prefix: &str) -> TfsResult<DefragOutcome> {
        self.check_defrag_allowed()?;
        let idx = self.devices.by_prefix(prefix)?;
        self.defrag_device(idx)
    }

    pub fn defrag_all(&mut self) -> TfsResult<()> {
        self.check_defrag_allowed()?;
        for idx in 0..self.devices.len() {
            self.defrag_device(idx)?;
        }
        Ok(())
    }

    /// Report, without changing anything, where a defrag of `prefix` stands.
    pub fn defrag_status(&self, prefix: &str) -> TfsResult<DefragStatus> {
        let idx = self.devices.by_prefix(prefix)?;
        Ok(defrag::assess(&self.flash, self.device(idx)?)?.status)
    }

    fn init_sectors(&mut self, idx: usize) -> TfsResult<bool> {
        let dev = self.device(idx)?.clone();
        for s in dev.sectors(&self.flash)? {
            if self.platform.abort_requested() {
                warn!("tfs {}: init aborted at sector {}", dev.prefix, s.number);
                return Ok(false);
            }
            if !self.flash.is_erased(s.base, s.end())? {
                self.flash.erase(s.number)?;
            }
            self.platform.watchdog();
        }
        let spare = dev.spare_sector(&self.flash)?;
        if !self.flash.is_erased(spare.base, spare.end())? {
            self.flash.erase(spare.number)?;
        }
        self.epoch = self.epoch.wrapping_add(1);
        info!("tfs {}: initialized", dev.prefix);
        Ok(true)
    }

    /// Erase one device (or all of them). Returns false if the console
    /// aborted part way.
    pub fn init_device(&mut self, prefix: Option<&str>) -> TfsResult<bool> {
        let targets: Vec<usize> = match prefix {
            Some(p) => alloc::vec![self.devices.by_prefix(p)?],
            None => (0..self.devices.len()).collect(),
        };
        for &idx in &targets {
            if self.slots.iter().flatten().any(|f| f.device == Some(idx)) {
                return Err(TfsError::FileInUse);
            }
        }
        for idx in targets {
            if !self.init_sectors(idx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn swap_devices(&mut self, mut table: DeviceTable) -> TfsResult<()> {
        if self.open_count() > 0 {
            return Err(TfsError::FileInUse);
        }
        table.validate(&self.flash)?;
        self.devices = table;
        self.epoch = self.epoch.wrapping_add(1);
        Ok(())
    }

    /// Switch to an alternate device table: the default one with the JSON
    /// per-prefix overrides applied.
    pub fn reconfigure(&mut self, overrides: &[u8]) -> TfsResult<()> {
        let table = self.devices.with_override(overrides)?;
        self.swap_devices(table)?;
        info!("tfs: alternate device table in use");
        Ok(())
    }

    pub fn restore_default_config(&mut self) -> TfsResult<()> {
        let table = self.devices.default_table();
        self.swap_devices(table)
    }

    pub fn set_user_level(&mut self, level: u8) -> TfsResult<()> {
        if level > 3 {
            return Err(TfsError::BadArgument);
        }
        self.config.user_level = level;
        Ok(())
    }

    /// While the startup script runs, defrag is refused.
    pub fn set_script_running(&mut self, running: bool) {
        self.script_running = running;
    }
}

/// Decimal, or hex with a `0x` prefix.
fn parse_number(s: &str) -> Option<u32> {
    match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}
