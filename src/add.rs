//! Creating, replacing and removing records.
//!
//! Replacement is crash safe without a journal: the old record is marked
//! stale before the new one is written, and only deleted once the new one
//! has been read back. Startup finishes whatever a reset interrupted.

use alloc::vec::Vec;

use log::{debug, info, warn};

use crate::chain::{ChainIter, Record};
use crate::defrag::{dsi_overhead, DefragOutcome};
use crate::error::{TfsError, TfsResult};
use crate::flash::{align16, crc_range, FlashDevice};
use crate::header::{FileFlags, FileHeader, FileInfo, FileName, FLAGS_OFFSET, HDR_SIZE};
use crate::tfs::{FileEntry, Tfs};

const CMP_CHUNK: usize = 128;

/// Where the content of a new record comes from.
#[derive(Debug, Clone, Copy)]
pub enum DataSource<'a> {
    Ram(&'a [u8]),
    /// Bytes already in flash, e.g. a download buffer.
    Flash { addr: u32, len: u32 },
}

impl<'a> DataSource<'a> {
    pub fn len(&self) -> u32 {
        match self {
            DataSource::Ram(data) => data.len() as u32,
            DataSource::Flash { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn crc<F: FlashDevice + ?Sized>(&self, flash: &F) -> TfsResult<u32> {
        match self {
            DataSource::Ram(data) => Ok(crate::crc::crc32(data)),
            DataSource::Flash { addr, len } => Ok(crc_range(flash, *addr, addr + len)?),
        }
    }

    fn read<F: FlashDevice + ?Sized>(&self, flash: &F, offset: u32, buf: &mut [u8]) -> TfsResult<()> {
        match self {
            DataSource::Ram(data) => {
                let off = offset as usize;
                buf.copy_from_slice(&data[off..off + buf.len()]);
            }
            DataSource::Flash { addr, .. } => flash.read(addr + offset, buf)?,
        }
        Ok(())
    }
}

/// State of a device's chain as seen by add().
struct Scan {
    chain_end: u32,
    active: usize,
    existing: Option<Record>,
}

/// What add() ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// An identical file already exists; nothing was written.
    Unchanged,
    Written { addr: u32 },
}

impl<F: FlashDevice> Tfs<F> {
    pub(crate) fn is_open(&self, name: &str) -> bool {
        self.slots.iter().flatten().any(|f| f.name == name)
    }

    pub(crate) fn validate_new(&self, name: &str, info: &str, flags: FileFlags) -> TfsResult<()> {
        if name.is_empty() {
            return Err(TfsError::NameTooLong);
        }
        FileName::new(name)?;
        FileInfo::new(info)?;
        if self.devices.is_prefix(name) {
            return Err(TfsError::BadArgument);
        }
        if flags.contains(FileFlags::COMPRESSED) {
            return Err(TfsError::FeatureUnavailable);
        }
        if !self.permits(flags) {
            return Err(TfsError::AccessDenied);
        }
        Ok(())
    }

    /// Store `src` as `name`, replacing any current file of that name.
    pub fn add(&mut self, name: &str, info: &str, flags: FileFlags, src: DataSource<'_>) -> TfsResult<AddOutcome> {
        self.validate_new(name, info, flags)?;
        if self.is_open(name) {
            return Err(TfsError::FileInUse);
        }
        self.commit(name, info, flags & FileFlags::user_bits(), src)
    }

    fn scan(&self, idx: usize, name: &str) -> TfsResult<Scan> {
        let dev = self.device(idx)?;
        let mut iter = ChainIter::new(&self.flash, dev, self.legacy_delete());
        let mut active = 0;
        let mut existing: Option<Record> = None;
        for rec in iter.by_ref() {
            if !rec.hdr.is_active() {
                continue;
            }
            active += 1;
            if rec.hdr.name() == name && existing.map_or(true, |e| e.hdr.is_stale()) {
                existing = Some(rec);
            }
        }
        let chain_end = iter.finish()?;
        Ok(Scan {
            chain_end,
            active,
            existing,
        })
    }

    fn same_content(&self, rec: &Record, info: &str, flags: FileFlags, src: &DataSource<'_>, crc: u32) -> TfsResult<bool> {
        if rec.hdr.is_stale()
            || rec.hdr.user_flags() != flags
            || rec.hdr.info() != info
            || rec.hdr.file_size != src.len()
            || rec.hdr.file_crc != crc
        {
            return Ok(false);
        }
        let mut a = [0u8; CMP_CHUNK];
        let mut b = [0u8; CMP_CHUNK];
        let mut off = 0u32;
        while off < src.len() {
            let n = core::cmp::min(CMP_CHUNK as u32, src.len() - off) as usize;
            self.flash.read(rec.data_addr() + off, &mut a[..n])?;
            src.read(&self.flash, off, &mut b[..n])?;
            if a[..n] != b[..n] {
                return Ok(false);
            }
            off += n as u32;
        }
        Ok(true)
    }

    /// Clear `bits` of the flags word of the record at `addr`.
    pub(crate) fn clear_flags(&mut self, addr: u32, hdr: &FileHeader, bits: FileFlags) -> TfsResult<()> {
        let word = hdr.flags & !bits.bits();
        self.flash.program(addr + FLAGS_OFFSET, &word.to_le_bytes())?;
        Ok(())
    }

    fn commit(&mut self, name: &str, info: &str, flags: FileFlags, src: DataSource<'_>) -> TfsResult<AddOutcome> {
        let ipmod = flags.contains(FileFlags::IN_PLACE_MODIFIABLE);
        let idx = self.devices.device_for(name);
        let len = src.len();

        // 1. Pre-image CRC of the source.
        let crc = src.crc(&self.flash)?;

        let mut defragged = false;
        let (dest, existing) = loop {
            // 2. Find the record being replaced and the end of the chain.
            let scan = self.scan(idx, name)?;
            if let Some(old) = scan.existing {
                if self.same_content(&old, info, flags, &src, crc)? {
                    debug!("tfs: '{}' unchanged", name);
                    return Ok(AddOutcome::Unchanged);
                }
            }

            // 3. The record, and a DSI for one more file, must fit. The DSI
            // has to stay inside the last sector.
            let dev = self.device(idx)?;
            let host = dev.last_sector(&self.flash)?;
            let need = align16(HDR_SIZE as u32 + len) as u64;
            let reserve = dsi_overhead(scan.active + 1, dev.sector_count) as u64;
            let dest = scan.chain_end;
            let fits = dest as u64 + need + reserve <= dev.limit() as u64
                && host.base as u64 + reserve <= dev.limit() as u64
                && self.flash.is_erased(dest, dest + HDR_SIZE as u32 + len)?;
            if fits {
                break (dest, scan.existing);
            }
            if defragged || !self.config.defrag_enabled || self.script_running {
                return Err(TfsError::FlashFull);
            }
            info!("tfs: no room for '{}', defragmenting", name);
            match self.defrag_device(idx) {
                Ok(DefragOutcome::Aborted) | Err(TfsError::DsiTableOverflow) => return Err(TfsError::FlashFull),
                Ok(_) => {}
                Err(e) => return Err(e),
            }
            defragged = true;
        };

        // 4. The source must not have changed while we looked for room.
        if !ipmod && src.crc(&self.flash)? != crc {
            return Err(TfsError::SourceChangedDuringWrite);
        }

        // 5. Commit point: the old copy becomes stale.
        if let Some(old) = existing.filter(|r| !r.hdr.is_stale()) {
            self.clear_flags(old.addr, &old.hdr, FileFlags::NOT_STALE)?;
        }

        // 6. Data first, then the header that makes it visible.
        let data_addr = dest + HDR_SIZE as u32;
        match src {
            DataSource::Ram(data) => {
                if !data.is_empty() {
                    self.flash.program(data_addr, data)?;
                }
            }
            DataSource::Flash { addr, len } => {
                crate::flash::copy_range(&mut self.flash, addr, data_addr, len)?;
            }
        }
        let mut hdr = FileHeader::new(name, info, flags, len, crc, self.platform.now())?;
        hdr.next = dest + hdr.record_len();
        hdr.seal();
        self.flash.program(dest, &hdr.encode())?;

        // 7. Read back.
        if crc_range(&self.flash, data_addr, data_addr + len)? != crc {
            warn!("tfs: '{}' reads back with a bad crc at 0x{:08x}", name, dest);
            return Err(TfsError::BadHeaderOrDataCrc);
        }

        // 8. Retire the old copy.
        if let Some(old) = existing {
            let staled = FileHeader {
                flags: old.hdr.flags & !FileFlags::NOT_STALE.bits(),
                ..old.hdr
            };
            self.clear_flags(old.addr, &staled, FileFlags::ACTIVE)?;
        }
        debug!("tfs: '{}' written at 0x{:08x}, {} bytes", name, dest, len);
        Ok(AddOutcome::Written { addr: dest })
    }

    /// Every active record named `name`, stale ones included.
    fn records_named(&self, name: &str) -> Vec<Record> {
        let legacy = self.legacy_delete();
        self.devices
            .iter()
            .flat_map(|dev| ChainIter::new(&self.flash, dev, legacy))
            .filter(|r| r.hdr.is_active() && r.hdr.name() == name)
            .collect()
    }

    pub fn unlink(&mut self, name: &str) -> TfsResult<()> {
        if self.is_open(name) {
            return Err(TfsError::FileInUse);
        }
        let found = self.records_named(name);
        if found.is_empty() {
            return Err(TfsError::NoSuchFile);
        }
        if found.iter().any(|r| !self.permits(r.hdr.flags())) {
            return Err(TfsError::AccessDenied);
        }
        for rec in found {
            self.clear_flags(rec.addr, &rec.hdr, FileFlags::ACTIVE)?;
        }
        Ok(())
    }

    /// Create `linkname` pointing at `target`.
    pub fn link(&mut self, target: &str, linkname: &str) -> TfsResult<()> {
        if self.lookup(target).is_none() {
            return Err(TfsError::LinkError);
        }
        if self.lookup(linkname).is_some() {
            return Err(TfsError::AlreadyExists);
        }
        self.add(linkname, target, FileFlags::SYMLINK, DataSource::Ram(&[]))?;
        Ok(())
    }

    /// Program `data` into an in-place-modifiable file at `offset`. Only
    /// 1 -> 0 bit changes are possible without rewriting the file.
    pub fn ipmod(&mut self, name: &str, offset: u32, data: &[u8]) -> TfsResult<()> {
        let entry: FileEntry = self.lookup(name).ok_or(TfsError::NoSuchFile)?;
        if !entry.flags().contains(FileFlags::IN_PLACE_MODIFIABLE) {
            return Err(TfsError::NotInPlaceModifiable);
        }
        if !self.permits(entry.flags()) {
            return Err(TfsError::AccessDenied);
        }
        let end = offset as u64 + data.len() as u64;
        if end > entry.size() as u64 {
            return Err(TfsError::WriteExceedsFile);
        }
        self.flash.program(entry.data_addr() + offset, data)?;
        Ok(())
    }

    /// Settle records a reset left stale. Returns how many were fixed.
    pub(crate) fn fix_stale(&mut self) -> TfsResult<usize> {
        let legacy = self.legacy_delete();
        let mut fixed = 0;
        for idx in 0..self.devices.len() {
            loop {
                let dev = self.device(idx)?;
                let records: Vec<Record> = ChainIter::new(&self.flash, dev, legacy)
                    .filter(|r| r.hdr.is_active())
                    .collect();
                let stale = match records.iter().find(|r| r.hdr.is_stale()) {
                    Some(rec) => *rec,
                    None => break,
                };
                let name = stale.hdr.name.as_str();
                let replaced = records
                    .iter()
                    .any(|r| r.addr != stale.addr && !r.hdr.is_stale() && r.hdr.name() == name);
                if replaced {
                    info!("tfs: dropping stale copy of '{}' at 0x{:08x}", name, stale.addr);
                    self.clear_flags(stale.addr, &stale.hdr, FileFlags::ACTIVE)?;
                } else {
                    info!("tfs: restoring stale '{}' from 0x{:08x}", name, stale.addr);
                    let mut data = Vec::new();
                    data.try_reserve_exact(stale.hdr.file_size as usize)
                        .map_err(|_| TfsError::AllocationFailed)?;
                    data.resize(stale.hdr.file_size as usize, 0);
                    self.flash.read(stale.data_addr(), &mut data)?;
                    self.commit(
                        stale.hdr.name.as_str(),
                        stale.hdr.info.as_str(),
                        stale.hdr.user_flags(),
                        DataSource::Ram(&data),
                    )?;
                }
                fixed += 1;
            }
        }
        Ok(fixed)
    }
}
