//! The per-device linear chain of file records.

use log::{error, warn};

use crate::device::TfsDevice;
use crate::error::{TfsError, TfsResult};
use crate::flash::{crc_range, FlashDevice, FlashError};
use crate::header::{FileFlags, FileHeader, ERASED_HDR_SIZE, HDR_SIZE};

/// A header found in the chain and the address it lives at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    pub addr: u32,
    pub hdr: FileHeader,
}

impl Record {
    pub fn data_addr(&self) -> u32 {
        self.hdr.data_addr(self.addr)
    }

    /// Address of the following record slot.
    pub fn end(&self) -> u32 {
        self.addr + self.hdr.record_len()
    }

    pub fn data_crc<F: FlashDevice + ?Sized>(&self, flash: &F) -> Result<u32, FlashError> {
        let data = self.data_addr();
        crc_range(flash, data, data + self.hdr.file_size)
    }
}

/// What sits at a candidate header address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    End,
    Header(FileHeader),
    Invalid,
}

pub fn read_header<F: FlashDevice + ?Sized>(flash: &F, addr: u32) -> Result<Option<FileHeader>, FlashError> {
    let mut raw = [0u8; HDR_SIZE];
    flash.read(addr, &mut raw)?;
    Ok(FileHeader::decode(&raw))
}

/// Classify the header slot at `addr`.
pub fn validate<F: FlashDevice + ?Sized>(
    flash: &F,
    dev: &TfsDevice,
    addr: u32,
    legacy_delete: bool,
) -> Result<Slot, FlashError> {
    if addr >= dev.limit() {
        return Ok(Slot::End);
    }
    let mut size = [0u8; 2];
    flash.read(addr, &mut size)?;
    if u16::from_le_bytes(size) == ERASED_HDR_SIZE {
        return Ok(Slot::End);
    }
    if addr + HDR_SIZE as u32 > dev.limit() {
        return Ok(Slot::Invalid);
    }
    let hdr = match read_header(flash, addr)? {
        Some(hdr) => hdr,
        None => return Ok(Slot::Invalid),
    };
    if hdr.hdr_size as usize != HDR_SIZE {
        return Ok(Slot::Invalid);
    }
    if hdr.crc_ok() || (legacy_delete && hdr.flags == 0) {
        Ok(Slot::Header(hdr))
    } else {
        Ok(Slot::Invalid)
    }
}

/// `record.next`, if it is a sane successor inside the device.
pub fn next_addr(dev: &TfsDevice, rec: &Record) -> Option<u32> {
    let next = rec.hdr.next;
    let data_end = rec.addr.checked_add(HDR_SIZE as u32)?.checked_add(rec.hdr.file_size)?;
    if next > rec.addr && next >= data_end && next >= dev.start && next <= dev.end {
        Some(next)
    } else {
        None
    }
}

/// How a scan finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainEnd {
    /// Iteration not finished yet.
    Pending,
    /// Erased header slot at this address.
    Clean(u32),
    /// End sentinel found, but flash past it is not erased.
    DirtyTail { end: u32, at: u32 },
    /// Invalid header or next pointer at this address.
    Corrupt(u32),
    Io(FlashError),
}

/// Lazy single pass over a device's records.
pub struct ChainIter<'a, F: ?Sized> {
    flash: &'a F,
    dev: &'a TfsDevice,
    addr: Option<u32>,
    legacy_delete: bool,
    verify_tail: bool,
    end: ChainEnd,
}

impl<'a, F: FlashDevice + ?Sized> ChainIter<'a, F> {
    pub fn new(flash: &'a F, dev: &'a TfsDevice, legacy_delete: bool) -> Self {
        Self {
            flash,
            dev,
            addr: Some(dev.start),
            legacy_delete,
            verify_tail: false,
            end: ChainEnd::Pending,
        }
    }

    /// Also require every byte after the end sentinel to read erased.
    pub fn verify_tail(mut self) -> Self {
        self.verify_tail = true;
        self
    }

    pub fn restart(&mut self) {
        self.addr = Some(self.dev.start);
        self.end = ChainEnd::Pending;
    }

    pub fn end(&self) -> ChainEnd {
        self.end
    }

    /// Drain the iterator and report where the next record would go. A
    /// corrupt record (typically a header torn by a reset) ends the chain;
    /// from there on the device counts as unwritten but dirty space.
    pub fn finish(&mut self) -> TfsResult<u32> {
        while self.next().is_some() {}
        match self.end {
            ChainEnd::Clean(at) | ChainEnd::DirtyTail { end: at, .. } => Ok(at),
            ChainEnd::Corrupt(at) => {
                warn!("tfs {}: chain truncated at 0x{:08x}", self.dev.prefix, at);
                Ok(at)
            }
            ChainEnd::Io(e) => Err(e.into()),
            ChainEnd::Pending => Err(TfsError::CorruptChain),
        }
    }

    fn stop(&mut self, end: ChainEnd) -> Option<Record> {
        self.addr = None;
        self.end = end;
        None
    }

    fn check_tail(&mut self, at: u32) -> Option<Record> {
        if !self.verify_tail {
            return self.stop(ChainEnd::Clean(at));
        }
        match self.flash.is_erased(at, self.dev.limit()) {
            Ok(true) => self.stop(ChainEnd::Clean(at)),
            Ok(false) => {
                let dirty = first_dirty(self.flash, at, self.dev.limit()).unwrap_or(at);
                warn!(
                    "tfs {}: flash not erased past end of chain at 0x{:08x}",
                    self.dev.prefix, dirty
                );
                self.stop(ChainEnd::DirtyTail { end: at, at: dirty })
            }
            Err(e) => self.stop(ChainEnd::Io(e)),
        }
    }
}

impl<'a, F: FlashDevice + ?Sized> Iterator for ChainIter<'a, F> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        let addr = self.addr?;
        match validate(self.flash, self.dev, addr, self.legacy_delete) {
            Err(e) => self.stop(ChainEnd::Io(e)),
            Ok(Slot::End) => self.check_tail(addr),
            Ok(Slot::Invalid) => {
                error!("tfs {}: corrupt header at 0x{:08x}", self.dev.prefix, addr);
                self.stop(ChainEnd::Corrupt(addr))
            }
            Ok(Slot::Header(hdr)) => {
                let rec = Record { addr, hdr };
                match next_addr(self.dev, &rec) {
                    Some(n) => {
                        self.addr = Some(n);
                        Some(rec)
                    }
                    None => {
                        error!(
                            "tfs {}: bad next pointer 0x{:08x} in header at 0x{:08x}",
                            self.dev.prefix, rec.hdr.next, addr
                        );
                        self.stop(ChainEnd::Corrupt(addr))
                    }
                }
            }
        }
    }
}

fn first_dirty<F: FlashDevice + ?Sized>(flash: &F, begin: u32, end: u32) -> Option<u32> {
    let mut buf = [0u8; 64];
    let mut addr = begin;
    while addr < end {
        let len = core::cmp::min(64, end - addr) as usize;
        flash.read(addr, &mut buf[..len]).ok()?;
        if let Some(i) = buf[..len].iter().position(|&b| b != 0xFF) {
            return Some(addr + i as u32);
        }
        addr += len as u32;
    }
    None
}

/// Result of a full-chain verification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub active: usize,
    pub deleted: usize,
    pub stale: usize,
    pub chain_end: u32,
}

/// Verify headers, data CRCs of live records, next pointers and the erased
/// tail of one device.
pub fn check_device<F: FlashDevice + ?Sized>(
    flash: &F,
    dev: &TfsDevice,
    legacy_delete: bool,
) -> TfsResult<CheckReport> {
    let mut report = CheckReport::default();
    let mut bad_crc = false;
    let mut iter = ChainIter::new(flash, dev, legacy_delete).verify_tail();
    for rec in iter.by_ref() {
        if !rec.hdr.is_active() {
            report.deleted += 1;
            continue;
        }
        report.active += 1;
        if rec.hdr.is_stale() {
            report.stale += 1;
        }
        if rec.hdr.flags().contains(FileFlags::IN_PLACE_MODIFIABLE) {
            continue;
        }
        if rec.data_crc(flash)? != rec.hdr.file_crc {
            error!(
                "tfs {}: data crc mismatch for '{}' at 0x{:08x}",
                dev.prefix,
                rec.hdr.name(),
                rec.addr
            );
            bad_crc = true;
        }
    }
    match iter.end() {
        ChainEnd::Clean(at) => report.chain_end = at,
        ChainEnd::Io(e) => return Err(e.into()),
        _ => return Err(TfsError::CorruptChain),
    }
    if bad_crc {
        return Err(TfsError::BadHeaderOrDataCrc);
    }
    Ok(report)
}
