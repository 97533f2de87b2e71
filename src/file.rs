//! Open-file table.
//!
//! Readers read straight from flash. Writers collect the whole file in RAM
//! and commit it with add() on close, so a file is never half-written on
//! flash.

use alloc::string::String;
use alloc::vec::Vec;

use bitflags::bitflags;
use log::{debug, warn};

use crate::add::DataSource;
use crate::error::{TfsError, TfsResult};
use crate::flash::{crc_range, FlashDevice};
use crate::header::FileFlags;
use crate::tfs::{FileEntry, Tfs};

bitflags! {
    pub struct OpenMode: u32 {
        const READ = 0x1;
        /// Start from an empty buffer.
        const CREATE = 0x2;
        /// Start from the current content, positioned at its end.
        const APPEND = 0x4;
    }
}

/// Handle of an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fd(usize);

impl Fd {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

pub(crate) struct OpenFile {
    pub name: String,
    pub device: Option<usize>,
    mode: OpenMode,
    offset: u32,
    /// Readers: where the data is, valid for `epoch`.
    entry: Option<FileEntry>,
    epoch: u32,
    /// Writers: the whole pending content.
    buf: Vec<u8>,
    flags: FileFlags,
    info: String,
}

impl OpenFile {
    fn writable(&self) -> bool {
        !self.mode.contains(OpenMode::READ)
    }

    /// High-water mark: the current length of the file as this slot sees it.
    fn hwm(&self) -> u32 {
        match &self.entry {
            Some(e) if !self.writable() => e.size(),
            _ => self.buf.len() as u32,
        }
    }
}

impl<F: FlashDevice> Tfs<F> {
    pub fn open_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    fn free_slot(&self) -> TfsResult<usize> {
        self.slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(TfsError::NoFreeSlot)
    }

    fn slot(&self, fd: Fd) -> TfsResult<&OpenFile> {
        self.slots
            .get(fd.0)
            .and_then(|s| s.as_ref())
            .ok_or(TfsError::InvalidDescriptor)
    }

    fn slot_mut(&mut self, fd: Fd) -> TfsResult<&mut OpenFile> {
        self.slots
            .get_mut(fd.0)
            .and_then(|s| s.as_mut())
            .ok_or(TfsError::InvalidDescriptor)
    }

    pub fn open(&mut self, name: &str, mode: OpenMode) -> TfsResult<Fd> {
        if mode.bits().count_ones() != 1 {
            return Err(TfsError::BadArgument);
        }
        let idx = self.free_slot()?;
        let file = if mode == OpenMode::READ {
            self.open_reader(name)?
        } else {
            self.open_writer(name, mode)?
        };
        debug!("tfs: open '{}' {:?} as fd {}", file.name, mode, idx);
        self.slots[idx] = Some(file);
        Ok(Fd(idx))
    }

    fn open_reader(&self, name: &str) -> TfsResult<OpenFile> {
        let entry = self.resolve(name)?;
        let flags = entry.flags();
        if flags.contains(FileFlags::UNREADABLE) || !self.permits(flags) {
            return Err(TfsError::AccessDenied);
        }
        if !flags.contains(FileFlags::IN_PLACE_MODIFIABLE) {
            let data = entry.data_addr();
            if crc_range(&self.flash, data, data + entry.size())? != entry.hdr.file_crc {
                return Err(TfsError::BadHeaderOrDataCrc);
            }
        }
        Ok(OpenFile {
            name: String::from(if entry.is_synthetic() { name } else { entry.name() }),
            device: entry.device,
            mode: OpenMode::READ,
            offset: 0,
            entry: Some(entry),
            epoch: self.epoch,
            buf: Vec::new(),
            flags,
            info: String::from(entry.info()),
        })
    }

    fn open_writer(&self, name: &str, mode: OpenMode) -> TfsResult<OpenFile> {
        let current = match self.resolve(name) {
            Ok(entry) if !entry.is_synthetic() => Some(entry),
            Ok(_) => return Err(TfsError::ReadOnly),
            Err(TfsError::NoSuchFile) if mode == OpenMode::CREATE => None,
            Err(e) => return Err(e),
        };
        let target = current.as_ref().map_or(name, |e| e.name());
        self.validate_new(target, "", FileFlags::empty())?;
        if self.is_open(target) {
            return Err(TfsError::FileInUse);
        }
        if let Some(e) = &current {
            if !self.permits(e.flags()) {
                return Err(TfsError::AccessDenied);
            }
        }

        let mut buf = Vec::new();
        if mode == OpenMode::APPEND {
            if let Some(e) = &current {
                buf.try_reserve_exact(e.size() as usize)
                    .map_err(|_| TfsError::AllocationFailed)?;
                buf.resize(e.size() as usize, 0);
                self.flash.read(e.data_addr(), &mut buf)?;
            }
        }
        Ok(OpenFile {
            name: String::from(target),
            device: Some(self.devices.device_for(target)),
            mode,
            offset: buf.len() as u32,
            entry: None,
            epoch: self.epoch,
            buf,
            flags: current.map_or(FileFlags::empty(), |e| e.flags()),
            info: current.map_or(String::new(), |e| String::from(e.info())),
        })
    }

    /// Open `name` for writing with the flags and info the file will get.
    pub fn create(&mut self, name: &str, flags: FileFlags, info: &str) -> TfsResult<Fd> {
        self.validate_new(name, info, flags)?;
        let fd = self.open(name, OpenMode::CREATE)?;
        let file = self.slot_mut(fd)?;
        file.flags = flags & FileFlags::user_bits();
        file.info = String::from(info);
        Ok(fd)
    }

    /// Reader's entry, looked up again if a defrag ran since it was cached.
    fn reader_entry(&mut self, fd: Fd) -> TfsResult<FileEntry> {
        let epoch = self.epoch;
        let file = self.slot(fd)?;
        let cached = file.entry.ok_or(TfsError::InvalidDescriptor)?;
        if file.epoch == epoch || cached.is_synthetic() {
            return Ok(cached);
        }
        let fresh = self
            .lookup(&file.name)
            .filter(|e| e.hdr.hdr_crc == cached.hdr.hdr_crc)
            .ok_or(TfsError::NoSuchFile)?;
        let file = self.slot_mut(fd)?;
        file.entry = Some(fresh);
        file.epoch = epoch;
        Ok(fresh)
    }

    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> TfsResult<usize> {
        let file = self.slot(fd)?;
        let (offset, hwm) = (file.offset, file.hwm());
        if offset >= hwm {
            return Err(TfsError::EndOfFile);
        }
        let n = core::cmp::min(buf.len() as u32, hwm - offset) as usize;
        if file.writable() {
            let start = offset as usize;
            buf[..n].copy_from_slice(&file.buf[start..start + n]);
        } else {
            let entry = self.reader_entry(fd)?;
            self.flash.read(entry.data_addr() + offset, &mut buf[..n])?;
        }
        self.slot_mut(fd)?.offset += n as u32;
        Ok(n)
    }

    pub fn write(&mut self, fd: Fd, data: &[u8]) -> TfsResult<()> {
        let file = self.slot_mut(fd)?;
        if !file.writable() {
            return Err(TfsError::ReadOnly);
        }
        let start = file.offset as usize;
        let end = start
            .checked_add(data.len())
            .filter(|&e| e <= u32::MAX as usize)
            .ok_or(TfsError::WriteExceedsFile)?;
        if end > file.buf.len() {
            file.buf
                .try_reserve(end - file.buf.len())
                .map_err(|_| TfsError::AllocationFailed)?;
            file.buf.resize(end, 0);
        }
        file.buf[start..end].copy_from_slice(data);
        file.offset = end as u32;
        Ok(())
    }

    /// Move the file position; returns the new position.
    pub fn seek(&mut self, fd: Fd, offset: i64, whence: Whence) -> TfsResult<u32> {
        let file = self.slot_mut(fd)?;
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => file.offset as i64,
            Whence::End => file.hwm() as i64,
        };
        let pos = base + offset;
        if pos < 0 {
            return Err(TfsError::BadArgument);
        }
        if pos > file.hwm() as i64 {
            return Err(TfsError::EndOfFile);
        }
        file.offset = pos as u32;
        Ok(file.offset)
    }

    pub fn tell(&self, fd: Fd) -> TfsResult<u32> {
        Ok(self.slot(fd)?.offset)
    }

    /// Shorten a file open for writing to `len` bytes.
    pub fn truncate(&mut self, fd: Fd, len: u32) -> TfsResult<()> {
        let file = self.slot_mut(fd)?;
        if !file.writable() {
            return Err(TfsError::ReadOnly);
        }
        if len > file.hwm() {
            return Err(TfsError::BadArgument);
        }
        file.buf.truncate(len as usize);
        file.offset = file.offset.min(len);
        Ok(())
    }

    /// Read up to and including the next newline. Returns 0 at end of file.
    pub fn get_line(&mut self, fd: Fd, buf: &mut [u8]) -> TfsResult<usize> {
        let mut n = 0;
        while n < buf.len() {
            match self.read(fd, &mut buf[n..n + 1]) {
                Ok(_) => {}
                Err(TfsError::EndOfFile) => break,
                Err(e) => return Err(e),
            }
            n += 1;
            if buf[n - 1] == b'\n' {
                break;
            }
        }
        Ok(n)
    }

    /// Close `fd`. A file open for writing is committed with add(), with
    /// `info` replacing its description when given. If the commit fails the
    /// descriptor stays open with its buffer intact.
    pub fn close(&mut self, fd: Fd, info: Option<&str>) -> TfsResult<()> {
        self.slot(fd)?;
        let file = match self.slots[fd.0].take() {
            Some(file) => file,
            None => return Err(TfsError::InvalidDescriptor),
        };
        if !file.writable() {
            return Ok(());
        }
        let info = info.unwrap_or(file.info.as_str());
        match self.add(&file.name, info, file.flags, DataSource::Ram(&file.buf)) {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("tfs: commit of '{}' failed, descriptor kept open: {}", file.name, e);
                self.slots[fd.0] = Some(file);
                Err(e)
            }
        }
    }

    /// Drop `fd` without committing anything.
    pub fn unopen(&mut self, fd: Fd) -> TfsResult<()> {
        self.slot(fd)?;
        self.slots[fd.0] = None;
        Ok(())
    }
}
