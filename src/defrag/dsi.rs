//! Defrag state information: the plan a defrag pass writes to the tail of
//! the device before it moves anything.
//!
//! ```text
//! [DefragHeader x n][SectorCrc x sector_count][Trailer]   <- ends at device.end
//! ```
//!
//! The trailer is written last, so a torn DSI never validates. It names the
//! device the plan belongs to: devices may share one spare, and a DSI found
//! there must not be applied to the wrong one.

use alloc::vec::Vec;

use log::debug;

use crate::crc::{crc32, Crc32};
use crate::device::TfsDevice;
use crate::error::{TfsError, TfsResult};
use crate::flash::{align16, FlashDevice, FlashError};
use crate::header::{FileName, HDR_SIZE, NAMESIZE};

pub const DSI_MAGIC: u32 = 0x4453_4932;
pub const DEFRAG_HDR_SIZE: usize = 60;
pub const SECTOR_CRC_SIZE: usize = 8;
/// magic, file count, sector count, device start, device limit, crc.
pub const TRAILER_SIZE: usize = 24;
const TRAILER_CRC: usize = TRAILER_SIZE - 4;

const NAME_FIELD: usize = NAMESIZE + 1;

/// Bytes a DSI for `files` records on a device of `sectors` sectors takes.
pub const fn overhead(files: usize, sectors: usize) -> u32 {
    (files * DEFRAG_HDR_SIZE + sectors * SECTOR_CRC_SIZE + TRAILER_SIZE) as u32
}

fn le32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

/// Where one live record moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefragHeader {
    pub name: FileName,
    pub old_addr: u32,
    pub new_addr: u32,
    pub old_hdr_crc: u32,
    pub file_size: u32,
    pub idx: u32,
    /// Offset of the old record's last byte + 1 within its sector.
    pub old_end_sector_offset: u32,
    /// Device-relative sector index holding the new record's last byte.
    pub new_end_sector_number: u32,
    pub new_end_sector_offset: u32,
    pub crc: u32,
}

impl DefragHeader {
    /// Header plus data, without the alignment pad.
    pub fn span_len(&self) -> u32 {
        HDR_SIZE as u32 + self.file_size
    }

    pub fn old_span(&self) -> (u32, u32) {
        (self.old_addr, self.old_addr + self.span_len())
    }

    pub fn new_span(&self) -> (u32, u32) {
        (self.new_addr, self.new_addr + self.span_len())
    }

    /// Address the relocated record's `next` points at.
    pub fn new_next(&self) -> u32 {
        self.new_addr + align16(self.span_len())
    }

    pub fn encode(&self) -> [u8; DEFRAG_HDR_SIZE] {
        let mut b = [0u8; DEFRAG_HDR_SIZE];
        let name = self.name.as_str().as_bytes();
        b[..name.len()].copy_from_slice(name);
        let words = [
            self.old_addr,
            self.new_addr,
            self.old_hdr_crc,
            self.file_size,
            self.idx,
            self.old_end_sector_offset,
            self.new_end_sector_number,
            self.new_end_sector_offset,
            self.crc,
        ];
        for (i, w) in words.iter().enumerate() {
            let off = NAME_FIELD + i * 4;
            b[off..off + 4].copy_from_slice(&w.to_le_bytes());
        }
        b
    }

    pub fn decode(b: &[u8]) -> Option<Self> {
        if b.len() < DEFRAG_HDR_SIZE {
            return None;
        }
        let len = b[..NAME_FIELD].iter().position(|&c| c == 0)?;
        let name = FileName::new(core::str::from_utf8(&b[..len]).ok()?).ok()?;
        let w = |i: usize| le32(b, NAME_FIELD + i * 4);
        Some(Self {
            name,
            old_addr: w(0),
            new_addr: w(1),
            old_hdr_crc: w(2),
            file_size: w(3),
            idx: w(4),
            old_end_sector_offset: w(5),
            new_end_sector_number: w(6),
            new_end_sector_offset: w(7),
            crc: w(8),
        })
    }

    pub fn compute_crc(&self) -> u32 {
        crc32(&Self { crc: 0, ..*self }.encode())
    }

    pub fn seal(&mut self) {
        self.crc = self.compute_crc();
    }

    pub fn crc_ok(&self) -> bool {
        self.crc == self.compute_crc()
    }

    /// Both spans lie inside `[start, limit)`.
    fn within(&self, start: u32, limit: u32) -> bool {
        let fits = |addr: u32| {
            addr >= start
                && addr
                    .checked_add(self.span_len())
                    .map_or(false, |end| end <= limit)
        };
        fits(self.old_addr) && fits(self.new_addr)
    }
}

/// Per-sector CRC before and after the pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorCrc {
    pub pre: u32,
    pub post: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dsi {
    /// `start` and `limit` of the owning device.
    pub device: (u32, u32),
    pub entries: Vec<DefragHeader>,
    pub sectors: Vec<SectorCrc>,
}

impl Dsi {
    pub fn size(&self) -> u32 {
        overhead(self.entries.len(), self.sectors.len())
    }

    /// Start address of the DSI when it ends at `limit`.
    pub fn start(&self, limit: u32) -> u32 {
        limit - self.size()
    }

    /// End of the packed live records once relocated.
    pub fn live_end(&self, device_start: u32) -> u32 {
        self.entries
            .last()
            .map(|e| e.new_next())
            .unwrap_or(device_start)
    }

    /// The two tables, then the trailer.
    pub fn encode(&self) -> (Vec<u8>, [u8; TRAILER_SIZE]) {
        let mut tables = Vec::with_capacity(self.size() as usize - TRAILER_SIZE);
        for e in &self.entries {
            tables.extend_from_slice(&e.encode());
        }
        for s in &self.sectors {
            tables.extend_from_slice(&s.pre.to_le_bytes());
            tables.extend_from_slice(&s.post.to_le_bytes());
        }
        let mut trailer = [0u8; TRAILER_SIZE];
        trailer[0..4].copy_from_slice(&DSI_MAGIC.to_le_bytes());
        trailer[4..8].copy_from_slice(&(self.entries.len() as u32).to_le_bytes());
        trailer[8..12].copy_from_slice(&(self.sectors.len() as u32).to_le_bytes());
        trailer[12..16].copy_from_slice(&self.device.0.to_le_bytes());
        trailer[16..20].copy_from_slice(&self.device.1.to_le_bytes());
        let mut crc = Crc32::new();
        crc.update(&tables);
        crc.update(&trailer[..TRAILER_CRC]);
        trailer[TRAILER_CRC..].copy_from_slice(&crc.finish().to_le_bytes());
        (tables, trailer)
    }

    /// Read the DSI of `dev` that ends at `region_end`. `None` when the
    /// trailer or any table fails to validate, when it belongs to another
    /// device, or when it would be larger than `max_len`.
    pub fn read_at<F: FlashDevice + ?Sized>(
        flash: &F,
        region_end: u32,
        dev: &TfsDevice,
        sector_count: usize,
        max_len: u32,
    ) -> Result<Option<Self>, FlashError> {
        let mut trailer = [0u8; TRAILER_SIZE];
        flash.read(region_end - TRAILER_SIZE as u32, &mut trailer)?;
        if le32(&trailer, 0) != DSI_MAGIC {
            return Ok(None);
        }
        let files = le32(&trailer, 4) as usize;
        if le32(&trailer, 8) as usize != sector_count {
            debug!("dsi at 0x{:08x}: sector count mismatch", region_end);
            return Ok(None);
        }
        let device = (le32(&trailer, 12), le32(&trailer, 16));
        if device != (dev.start, dev.limit()) {
            debug!(
                "dsi at 0x{:08x}: belongs to the device at 0x{:08x}",
                region_end, device.0
            );
            return Ok(None);
        }
        let size = files
            .checked_mul(DEFRAG_HDR_SIZE)
            .map(|n| n + sector_count * SECTOR_CRC_SIZE + TRAILER_SIZE)
            .filter(|&n| n as u32 <= max_len && n as u32 <= region_end);
        let size = match size {
            Some(n) => n as u32,
            None => return Ok(None),
        };

        let mut tables = alloc::vec![0u8; size as usize - TRAILER_SIZE];
        flash.read(region_end - size, &mut tables)?;
        let mut crc = Crc32::new();
        crc.update(&tables);
        crc.update(&trailer[..TRAILER_CRC]);
        if crc.finish() != le32(&trailer, TRAILER_CRC) {
            debug!("dsi at 0x{:08x}: trailer crc mismatch", region_end);
            return Ok(None);
        }

        let mut entries = Vec::with_capacity(files);
        for chunk in tables[..files * DEFRAG_HDR_SIZE].chunks_exact(DEFRAG_HDR_SIZE) {
            match DefragHeader::decode(chunk).filter(|e| e.crc_ok()) {
                Some(e) if e.within(device.0, device.1) => entries.push(e),
                _ => return Ok(None),
            }
        }
        let sectors = tables[files * DEFRAG_HDR_SIZE..]
            .chunks_exact(SECTOR_CRC_SIZE)
            .map(|c| SectorCrc {
                pre: le32(c, 0),
                post: le32(c, 4),
            })
            .collect();
        Ok(Some(Self {
            device,
            entries,
            sectors,
        }))
    }
}

/// Written to the end of the spare while it holds a restaged DSI sector,
/// naming the device the bytes belong to.
pub const OWNER_TAG_SIZE: usize = 16;
const OWNER_MAGIC: u32 = 0x5253_5447;

pub fn owner_tag(device: (u32, u32)) -> [u8; OWNER_TAG_SIZE] {
    let mut b = [0u8; OWNER_TAG_SIZE];
    b[0..4].copy_from_slice(&OWNER_MAGIC.to_le_bytes());
    b[4..8].copy_from_slice(&device.0.to_le_bytes());
    b[8..12].copy_from_slice(&device.1.to_le_bytes());
    let crc = crc32(&b[..12]);
    b[12..16].copy_from_slice(&crc.to_le_bytes());
    b
}

/// `start` and `limit` from a complete owner tag.
pub fn read_owner_tag(b: &[u8]) -> Option<(u32, u32)> {
    if b.len() < OWNER_TAG_SIZE || le32(b, 0) != OWNER_MAGIC || le32(b, 12) != crc32(&b[..12]) {
        return None;
    }
    Some((le32(b, 4), le32(b, 8)))
}

/// `len` bytes of `fill`, reporting allocation failure instead of aborting.
pub(crate) fn try_buffer(len: usize, fill: u8) -> TfsResult<Vec<u8>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| TfsError::AllocationFailed)?;
    v.resize(len, fill);
    Ok(v)
}
