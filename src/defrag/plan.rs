//! Defrag planning: where every live record goes, and what each sector must
//! look like afterwards.

use alloc::vec::Vec;

use log::error;

use super::dsi::{overhead, try_buffer, DefragHeader, Dsi, SectorCrc};
use super::span::overlap;
use crate::chain::{ChainIter, Record};
use crate::crc::crc32;
use crate::device::TfsDevice;
use crate::error::{TfsError, TfsResult};
use crate::flash::{crc_range, FlashDevice, FlashError, Sector, ERASED};
use crate::header::{FileHeader, HDR_SIZE, NEXT_OFFSET};

/// Sector layout of one device for the duration of a defrag pass.
#[derive(Debug, Clone)]
pub(crate) struct Geometry {
    pub sectors: Vec<Sector>,
    pub spare: Sector,
    pub limit: u32,
    pub dsi_start: u32,
    pub live_end: u32,
}

impl Geometry {
    pub fn new<F: FlashDevice + ?Sized>(flash: &F, dev: &TfsDevice, dsi: &Dsi) -> TfsResult<Self> {
        let sectors = dev.sectors(flash)?;
        let spare = dev.spare_sector(flash)?;
        Ok(Self {
            sectors,
            spare,
            limit: dev.limit(),
            dsi_start: dsi.start(dev.limit()),
            live_end: dsi.live_end(dev.start),
        })
    }

    /// Index of the sector that hosts the DSI.
    pub fn host(&self) -> usize {
        self.sectors.len() - 1
    }

    /// Bytes of sector `i` covered by its sector CRC.
    pub fn window(&self, i: usize) -> (u32, u32) {
        let s = self.sectors[i];
        if i == self.host() {
            (s.base, self.dsi_start)
        } else {
            (s.base, s.end())
        }
    }

    pub fn index_of(&self, addr: u32) -> Option<usize> {
        self.sectors.iter().position(|s| s.contains(addr))
    }

    /// Last sector that holds relocated data, if any record is live.
    pub fn last_live(&self) -> Option<usize> {
        if self.live_end == self.sectors[0].base {
            None
        } else {
            self.index_of(self.live_end - 1)
        }
    }

    /// Where byte `addr` of sector `i` sits inside the spare copy.
    pub fn in_spare(&self, i: usize, addr: u32) -> u32 {
        self.spare.base + (addr - self.sectors[i].base)
    }
}

/// Read `buf.len()` source bytes at `addr`. When `active` names a sector
/// that has been copied to the spare, its bytes come from the spare.
fn read_source<F: FlashDevice + ?Sized>(
    flash: &F,
    geo: &Geometry,
    active: Option<usize>,
    addr: u32,
    buf: &mut [u8],
) -> Result<(), FlashError> {
    let (i, sec) = match active {
        Some(i) => (i, geo.sectors[i]),
        None => return flash.read(addr, buf),
    };
    let end = addr + buf.len() as u32;
    let mut pos = addr;
    while pos < end {
        let (src, stop) = if pos < sec.base {
            (pos, end.min(sec.base))
        } else if pos < sec.end() {
            (geo.in_spare(i, pos), end.min(sec.end()))
        } else {
            (pos, end)
        };
        let off = (pos - addr) as usize;
        flash.read(src, &mut buf[off..off + (stop - pos) as usize])?;
        pos = stop;
    }
    Ok(())
}

/// Bytes `from..to` of the relocated header of `e`: the source header with
/// `next` pointing at the record's new successor. The hdr_crc does not cover
/// `next`, so everything else is copied as is.
///
/// The source header is checked against the plan only in the sector where
/// the new header starts. A header continued from the previous sector may
/// have its source partly overwritten already, so just the bytes `from..to`
/// are read then.
fn relocated_header<F: FlashDevice + ?Sized>(
    flash: &F,
    geo: &Geometry,
    e: &DefragHeader,
    active: Option<usize>,
    from: usize,
    to: usize,
) -> TfsResult<[u8; HDR_SIZE]> {
    let mut raw = [0u8; HDR_SIZE];
    if from == 0 {
        read_source(flash, geo, active, e.old_addr, &mut raw)?;
        match FileHeader::decode(&raw) {
            Some(hdr) if hdr.crc_ok() && hdr.hdr_crc == e.old_hdr_crc => {}
            _ => {
                error!(
                    "defrag: source header of '{}' at 0x{:08x} does not match the plan",
                    e.name.as_str(),
                    e.old_addr
                );
                return Err(TfsError::CorruptChain);
            }
        }
    } else {
        read_source(flash, geo, active, e.old_addr + from as u32, &mut raw[from..to])?;
    }
    let next = NEXT_OFFSET as usize;
    raw[next..next + 4].copy_from_slice(&e.new_next().to_le_bytes());
    Ok(raw)
}

/// Post-defrag contents of the CRC window of sector `i`.
pub(crate) fn sector_image<F: FlashDevice + ?Sized>(
    flash: &F,
    geo: &Geometry,
    entries: &[DefragHeader],
    i: usize,
    active: Option<usize>,
) -> TfsResult<Vec<u8>> {
    let (lo, hi) = geo.window(i);
    let mut img = try_buffer((hi - lo) as usize, ERASED)?;
    for e in entries {
        let (nb, ne) = e.new_span();
        let (a, b) = match overlap(nb, ne, lo, hi) {
            Some(r) => r,
            None => continue,
        };
        let hdr_end = nb + HDR_SIZE as u32;
        if a < hdr_end {
            let (from, to) = ((a - nb) as usize, (b.min(hdr_end) - nb) as usize);
            let hdr = relocated_header(flash, geo, e, active, from, to)?;
            img[(a - lo) as usize..(a - lo) as usize + (to - from)].copy_from_slice(&hdr[from..to]);
        }
        let data_from = a.max(hdr_end);
        if data_from < b {
            let dst = &mut img[(data_from - lo) as usize..(b - lo) as usize];
            read_source(flash, geo, active, e.old_addr + (data_from - nb), dst)?;
        }
    }
    Ok(img)
}

/// True when some byte sector `i` must end up holding comes from sector `i`.
pub(crate) fn self_sourced(geo: &Geometry, entries: &[DefragHeader], i: usize) -> bool {
    let (lo, hi) = geo.window(i);
    let sec = geo.sectors[i];
    entries.iter().any(|e| {
        let (nb, ne) = e.new_span();
        match overlap(nb, ne, lo, hi) {
            Some((a, b)) => overlap(e.old_addr + (a - nb), e.old_addr + (b - nb), sec.base, sec.end()).is_some(),
            None => false,
        }
    })
}

/// A defrag pass worked out in RAM.
#[derive(Debug, Clone)]
pub(crate) struct Plan {
    pub geo: Geometry,
    pub dsi: Dsi,
    pub chain_end: u32,
}

impl Plan {
    /// Pack the active records of `dev` towards its start. `None` when there
    /// is nothing to reclaim.
    pub fn layout<F: FlashDevice + ?Sized>(flash: &F, dev: &TfsDevice, legacy_delete: bool) -> TfsResult<Option<Self>> {
        let mut iter = ChainIter::new(flash, dev, legacy_delete);
        let live: Vec<Record> = iter.by_ref().filter(|r| r.hdr.is_active()).collect();
        let chain_end = iter.finish()?;

        let sectors = dev.sectors(flash)?;
        let host = sectors[sectors.len() - 1];
        let size = overhead(live.len(), sectors.len());
        let dsi_start = match dev.limit().checked_sub(size) {
            Some(s) if s >= host.base && s >= chain_end => s,
            _ => return Err(TfsError::DsiTableOverflow),
        };

        let mut entries = Vec::new();
        entries
            .try_reserve_exact(live.len())
            .map_err(|_| TfsError::AllocationFailed)?;
        let mut cursor = dev.start;
        for (idx, rec) in live.iter().enumerate() {
            if cursor > rec.addr {
                error!("defrag: record at 0x{:08x} would move forward", rec.addr);
                return Err(TfsError::CorruptChain);
            }
            let old_end = rec.addr + HDR_SIZE as u32 + rec.hdr.file_size;
            let new_end = cursor + HDR_SIZE as u32 + rec.hdr.file_size;
            let old_sec = flash.sector_at(old_end - 1).ok_or(TfsError::BadArgument)?;
            let new_sec = sectors
                .iter()
                .position(|s| s.contains(new_end - 1))
                .ok_or(TfsError::BadArgument)?;
            let mut e = DefragHeader {
                name: rec.hdr.name,
                old_addr: rec.addr,
                new_addr: cursor,
                old_hdr_crc: rec.hdr.hdr_crc,
                file_size: rec.hdr.file_size,
                idx: idx as u32,
                old_end_sector_offset: old_end - old_sec.base,
                new_end_sector_number: new_sec as u32,
                new_end_sector_offset: new_end - sectors[new_sec].base,
                crc: 0,
            };
            e.seal();
            cursor = e.new_next();
            entries.push(e);
        }

        if cursor == chain_end
            && entries.iter().all(|e| e.new_addr == e.old_addr)
            && flash.is_erased(chain_end, dev.limit())?
        {
            return Ok(None);
        }

        let dsi = Dsi {
            device: (dev.start, dev.limit()),
            entries,
            sectors: Vec::new(),
        };
        let geo = Geometry {
            sectors,
            spare: dev.spare_sector(flash)?,
            limit: dev.limit(),
            dsi_start,
            live_end: cursor,
        };
        Ok(Some(Self { geo, dsi, chain_end }))
    }

    /// Fill in the pre/post CRC of every sector from the flash as it is now.
    pub fn seal_sectors<F: FlashDevice + ?Sized>(&mut self, flash: &F) -> TfsResult<()> {
        let mut crcs = Vec::new();
        crcs.try_reserve_exact(self.geo.sectors.len())
            .map_err(|_| TfsError::AllocationFailed)?;
        for i in 0..self.geo.sectors.len() {
            let (lo, hi) = self.geo.window(i);
            let pre = crc_range(flash, lo, hi)?;
            let post = crc32(&sector_image(flash, &self.geo, &self.dsi.entries, i, None)?);
            crcs.push(SectorCrc { pre, post });
        }
        self.dsi.sectors = crcs;
        Ok(())
    }
}
