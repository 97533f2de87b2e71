//! Executes a plan: DSI write, sector relocation through the spare, and the
//! final cleanup. Every step only ever moves a sector towards its post
//! image, so any of them can be repeated after a power cut.

use log::{debug, info};

use super::dsi::{Dsi, TRAILER_SIZE};
use super::plan::{sector_image, self_sourced, Geometry};
use crate::chain::{check_device, CheckReport};
use crate::device::TfsDevice;
use crate::error::{AtStep, DefragStep, TfsResult};
use crate::flash::{copy_range, FlashDevice, ERASED};
use crate::platform::Platform;

/// How a sector is brought to its post image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Refill {
    /// Nothing done yet; go through the spare if the sector needs it.
    Fresh,
    /// The spare already holds the sector's pre image.
    FromSpare,
    /// Build from other sectors only.
    Direct,
}

pub(crate) struct Engine<'a, F: FlashDevice + ?Sized> {
    flash: &'a mut F,
    platform: &'a mut dyn Platform,
    dev: &'a TfsDevice,
    geo: Geometry,
    dsi: Dsi,
}

impl<'a, F: FlashDevice + ?Sized> Engine<'a, F> {
    pub fn new(flash: &'a mut F, platform: &'a mut dyn Platform, dev: &'a TfsDevice, geo: Geometry, dsi: Dsi) -> Self {
        Self {
            flash,
            platform,
            dev,
            geo,
            dsi,
        }
    }

    fn spare_clean(&self) -> TfsResult<bool> {
        let s = self.geo.spare;
        Ok(self.flash.is_erased(s.base, s.end())?)
    }

    fn erase_spare(&mut self) -> TfsResult<()> {
        if !self.spare_clean().at(DefragStep::EraseSpare)? {
            self.flash.erase(self.geo.spare.number).at(DefragStep::EraseSpare)?;
        }
        Ok(())
    }

    fn program_dsi(&mut self, tables_step: DefragStep, trailer_step: DefragStep) -> TfsResult<()> {
        let (tables, trailer) = self.dsi.encode();
        self.flash.program(self.geo.dsi_start, &tables).at(tables_step)?;
        self.flash
            .program(self.geo.limit - TRAILER_SIZE as u32, &trailer)
            .at(trailer_step)
    }

    /// Tables first, trailer last.
    pub fn write_dsi(&mut self) -> TfsResult<()> {
        self.program_dsi(DefragStep::WriteDsiTables, DefragStep::WriteDsiTrailer)?;
        debug!(
            "defrag {}: dsi at 0x{:08x}, {} files",
            self.dev.prefix,
            self.geo.dsi_start,
            self.dsi.entries.len()
        );
        Ok(())
    }

    fn program_image(&mut self, addr: u32, img: &[u8]) -> TfsResult<()> {
        let used = img.iter().rposition(|&b| b != ERASED).map_or(0, |p| p + 1);
        if used > 0 {
            self.flash.program(addr, &img[..used]).at(DefragStep::RefillActive)?;
        }
        Ok(())
    }

    /// Relocate sectors `from..=last_live`, starting the first one with `how`.
    pub fn relocate(&mut self, from: usize, how: Refill) -> TfsResult<()> {
        let last = match self.geo.last_live() {
            Some(last) => last,
            None => return Ok(()),
        };
        let mut how = how;
        for i in from..=last {
            let crc = self.dsi.sectors[i];
            if how == Refill::Fresh && crc.pre == crc.post {
                continue;
            }
            self.relocate_sector(i, how)?;
            how = Refill::Fresh;
            self.platform.watchdog();
        }
        Ok(())
    }

    fn relocate_sector(&mut self, i: usize, how: Refill) -> TfsResult<()> {
        let sec = self.geo.sectors[i];
        let host = i == self.geo.host();
        let how = match how {
            Refill::Fresh if host || self_sourced(&self.geo, &self.dsi.entries, i) => {
                self.erase_spare()?;
                copy_range(&mut *self.flash, sec.base, self.geo.spare.base, sec.size).at(DefragStep::CopyToSpare)?;
                Refill::FromSpare
            }
            other => other,
        };
        let active = (how == Refill::FromSpare).then(|| i);
        let img = sector_image(&*self.flash, &self.geo, &self.dsi.entries, i, active).at(DefragStep::RefillActive)?;

        self.flash.erase(sec.number).at(DefragStep::EraseActive)?;
        if host {
            self.program_dsi(DefragStep::RestoreDsi, DefragStep::RestoreDsi)?;
        }
        self.program_image(sec.base, &img)?;
        debug!("defrag {}: sector {} relocated ({:?})", self.dev.prefix, sec.number, how);
        Ok(())
    }

    /// Erase what lies past the packed records, DSI host last.
    pub fn almost_done(&mut self) -> TfsResult<()> {
        self.erase_spare()?;
        let live_end = self.geo.live_end;
        let host = self.geo.host();
        for i in 0..host {
            let s = self.geo.sectors[i];
            if s.base >= live_end && !self.flash.is_erased(s.base, s.end()).at(DefragStep::EraseTrailing)? {
                self.flash.erase(s.number).at(DefragStep::EraseTrailing)?;
                self.platform.watchdog();
            }
        }
        let h = self.geo.sectors[host];
        if h.base >= live_end {
            self.flash.erase(h.number).at(DefragStep::EraseTrailing)?;
            return Ok(());
        }
        copy_range(&mut *self.flash, h.base, self.geo.spare.base, h.size).at(DefragStep::CleanupDsiSector)?;
        self.finish_cleanup()
    }

    /// With the host sector saved in the spare, rewrite it without the DSI.
    pub fn finish_cleanup(&mut self) -> TfsResult<()> {
        let h = self.geo.sectors[self.geo.host()];
        let keep = self.geo.live_end.saturating_sub(h.base);
        self.flash.erase(h.number).at(DefragStep::CleanupDsiSector)?;
        copy_range(&mut *self.flash, self.geo.spare.base, h.base, keep).at(DefragStep::CleanupDsiSector)?;
        self.flash.erase(self.geo.spare.number).at(DefragStep::CleanupDsiSector)?;
        Ok(())
    }

    pub fn verify(&self, legacy_delete: bool) -> TfsResult<CheckReport> {
        let report = check_device(&*self.flash, self.dev, legacy_delete).at(DefragStep::FinalVerify)?;
        info!(
            "defrag {}: done, {} files, chain ends at 0x{:08x}",
            self.dev.prefix, report.active, report.chain_end
        );
        Ok(report)
    }
}
