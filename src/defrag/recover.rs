//! Working out, after a reset, how far an interrupted defrag got.
//!
//! All evidence is on flash: the DSI (in place, or in the spare while the
//! host sector is being rewritten), the current CRC of every sector, and the
//! spare contents. Placement is never re-decided; the pass resumes with the
//! plan recorded in the DSI.

use alloc::vec::Vec;

use log::{debug, info, warn};

use super::dsi::{read_owner_tag, Dsi, OWNER_TAG_SIZE};
use super::plan::{self_sourced, Geometry};
use super::{DefragState, DefragStatus};
use crate::device::TfsDevice;
use crate::error::TfsResult;
use crate::flash::{crc_range, FlashDevice};

/// Where an interrupted pass picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// The sector still holds its pre image; start it over.
    CopyToSpare(usize),
    /// The spare holds the sector's pre image; erase and refill from it.
    RefillFromSpare(usize),
    /// Refill the sector from the other sectors.
    RefillDirect(usize),
    /// Every relocated sector matches its post image.
    AlmostDone,
    /// The DSI host sector is saved in the spare and needs rewriting.
    FinishCleanup,
}

/// What the flash says about a device's defrag state.
#[derive(Debug, Clone)]
pub(crate) struct Assessment {
    pub status: DefragStatus,
    /// DSI and geometry, when a pass is in progress.
    pub plan: Option<(Geometry, Dsi)>,
    /// Best guess when the evidence is inconsistent.
    pub fallback: Option<Resume>,
}

pub(crate) fn assess<F: FlashDevice + ?Sized>(flash: &F, dev: &TfsDevice) -> TfsResult<Assessment> {
    let sectors = dev.sectors(flash)?;
    let host = sectors[sectors.len() - 1];
    let spare = dev.spare_sector(flash)?;
    let spare_erased = flash.is_erased(spare.base, spare.end())?;

    let mut in_spare = false;
    let mut dsi = Dsi::read_at(flash, dev.limit(), dev, sectors.len(), host.size)?;
    if dsi.is_none() {
        let spare_end = spare.base + (dev.limit() - host.base);
        dsi = Dsi::read_at(flash, spare_end, dev, sectors.len(), host.size)?;
        in_spare = dsi.is_some();
    }
    let dsi = match dsi {
        Some(dsi) => dsi,
        None => {
            let state = if spare_erased {
                DefragState::Inactive
            } else {
                DefragState::BuildingDsi
            };
            return Ok(Assessment {
                status: DefragStatus {
                    state,
                    resume: None,
                    first_touched: None,
                    last_touched: None,
                    spare_erased,
                },
                plan: None,
                fallback: None,
            });
        }
    };

    let geo = Geometry::new(flash, dev, &dsi)?;
    let mut current = Vec::with_capacity(geo.sectors.len());
    for i in 0..geo.sectors.len() {
        let (lo, hi) = geo.window(i);
        current.push(crc_range(flash, lo, hi)?);
    }
    let touched: Vec<usize> = (0..current.len())
        .filter(|&i| current[i] != dsi.sectors[i].pre)
        .collect();
    let spare_crc = |i: usize| -> TfsResult<u32> {
        let (lo, hi) = geo.window(i);
        Ok(crc_range(flash, spare.base, spare.base + (hi - lo))?)
    };

    let h = geo.host();
    let (resume, fallback) = if in_spare {
        let saved = spare_crc(h)?;
        if saved == dsi.sectors[h].post {
            (Some(Resume::FinishCleanup), None)
        } else if saved == dsi.sectors[h].pre {
            (Some(Resume::RefillFromSpare(h)), None)
        } else {
            (None, Some(Resume::RefillDirect(h)))
        }
    } else {
        let last = geo.last_live();
        let first = last.and_then(|last| (0..=last).find(|&i| current[i] != dsi.sectors[i].post));
        match (first, last) {
            (None, _) | (_, None) => (Some(Resume::AlmostDone), None),
            (Some(i), Some(last)) => {
                let rest_untouched = (i + 1..=last).all(|j| current[j] == dsi.sectors[j].pre);
                let spare_holds = !spare_erased && spare_crc(i)? == dsi.sectors[i].pre;
                if !rest_untouched {
                    (None, Some(Resume::RefillDirect(i)))
                } else if current[i] == dsi.sectors[i].pre {
                    (Some(Resume::CopyToSpare(i)), None)
                } else if spare_holds {
                    (Some(Resume::RefillFromSpare(i)), None)
                } else if i != h && !self_sourced(&geo, &dsi.entries, i) {
                    (Some(Resume::RefillDirect(i)), None)
                } else {
                    (None, Some(Resume::RefillDirect(i)))
                }
            }
        }
    };

    let state = match resume {
        Some(Resume::CopyToSpare(i)) | Some(Resume::RefillFromSpare(i)) | Some(Resume::RefillDirect(i)) => {
            DefragState::Relocating(i)
        }
        Some(_) => DefragState::AlmostDone,
        None => DefragState::AbortRestart,
    };
    Ok(Assessment {
        status: DefragStatus {
            state,
            resume,
            first_touched: touched.first().copied(),
            last_touched: touched.last().copied(),
            spare_erased,
        },
        plan: Some((geo, dsi)),
        fallback,
    })
}

/// Finish an interrupted restage of the DSI host sector: the spare holds
/// the live prefix of the host, tagged with its owner. Copies it back when
/// the host can take it, then erases the spare. A spare tagged by another
/// device is left alone; returns whether the spare was settled.
pub(crate) fn repair_restage<F: FlashDevice + ?Sized>(flash: &mut F, dev: &TfsDevice) -> TfsResult<bool> {
    let host = dev.last_sector(flash)?;
    let spare = dev.spare_sector(flash)?;
    let body = (host.size as usize).saturating_sub(OWNER_TAG_SIZE);
    let mut saved = super::dsi::try_buffer(host.size as usize, 0)?;
    flash.read(spare.base, &mut saved)?;

    match read_owner_tag(&saved[body..]) {
        Some(owner) if owner != (dev.start, dev.limit()) => {
            debug!(
                "tfs {}: spare holds a restage of 0x{:08x}..0x{:08x}, not ours",
                dev.prefix, owner.0, owner.1
            );
            return Ok(false);
        }
        Some(_) => {
            let used = saved[..body].iter().rposition(|&b| b != 0xFF).map_or(0, |p| p + 1);
            let mut current = super::dsi::try_buffer(used, 0)?;
            flash.read(host.base, &mut current)?;
            let compatible = current.iter().zip(&saved[..used]).all(|(&c, &s)| c & s == s);
            if !compatible {
                warn!(
                    "tfs {}: spare content does not fit sector {}, discarding it",
                    dev.prefix, host.number
                );
            } else if current.iter().zip(&saved[..used]).any(|(&c, &s)| c != s) {
                flash.program(host.base, &saved[..used])?;
                info!("tfs {}: completed interrupted restage of sector {}", dev.prefix, host.number);
            }
        }
        // Untagged: the host was never erased.
        None => debug!("tfs {}: discarding untagged spare", dev.prefix),
    }
    flash.erase(spare.number)?;
    Ok(true)
}
