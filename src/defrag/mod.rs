//! Power-safe defragmentation.
//!
//! A pass packs the active records of one device towards its start. Before
//! anything moves, the plan (new address of every record, CRC of every
//! sector before and after) is written to the tail of the device's last
//! sector. Sectors are then rewritten in address order, through the spare
//! sector whenever a sector would otherwise be erased while still holding
//! bytes it needs.

mod dsi;
mod engine;
mod plan;
mod recover;
mod span;

use log::{info, warn};

pub use dsi::{overhead as dsi_overhead, DefragHeader, Dsi, SectorCrc};
pub use recover::Resume;
pub use span::{classify, Span};

use engine::{Engine, Refill};
use plan::Plan;

pub(crate) use recover::{assess, repair_restage, Assessment};

use crate::device::TfsDevice;
use crate::error::{AtStep, DefragStep, TfsError, TfsResult};
use crate::flash::{copy_range, FlashDevice};
use crate::platform::Platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefragState {
    Inactive,
    /// No valid DSI yet, but the spare holds a partly restaged host sector.
    BuildingDsi,
    Relocating(usize),
    AlmostDone,
    /// Recovery evidence is inconsistent; the pass only goes on if the
    /// operator agrees to the best guess.
    AbortRestart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefragStatus {
    pub state: DefragState,
    /// `None` while inactive, or when the evidence needs an operator.
    pub resume: Option<Resume>,
    pub first_touched: Option<usize>,
    pub last_touched: Option<usize>,
    pub spare_erased: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefragOutcome {
    NothingToDo,
    Completed { reclaimed: u32 },
    Resumed(Resume),
    /// An interrupted restage of the DSI sector was settled.
    Restaged,
    Aborted,
}

/// Run a full pass over `dev`.
pub(crate) fn run<F: FlashDevice + ?Sized>(
    flash: &mut F,
    dev: &TfsDevice,
    legacy_delete: bool,
    platform: &mut dyn Platform,
) -> TfsResult<DefragOutcome> {
    let mut plan = match Plan::layout(&*flash, dev, legacy_delete).at(DefragStep::Plan)? {
        Some(plan) => plan,
        None => return Ok(DefragOutcome::NothingToDo),
    };
    info!(
        "defrag {}: packing {} files, chain ends at 0x{:08x}",
        dev.prefix,
        plan.dsi.entries.len(),
        plan.chain_end
    );

    let (dsi_start, limit) = (plan.geo.dsi_start, plan.geo.limit);
    if !flash.is_erased(dsi_start, limit).at(DefragStep::RestageDsiSector)? {
        restage(flash, &plan)?;
    }
    plan.seal_sectors(&*flash).at(DefragStep::Plan)?;

    let reclaimed = plan.chain_end - plan.geo.live_end;
    let mut engine = Engine::new(flash, platform, dev, plan.geo, plan.dsi);
    engine.write_dsi()?;
    engine.relocate(0, Refill::Fresh)?;
    engine.almost_done()?;
    engine.verify(legacy_delete)?;
    Ok(DefragOutcome::Completed { reclaimed })
}

/// Rewrite the DSI host sector with only its chain bytes, dropping whatever
/// an interrupted write left past the end of the chain. The spare copy is
/// tagged with the device before the host is erased.
fn restage<F: FlashDevice + ?Sized>(flash: &mut F, plan: &Plan) -> TfsResult<()> {
    let host = plan.geo.sectors[plan.geo.host()];
    let spare = plan.geo.spare;
    let tag_at = host.end() - dsi::OWNER_TAG_SIZE as u32;
    let keep = plan.chain_end.clamp(host.base, tag_at) - host.base;
    warn!("defrag: dsi area not erased, restaging sector {}", host.number);
    let step = DefragStep::RestageDsiSector;
    if !flash.is_erased(spare.base, spare.end()).at(step)? {
        flash.erase(spare.number).at(step)?;
    }
    copy_range(flash, host.base, spare.base, keep).at(step)?;
    let tag = dsi::owner_tag(plan.dsi.device);
    flash.program(spare.base + (tag_at - host.base), &tag).at(step)?;
    flash.erase(host.number).at(step)?;
    copy_range(flash, spare.base, host.base, keep).at(step)?;
    flash.erase(spare.number).at(step)
}

/// Finish the pass an assessment found in progress.
pub(crate) fn resume<F: FlashDevice + ?Sized>(
    flash: &mut F,
    dev: &TfsDevice,
    legacy_delete: bool,
    platform: &mut dyn Platform,
    assessment: Assessment,
) -> TfsResult<DefragOutcome> {
    let (geo, dsi) = match assessment.plan {
        Some(plan) => plan,
        None => return Ok(DefragOutcome::NothingToDo),
    };
    let resume = match (assessment.status.resume, assessment.fallback) {
        (Some(r), _) => r,
        (None, Some(guess)) => {
            warn!("defrag {}: inconsistent state, best guess {:?}", dev.prefix, guess);
            if !platform.confirm("defrag state is inconsistent, resume anyway?") {
                return Ok(DefragOutcome::Aborted);
            }
            guess
        }
        (None, None) => return Err(TfsError::CorruptChain),
    };
    info!("defrag {}: resuming at {:?}", dev.prefix, resume);

    let mut engine = Engine::new(flash, platform, dev, geo, dsi);
    match resume {
        Resume::CopyToSpare(i) => engine.relocate(i, Refill::Fresh)?,
        Resume::RefillFromSpare(i) => engine.relocate(i, Refill::FromSpare)?,
        Resume::RefillDirect(i) => engine.relocate(i, Refill::Direct)?,
        Resume::AlmostDone | Resume::FinishCleanup => {}
    }
    if resume == Resume::FinishCleanup {
        engine.finish_cleanup()?;
    } else {
        engine.almost_done()?;
    }
    engine.verify(legacy_delete)?;
    Ok(DefragOutcome::Resumed(resume))
}
