//! Where a byte span `[begin, end)` falls relative to a sector window
//! `[lo, hi)`. Planning and writing both go through [`classify`], so the
//! image that is CRC'd up front is the image that is later programmed.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Span {
    WhollyBefore,
    BeginBeforeEndCurrent,
    BeginBeforeEndLater,
    WhollyCurrent,
    BeginCurrentEndLater,
    WhollyLater,
}

pub fn classify(begin: u32, end: u32, lo: u32, hi: u32) -> Span {
    if end <= lo {
        Span::WhollyBefore
    } else if begin >= hi {
        Span::WhollyLater
    } else if begin < lo {
        if end <= hi {
            Span::BeginBeforeEndCurrent
        } else {
            Span::BeginBeforeEndLater
        }
    } else if end <= hi {
        Span::WhollyCurrent
    } else {
        Span::BeginCurrentEndLater
    }
}

/// Part of `[begin, end)` inside `[lo, hi)`.
pub fn overlap(begin: u32, end: u32, lo: u32, hi: u32) -> Option<(u32, u32)> {
    match classify(begin, end, lo, hi) {
        Span::WhollyBefore | Span::WhollyLater => None,
        Span::BeginBeforeEndCurrent => Some((lo, end)),
        Span::BeginBeforeEndLater => Some((lo, hi)),
        Span::WhollyCurrent => Some((begin, end)),
        Span::BeginCurrentEndLater => Some((begin, hi)),
    }
}
