//! Locates image headers while a swap is mid-flight.
//!
//! Granules are processed from the highest offsets down, so the first
//! sector of each slot, and with it the image header, is touched by the
//! *last* granule. Until then headers stay put; afterwards they live in the
//! opposite slot, with a brief stopover in scratch.

use super::{BootStatus, Phase};
use crate::devices::image::SlotId;

/// Region that currently holds a slot's image header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub enum HeaderSource {
    Primary,
    Secondary,
    Scratch,
}

impl From<SlotId> for HeaderSource {
    fn from(slot: SlotId) -> HeaderSource {
        match slot {
            SlotId::Primary => HeaderSource::Primary,
            SlotId::Secondary => HeaderSource::Secondary,
        }
    }
}

/// Where the header nominally at the start of `slot` resides, given the swap
/// position in `bs` and the total granule count of the swap.
pub fn header_source(slot: SlotId, bs: &BootStatus, swap_count: u32) -> HeaderSource {
    let completed_granules = bs.idx - 1;

    if completed_granules >= swap_count {
        // Every granule done; the headers have traded places.
        return slot.opposite().into();
    }

    if completed_granules == swap_count - 1 {
        // The final granule is in flight, and it carries both headers.
        if slot == SlotId::Secondary && bs.phase >= Phase::Move {
            // Staged out of the secondary slot, not yet published.
            return HeaderSource::Scratch;
        }
        if slot == SlotId::Primary && bs.phase >= Phase::Publish {
            // Moved into the secondary slot already.
            return HeaderSource::Secondary;
        }
    }

    slot.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(idx: u32, phase: Phase) -> BootStatus {
        BootStatus { idx, phase, ..BootStatus::new() }
    }

    #[test]
    fn headers_stay_put_before_the_final_granule() {
        for phase in [Phase::Stage, Phase::Move, Phase::Publish] {
            let bs = status(1, phase);
            assert_eq!(header_source(SlotId::Primary, &bs, 3), HeaderSource::Primary);
            assert_eq!(header_source(SlotId::Secondary, &bs, 3), HeaderSource::Secondary);
        }
    }

    #[test]
    fn headers_trade_places_once_every_granule_is_done() {
        let bs = status(4, Phase::Stage);
        assert_eq!(header_source(SlotId::Primary, &bs, 3), HeaderSource::Secondary);
        assert_eq!(header_source(SlotId::Secondary, &bs, 3), HeaderSource::Primary);
    }

    #[test]
    fn secondary_header_passes_through_scratch_in_the_final_granule() {
        let bs = status(3, Phase::Stage);
        assert_eq!(header_source(SlotId::Secondary, &bs, 3), HeaderSource::Secondary);
        let bs = status(3, Phase::Move);
        assert_eq!(header_source(SlotId::Secondary, &bs, 3), HeaderSource::Scratch);
        let bs = status(3, Phase::Publish);
        assert_eq!(header_source(SlotId::Secondary, &bs, 3), HeaderSource::Scratch);
    }

    #[test]
    fn primary_header_moves_to_secondary_after_the_final_move() {
        let bs = status(3, Phase::Move);
        assert_eq!(header_source(SlotId::Primary, &bs, 3), HeaderSource::Primary);
        let bs = status(3, Phase::Publish);
        assert_eq!(header_source(SlotId::Primary, &bs, 3), HeaderSource::Secondary);
    }
}
