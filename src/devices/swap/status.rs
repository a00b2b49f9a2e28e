//! Boot-time resolution of where authoritative swap status lives.
//!
//! After a reset the progress of an interrupted swap may be recorded in the
//! primary slot's trailer or in the scratch trailer. A fixed, ordered rule
//! table classifies the combination of durable markers; the first matching
//! rule wins, so the order of the table is part of its meaning.

use super::trailer::{FlagState, MagicState, SwapState, Trailer};
use super::{BootStatus, Phase};
use crate::{error::Error, hal::flash::FlashArea, log::error};

/// Where the authoritative swap status is stored, if anywhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub enum StatusSource {
    /// No swap in progress.
    None,
    /// Mid swap of the trailer-bearing sector; scratch holds the trailer.
    Scratch,
    /// Status lives in the primary slot's trailer.
    Primary,
}

#[derive(Clone, Copy)]
enum MagicPattern {
    Good,
    Unset,
    NotGood,
    Any,
}

impl MagicPattern {
    fn matches(self, state: MagicState) -> bool {
        match self {
            MagicPattern::Good => state == MagicState::Good,
            MagicPattern::Unset => state == MagicState::Unset,
            MagicPattern::NotGood => state != MagicState::Good,
            MagicPattern::Any => true,
        }
    }
}

#[derive(Clone, Copy)]
enum FlagPattern {
    Set,
    Unset,
    Any,
}

impl FlagPattern {
    fn matches(self, state: FlagState) -> bool {
        match self {
            FlagPattern::Set => state == FlagState::Set,
            FlagPattern::Unset => state == FlagState::Unset,
            FlagPattern::Any => true,
        }
    }
}

struct StatusRule {
    primary_magic: MagicPattern,
    scratch_magic: MagicPattern,
    primary_copy_done: FlagPattern,
    source: StatusSource,
}

/// Maps swap state contents to the boot status location. Iterated in order;
/// do not reorder, the rules are precedence-sensitive.
const STATUS_RULES: &[StatusRule] = &[
    // Swap finished and committed; nothing to resume.
    StatusRule {
        primary_magic: MagicPattern::Good,
        scratch_magic: MagicPattern::NotGood,
        primary_copy_done: FlagPattern::Set,
        source: StatusSource::None,
    },
    // Swap underway with status tracked in the primary slot.
    StatusRule {
        primary_magic: MagicPattern::Good,
        scratch_magic: MagicPattern::NotGood,
        primary_copy_done: FlagPattern::Unset,
        source: StatusSource::Primary,
    },
    // Scratch carries a valid trailer: the trailer-bearing sector is being
    // swapped right now.
    StatusRule {
        primary_magic: MagicPattern::Any,
        scratch_magic: MagicPattern::Good,
        primary_copy_done: FlagPattern::Any,
        source: StatusSource::Scratch,
    },
    // Either no swap ever happened (reading status is harmless) or we are
    // mid-revert with status in the primary slot.
    StatusRule {
        primary_magic: MagicPattern::Unset,
        scratch_magic: MagicPattern::Any,
        primary_copy_done: FlagPattern::Unset,
        source: StatusSource::Primary,
    },
];

/// Classifies the pair of trailer states. `image_index` demotes a scratch
/// hit that belongs to a different image of a multi-image layout.
pub fn resolve_source(primary: &SwapState, scratch: &SwapState, image_index: u8) -> StatusSource {
    for rule in STATUS_RULES {
        if rule.primary_magic.matches(primary.magic)
            && rule.scratch_magic.matches(scratch.magic)
            && rule.primary_copy_done.matches(primary.copy_done)
        {
            if rule.source == StatusSource::Scratch && scratch.image_num != image_index {
                return StatusSource::None;
            }
            return rule.source;
        }
    }
    StatusSource::None
}

/// Reconstructs the swap position from a region's progress table by locating
/// the boundary between written and erased cells. A written cell past the
/// boundary means the table cannot be trusted; whether that is fatal depends
/// on whether the primary slot gets verified afterwards.
pub fn read_status_bytes<F: FlashArea>(
    trailer: &mut Trailer<F>,
    bs: &mut BootStatus,
) -> Result<(), Error> {
    let entry_count = trailer.entry_count();
    let mut found = false;
    let mut boundary = None;
    let mut invalid = false;

    for position in 0..entry_count {
        if trailer.read_progress_entry(position)? {
            if !found {
                found = true;
            } else if boundary.is_some() {
                invalid = true;
                break;
            }
        } else if found && boundary.is_none() {
            boundary = Some(position);
        }
    }

    if invalid {
        error!("Detected inconsistent status!");
        if !cfg!(feature = "validate-primary") {
            // Without verification of the primary slot there is no way to
            // tell whether the recorded position is sound.
            return Err(Error::InconsistentStatus);
        }
    }

    if found {
        let position = boundary.unwrap_or(entry_count);
        bs.idx = position / Phase::COUNT + 1;
        bs.phase = Phase::from_ordinal(position % Phase::COUNT);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::swap::trailer::SwapType;

    fn state(magic: MagicState, copy_done: FlagState) -> SwapState {
        SwapState {
            magic,
            swap_type: SwapType::None,
            image_num: 0,
            copy_done,
            image_ok: FlagState::Unset,
        }
    }

    #[test]
    fn committed_primary_means_no_swap() {
        let primary = state(MagicState::Good, FlagState::Set);
        let scratch = state(MagicState::Unset, FlagState::Unset);
        assert_eq!(resolve_source(&primary, &scratch, 0), StatusSource::None);
    }

    #[test]
    fn uncommitted_primary_resumes_from_primary() {
        let primary = state(MagicState::Good, FlagState::Unset);
        let scratch = state(MagicState::Bad, FlagState::Unset);
        assert_eq!(resolve_source(&primary, &scratch, 0), StatusSource::Primary);
    }

    #[test]
    fn good_scratch_wins_regardless_of_primary() {
        // The first two rules demand a not-good scratch magic, so a valid
        // scratch trailer takes precedence over any primary state.
        let scratch = state(MagicState::Good, FlagState::Unset);
        for magic in [MagicState::Good, MagicState::Unset, MagicState::Bad] {
            for copy_done in [FlagState::Set, FlagState::Unset] {
                let primary = state(magic, copy_done);
                assert_eq!(resolve_source(&primary, &scratch, 0), StatusSource::Scratch);
            }
        }
    }

    #[test]
    fn fresh_or_mid_revert_reads_primary() {
        let primary = state(MagicState::Unset, FlagState::Unset);
        let scratch = state(MagicState::Bad, FlagState::Unset);
        assert_eq!(resolve_source(&primary, &scratch, 0), StatusSource::Primary);
    }

    #[test]
    fn nothing_matches_falls_back_to_none() {
        let primary = state(MagicState::Bad, FlagState::Set);
        let scratch = state(MagicState::Unset, FlagState::Unset);
        assert_eq!(resolve_source(&primary, &scratch, 0), StatusSource::None);
    }

    #[test]
    fn scratch_status_of_another_image_is_ignored() {
        let primary = state(MagicState::Unset, FlagState::Unset);
        let mut scratch = state(MagicState::Good, FlagState::Unset);
        scratch.image_num = 1;
        assert_eq!(resolve_source(&primary, &scratch, 0), StatusSource::None);
        assert_eq!(resolve_source(&primary, &scratch, 1), StatusSource::Scratch);
    }

    mod progress_table {
        use super::super::*;
        use crate::hal::doubles::flash::FakeFlash;

        const WRITE_SIZE: u32 = 4;

        fn flash() -> FakeFlash {
            FakeFlash::uniform(4, 0x1000, WRITE_SIZE)
        }

        #[test]
        fn empty_table_leaves_the_status_untouched() {
            let mut flash = flash();
            let mut trailer = Trailer::for_slot(&mut flash, WRITE_SIZE);
            let mut bs = BootStatus::new();
            read_status_bytes(&mut trailer, &mut bs).unwrap();
            assert!(bs.is_reset());
        }

        #[test]
        fn boundary_position_reconstructs_granule_and_phase() {
            for written_entries in 1..=7u32 {
                let mut flash = flash();
                let mut trailer = Trailer::for_slot(&mut flash, WRITE_SIZE);
                for position in 0..written_entries {
                    trailer
                        .write_progress_entry(
                            position / Phase::COUNT + 1,
                            Phase::from_ordinal(position % Phase::COUNT),
                        )
                        .unwrap();
                }

                let mut bs = BootStatus::new();
                read_status_bytes(&mut trailer, &mut bs).unwrap();
                assert_eq!(bs.idx, written_entries / Phase::COUNT + 1);
                assert_eq!(bs.phase, Phase::from_ordinal(written_entries % Phase::COUNT));
            }
        }

        #[test]
        fn written_entry_past_the_boundary_is_detected() {
            let mut flash = flash();
            let mut trailer = Trailer::for_slot(&mut flash, WRITE_SIZE);
            trailer.write_progress_entry(1, Phase::Stage).unwrap();
            trailer.write_progress_entry(1, Phase::Move).unwrap();
            // Skips (1, Publish): the table now holds a gap.
            trailer.write_progress_entry(2, Phase::Stage).unwrap();

            let mut bs = BootStatus::new();
            let outcome = read_status_bytes(&mut trailer, &mut bs);

            if cfg!(feature = "validate-primary") {
                // Verification will catch a bad outcome; continue from the
                // first erased position.
                outcome.unwrap();
                assert_eq!(bs.idx, 1);
                assert_eq!(bs.phase, Phase::Publish);
            } else {
                assert_eq!(outcome, Err(Error::InconsistentStatus));
            }
        }
    }
}
