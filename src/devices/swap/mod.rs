//! Scratch-based image swap engine.
//!
//! Exchanges the contents of the primary and secondary image slots through
//! a small scratch area, one granule of sectors at a time, recording a
//! durable progress entry after each of the three phases of every granule.
//! An unexpected reset at any instant leaves enough information in the
//! trailers for [`SwapEngine::read_boot_status`] to reconstruct the exact
//! position and for [`SwapEngine::run`] to converge on the same outcome as
//! an uninterrupted swap.

mod exchange;
pub mod geometry;
pub mod header;
pub mod sizing;
pub mod status;
pub mod trailer;

use crate::{
    devices::image::{Sector, SlotId},
    error::Error,
    hal::flash::FlashArea,
    log::{info, warn},
};
use nb::block;
use self::status::StatusSource;
use self::trailer::{SwapState, SwapType, Trailer};

/// Granule indices are 1-based; a fresh status points here.
const FIRST_GRANULE: u32 = 1;

/// The three durable steps performed per granule, in order: stage the
/// secondary sectors into scratch, move the primary sectors into the
/// secondary slot, publish the staged data into the primary slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub enum Phase {
    Stage,
    Move,
    Publish,
}

impl Phase {
    pub(crate) const COUNT: u32 = 3;

    pub(crate) fn ordinal(self) -> u32 {
        match self {
            Phase::Stage => 0,
            Phase::Move => 1,
            Phase::Publish => 2,
        }
    }

    pub(crate) fn from_ordinal(ordinal: u32) -> Phase {
        match ordinal {
            0 => Phase::Stage,
            1 => Phase::Move,
            _ => Phase::Publish,
        }
    }
}

/// In-RAM swap position. `idx` is the 1-based granule about to be (or being)
/// processed and `phase` the next phase to execute within it. Reconstructed
/// from the progress table on resume, mutated by the engine after each
/// durable step.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub struct BootStatus {
    pub idx: u32,
    pub phase: Phase,
    pub swap_type: SwapType,
    pub swap_size: u32,
    /// Whether the current granule shares sectors with the trailer, making
    /// scratch the authoritative status holder. Never persisted; recomputed
    /// every granule.
    pub use_scratch: bool,
    /// Wrapped image encryption keys, one per slot.
    #[cfg(feature = "encryption")]
    pub enc_keys: [[u8; trailer::KEY_WRAP_SIZE]; 2],
}

impl BootStatus {
    pub fn new() -> BootStatus {
        BootStatus {
            idx: FIRST_GRANULE,
            phase: Phase::Stage,
            swap_type: SwapType::None,
            swap_size: 0,
            use_scratch: false,
            #[cfg(feature = "encryption")]
            enc_keys: [[0u8; trailer::KEY_WRAP_SIZE]; 2],
        }
    }

    /// Whether this status records no swap progress at all.
    pub fn is_reset(&self) -> bool {
        self.idx == FIRST_GRANULE && self.phase == Phase::Stage
    }
}

impl Default for BootStatus {
    fn default() -> Self {
        BootStatus::new()
    }
}

/// The swap engine, borrowing the three flash regions and the two slots'
/// sector layouts for the duration of the swap. The engine is the only
/// writer of persistent state while a swap is underway.
pub struct SwapEngine<'a, PRI: FlashArea, SEC: FlashArea, SCR: FlashArea> {
    primary: &'a mut PRI,
    secondary: &'a mut SEC,
    scratch: &'a mut SCR,
    primary_sectors: &'a [Sector],
    secondary_sectors: &'a [Sector],
    image_index: u8,
    /// Unified write granularity: the largest alignment of the three areas.
    write_size: u32,
}

impl<'a, PRI: FlashArea, SEC: FlashArea, SCR: FlashArea> SwapEngine<'a, PRI, SEC, SCR> {
    pub fn new(
        primary: &'a mut PRI,
        primary_sectors: &'a [Sector],
        secondary: &'a mut SEC,
        secondary_sectors: &'a [Sector],
        scratch: &'a mut SCR,
        image_index: u8,
    ) -> Self {
        let write_size = primary.align().max(secondary.align()).max(scratch.align());
        SwapEngine {
            primary,
            secondary,
            scratch,
            primary_sectors,
            secondary_sectors,
            image_index,
            write_size,
        }
    }

    /// Whether the two slots can be exchanged through the scratch area.
    pub fn slots_compatible(&self) -> bool {
        geometry::slots_compatible(
            self.primary_sectors,
            self.secondary_sectors,
            self.scratch.size(),
        )
    }

    /// Largest application payload that fits a slot, accounting for the
    /// trailer and any padding needed to keep the scratch trailer clear of
    /// staged payload data.
    pub fn app_max_size(&self) -> u32 {
        sizing::app_max_size(
            self.primary_sectors,
            self.secondary_sectors,
            self.scratch.size(),
            self.write_size,
        )
    }

    /// Determines where the most recent boot status is stored, which is
    /// necessary to complete a swap interrupted by a reset.
    pub fn status_source(&mut self) -> Result<StatusSource, Error> {
        let primary_state = Trailer::for_slot(self.primary, self.write_size).read_state()?;
        let scratch_state = Trailer::for_scratch(self.scratch, self.write_size).read_state()?;

        log_swap_state("Primary image", &primary_state);
        log_swap_state("Scratch", &scratch_state);

        let source = status::resolve_source(&primary_state, &scratch_state, self.image_index);
        info!("Boot source: {:?}", source);
        Ok(source)
    }

    /// Resume protocol: inspects the durable markers and reconstructs the
    /// swap position, type and size of a partially completed swap, if any.
    pub fn read_boot_status(&mut self) -> Result<BootStatus, Error> {
        let mut bs = BootStatus::new();
        match self.status_source()? {
            StatusSource::None => Ok(bs),
            StatusSource::Primary => {
                let mut trailer = Trailer::for_slot(self.primary, self.write_size);
                Self::load_status(&mut trailer, &mut bs)?;
                Ok(bs)
            }
            StatusSource::Scratch => {
                let mut trailer = Trailer::for_scratch(self.scratch, self.write_size);
                Self::load_status(&mut trailer, &mut bs)?;
                Ok(bs)
            }
        }
    }

    fn load_status<F: FlashArea>(
        trailer: &mut Trailer<F>,
        bs: &mut BootStatus,
    ) -> Result<(), Error> {
        status::read_status_bytes(trailer, bs)?;
        if !bs.is_reset() {
            let state = trailer.read_state()?;
            bs.swap_type = state.swap_type;
            bs.swap_size = trailer.read_swap_size()?;
            #[cfg(feature = "encryption")]
            {
                bs.enc_keys[0] = trailer.read_enc_key(0)?;
                bs.enc_keys[1] = trailer.read_enc_key(1)?;
            }
        }
        Ok(())
    }

    /// Swaps `copy_size` bytes between the two slots, resuming from the
    /// position recorded in `bs`. Granules are processed from the highest
    /// offsets down so already-swapped data stays distinguishable from
    /// pending data on resume. Once every granule is exchanged the primary
    /// trailer is marked copy-done.
    pub fn run(&mut self, bs: &mut BootStatus, copy_size: u32) -> Result<(), Error> {
        info!("Starting swap using scratch algorithm.");

        if copy_size == 0 {
            warn!("Nothing to swap");
            return Ok(());
        }

        let mut last_sector =
            geometry::last_sector_idx(self.primary_sectors, self.secondary_sectors, copy_size)?;
        let mut swap_idx = 0;
        loop {
            let (first_sector, size) =
                geometry::copy_granule(self.primary_sectors, last_sector, self.scratch.size());
            if first_sector > last_sector {
                return Err(Error::BadArgs("sector does not fit in scratch"));
            }
            if swap_idx >= bs.idx - FIRST_GRANULE {
                self.swap_sectors(first_sector, size, bs)?;
            }
            swap_idx += 1;
            if first_sector == 0 {
                break;
            }
            last_sector = first_sector - 1;
        }

        // The primary slot now holds the new image and a committed trailer.
        Trailer::for_slot(self.primary, self.write_size).write_copy_done()
    }

    /// Where the image header nominally at the start of `slot` actually
    /// resides at this instant of the swap recorded in `bs`.
    pub fn image_header_source(
        &mut self,
        slot: SlotId,
        bs: &BootStatus,
    ) -> Result<header::HeaderSource, Error> {
        if bs.is_reset() {
            return Ok(slot.into());
        }

        let swap_size = match self.status_source()? {
            StatusSource::Scratch => {
                Trailer::for_scratch(self.scratch, self.write_size).read_swap_size()?
            }
            _ => Trailer::for_slot(self.primary, self.write_size).read_swap_size()?,
        };
        let swap_count = geometry::swap_count(
            self.primary_sectors,
            self.secondary_sectors,
            self.scratch.size(),
            swap_size,
        )?;

        Ok(header::header_source(slot, bs, swap_count))
    }

    /// Reads the raw image header bytes of `slot` from wherever the swap has
    /// currently left them. The header layout is opaque to the engine.
    pub fn read_image_header(
        &mut self,
        slot: SlotId,
        bs: &BootStatus,
        header: &mut [u8],
    ) -> Result<(), Error> {
        match self.image_header_source(slot, bs)? {
            header::HeaderSource::Primary => {
                block!(self.primary.read(0, header)).map_err(|_| Error::Flash(PRI::label()))
            }
            header::HeaderSource::Secondary => {
                block!(self.secondary.read(0, header)).map_err(|_| Error::Flash(SEC::label()))
            }
            header::HeaderSource::Scratch => {
                block!(self.scratch.read(0, header)).map_err(|_| Error::Flash(SCR::label()))
            }
        }
    }
}

fn log_swap_state(area: &str, state: &SwapState) {
    info!(
        "{}: magic={:?}, swap_type={:?}, copy_done={:?}, image_ok={:?}",
        area, state.magic, state.swap_type, state.copy_done, state.image_ok
    );
}
