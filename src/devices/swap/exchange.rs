use super::trailer::FlagState;
use super::*;
use crate::log::debug;
use nb::block;

/// Transfer buffer for region-to-region copies. Large enough to move a
/// write granule in few cycles without stressing the stack.
const TRANSFER_BUFFER_SIZE: usize = 1024;

/// Copies `length` bytes between two flash regions through a RAM buffer.
pub(super) fn copy_region<I: FlashArea, O: FlashArea>(
    input: &mut I,
    output: &mut O,
    input_offset: u32,
    output_offset: u32,
    length: u32,
) -> Result<(), Error> {
    let mut buffer = [0u8; TRANSFER_BUFFER_SIZE];
    let mut index = 0u32;
    while index < length {
        let chunk = (length - index).min(TRANSFER_BUFFER_SIZE as u32) as usize;
        block!(input.read(input_offset + index, &mut buffer[..chunk]))
            .map_err(|_| Error::Flash(I::label()))?;
        block!(output.write(output_offset + index, &buffer[..chunk]))
            .map_err(|_| Error::Flash(O::label()))?;
        index += chunk as u32;
    }
    Ok(())
}

impl<'a, PRI: FlashArea, SEC: FlashArea, SCR: FlashArea> SwapEngine<'a, PRI, SEC, SCR> {
    /// Exchanges one granule: the primary sectors starting at `idx` spanning
    /// `size` bytes trade contents with the same range of the secondary
    /// slot, staging through scratch. Each phase ends with a durable
    /// progress write, and each phase re-runs to an identical result if a
    /// reset strikes before that write lands.
    pub(super) fn swap_sectors(
        &mut self,
        idx: usize,
        size: u32,
        bs: &mut BootStatus,
    ) -> Result<(), Error> {
        let img_off = self.primary_sectors[idx].offset;
        let trailer_size = trailer::slot_trailer_size(self.write_size);
        let first_trailer_sector_primary =
            geometry::first_trailer_sector(self.primary_sectors, trailer_size);

        // `size` always covers whole sectors. If this granule includes the
        // first trailer-bearing sector, payload copies must stop at the
        // trailer start, and the trailer travels through scratch instead.
        let mut copy_size = size;
        if img_off + size > self.primary_sectors[first_trailer_sector_primary].offset {
            copy_size = self.primary.size() - img_off - trailer_size;

            // With a trailer spread over several sectors, the payload part
            // of the first trailer sector can still run into the scratch
            // trailer; clamp so the staged copy stops short of it.
            let scratch_trailer_off =
                Trailer::for_scratch(self.scratch, self.write_size).status_offset();
            if copy_size > scratch_trailer_off {
                copy_size = scratch_trailer_off;
            }
        }

        bs.use_scratch = bs.idx == FIRST_GRANULE && copy_size != size;

        if bs.phase == Phase::Stage {
            debug!("erasing scratch area");
            self.erase_scratch(false)?;

            if bs.idx == FIRST_GRANULE {
                // A trailer goes to scratch even when it is not needed for
                // status: the swap type and size need a durable home while
                // the primary trailer is scrambled.
                self.init_scratch_status(bs)?;

                if !bs.use_scratch {
                    self.scramble_primary_trailer()?;
                    self.init_primary_status(bs)?;
                    self.erase_scratch(false)?;
                }
            }

            copy_region(self.secondary, self.scratch, img_off, 0, copy_size)?;

            self.write_status(bs)?;
            bs.phase = Phase::Move;
        }

        if bs.phase == Phase::Move {
            let mut erase_size = size;

            if bs.idx == FIRST_GRANULE {
                // From here on only the primary slot may claim status. The
                // whole trailer is scrambled, not just the swapped range,
                // since it may spread past [img_off, img_off + size).
                self.scramble_secondary_trailer()?;

                if bs.use_scratch {
                    // Keep the freshly scrambled trailer sectors out of the
                    // erase below.
                    let sector =
                        geometry::first_trailer_sector(self.secondary_sectors, trailer_size);
                    erase_size = self.secondary_sectors[sector].offset - img_off;
                }
            }

            if erase_size > 0 {
                block!(self.secondary.erase(img_off, erase_size, false))
                    .map_err(|_| Error::Flash(SEC::label()))?;
            }

            copy_region(self.primary, self.secondary, img_off, img_off, copy_size)?;

            self.write_status(bs)?;
            bs.phase = Phase::Publish;
        }

        if bs.phase == Phase::Publish {
            let mut erase_size = size;

            if bs.use_scratch {
                self.scramble_primary_trailer()?;
                erase_size = self.primary_sectors[first_trailer_sector_primary].offset - img_off;
            }

            if erase_size > 0 {
                block!(self.primary.erase(img_off, erase_size, false))
                    .map_err(|_| Error::Flash(PRI::label()))?;
            }

            // If this granule holds the trailer, copy_size was truncated and
            // this copy excludes it.
            copy_region(self.scratch, self.primary, 0, img_off, copy_size)?;

            if bs.use_scratch {
                self.publish_trailer_from_scratch(img_off + copy_size, bs)?;
            }

            let erase_scratch = bs.use_scratch;
            bs.use_scratch = false;

            self.write_status(bs)?;
            bs.idx += 1;
            bs.phase = Phase::Stage;

            if erase_scratch {
                // Back to front, so the scratch trailer at the top stops
                // looking valid before anything else is touched. A reset
                // mid-erase must not leave a remnant that would later be
                // replayed onto the primary slot.
                self.erase_scratch(true)?;
            }
        }

        Ok(())
    }

    fn erase_scratch(&mut self, reverse: bool) -> Result<(), Error> {
        let size = self.scratch.size();
        block!(self.scratch.erase(0, size, reverse)).map_err(|_| Error::Flash(SCR::label()))
    }

    fn scramble_primary_trailer(&mut self) -> Result<(), Error> {
        Trailer::for_slot(self.primary, self.write_size).scramble(self.primary_sectors)
    }

    fn scramble_secondary_trailer(&mut self) -> Result<(), Error> {
        Trailer::for_slot(self.secondary, self.write_size).scramble(self.secondary_sectors)
    }

    fn init_scratch_status(&mut self, bs: &BootStatus) -> Result<(), Error> {
        let secondary_state = Trailer::for_slot(self.secondary, self.write_size).read_state()?;
        let mut scratch = Trailer::for_scratch(self.scratch, self.write_size);
        Self::init_status(&mut scratch, secondary_state.image_ok, bs, self.image_index)
    }

    fn init_primary_status(&mut self, bs: &BootStatus) -> Result<(), Error> {
        let secondary_state = Trailer::for_slot(self.secondary, self.write_size).read_state()?;
        let mut primary = Trailer::for_slot(self.primary, self.write_size);
        Self::init_status(&mut primary, secondary_state.image_ok, bs, self.image_index)
    }

    /// Seeds a freshly erased trailer with everything but progress and
    /// copy-done. Magic goes last: it is the commitment marker.
    fn init_status<F: FlashArea>(
        trailer: &mut Trailer<F>,
        secondary_image_ok: FlagState,
        bs: &BootStatus,
        image_index: u8,
    ) -> Result<(), Error> {
        if bs.swap_type != SwapType::None {
            trailer.write_swap_info(bs.swap_type, image_index)?;
        }

        // Carried over so a confirmed image stays confirmed across a revert.
        if secondary_image_ok == FlagState::Set {
            trailer.write_image_ok()?;
        }

        trailer.write_swap_size(bs.swap_size)?;

        #[cfg(feature = "encryption")]
        {
            trailer.write_enc_key(0, &bs.enc_keys[0])?;
            trailer.write_enc_key(1, &bs.enc_keys[1])?;
        }

        trailer.write_magic()
    }

    /// Durable end-of-phase marker. While the trailer-bearing granule is in
    /// flight, status lives in scratch; everywhere else in the primary slot.
    fn write_status(&mut self, bs: &BootStatus) -> Result<(), Error> {
        if bs.use_scratch {
            Trailer::for_scratch(self.scratch, self.write_size).write_progress_entry(bs.idx, bs.phase)
        } else {
            Trailer::for_slot(self.primary, self.write_size).write_progress_entry(bs.idx, bs.phase)
        }
    }

    /// Rebuilds the primary trailer from the one maintained in scratch:
    /// progress recorded so far, then each field, magic last.
    fn publish_trailer_from_scratch(
        &mut self,
        progress_offset: u32,
        bs: &BootStatus,
    ) -> Result<(), Error> {
        let scratch_trailer_off =
            Trailer::for_scratch(self.scratch, self.write_size).status_offset();
        copy_region(
            self.scratch,
            self.primary,
            scratch_trailer_off,
            progress_offset,
            (Phase::COUNT - 1) * self.write_size,
        )?;

        let scratch_state = Trailer::for_scratch(self.scratch, self.write_size).read_state()?;
        let image_index = self.image_index;
        let mut primary = Trailer::for_slot(self.primary, self.write_size);

        if scratch_state.image_ok == FlagState::Set {
            primary.write_image_ok()?;
        }
        if scratch_state.swap_type != SwapType::None {
            primary.write_swap_info(scratch_state.swap_type, image_index)?;
        }
        primary.write_swap_size(bs.swap_size)?;

        #[cfg(feature = "encryption")]
        {
            primary.write_enc_key(0, &bs.enc_keys[0])?;
            primary.write_enc_key(1, &bs.enc_keys[1])?;
        }

        primary.write_magic()
    }
}
