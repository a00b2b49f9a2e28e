//! Image trailer codec.
//!
//! The trailer is a fixed-shape record at the tail of a flash region that
//! tracks swap progress and outcome. From lowest to highest offset: the
//! progress table (one cell per granule and phase), the swap size, optional
//! wrapped encryption keys, the swap-info octet, the copy-done and image-ok
//! flags and finally the 16-byte magic. Every field sits in a cell aligned
//! to the write granularity, and no cell is ever programmed twice between
//! erases; commitment is signalled by writing the magic last.

use super::{geometry, Phase};
use crate::{
    devices::image::{Sector, MAX_IMAGE_SECTORS},
    error::Error,
    hal::flash::FlashArea,
    utilities::memory::align_up,
};
use nb::block;

/// Fixed signature marking a trailer as valid.
pub const MAGIC: [u8; 16] = [
    0x3e, 0x04, 0xd6, 0xa1, 0x52, 0xc8, 0x9f, 0x77, 0xb1, 0x0d, 0x26, 0xe2, 0x48, 0x5a, 0xf8, 0x3b,
];

const MAGIC_SIZE: u32 = MAGIC.len() as u32;
const FLAG_SET: u8 = 0x01;

/// Largest supported write granularity. The magic must stay cell-aligned,
/// so the granularity also has to divide 16.
pub const MAX_WRITE_SIZE: usize = 16;

/// Size in bytes of a wrapped per-slot image encryption key.
#[cfg(feature = "encryption")]
pub const KEY_WRAP_SIZE: usize = 16;

/// Requested or in-flight swap operation, persisted as the low nibble of
/// the swap-info octet. The image number occupies the high nibble.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub enum SwapType {
    None,
    Test,
    Permanent,
    Revert,
    Fail,
}

impl SwapType {
    fn to_octet(self) -> u8 {
        match self {
            SwapType::None => 1,
            SwapType::Test => 2,
            SwapType::Permanent => 3,
            SwapType::Revert => 4,
            SwapType::Fail => 5,
        }
    }

    fn from_octet(octet: u8) -> SwapType {
        match octet {
            2 => SwapType::Test,
            3 => SwapType::Permanent,
            4 => SwapType::Revert,
            5 => SwapType::Fail,
            _ => SwapType::None,
        }
    }
}

/// Classification of a trailer's magic field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub enum MagicState {
    /// The fixed signature is present.
    Good,
    /// All sixteen bytes read as erased.
    Unset,
    /// Anything else.
    Bad,
}

/// Classification of a single-octet trailer flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub enum FlagState {
    Set,
    Unset,
    Bad,
}

/// Decoded durable swap state of one region.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub struct SwapState {
    pub magic: MagicState,
    pub swap_type: SwapType,
    pub image_num: u8,
    pub copy_done: FlagState,
    pub image_ok: FlagState,
}

/// Size of the trailer at the tail of an image slot.
pub fn slot_trailer_size(write_size: u32) -> u32 {
    fixed_fields_size(write_size) + MAX_IMAGE_SECTORS as u32 * granule_progress_size(write_size)
}

/// Size of the trailer at the tail of the scratch area, which only ever
/// tracks the single granule passing through it.
pub fn scratch_trailer_size(write_size: u32) -> u32 {
    fixed_fields_size(write_size) + granule_progress_size(write_size)
}

/// Offset of a progress cell relative to the start of the progress table.
pub fn progress_entry_offset(idx: u32, phase: Phase, write_size: u32) -> u32 {
    (idx - 1) * granule_progress_size(write_size) + phase.ordinal() * write_size
}

fn granule_progress_size(write_size: u32) -> u32 {
    Phase::COUNT * write_size
}

fn fixed_fields_size(write_size: u32) -> u32 {
    // Swap-info, copy-done and image-ok octets each take a full cell.
    MAGIC_SIZE + 3 * write_size + align_up(4, write_size) + enc_keys_size(write_size)
}

#[cfg(feature = "encryption")]
fn enc_keys_size(write_size: u32) -> u32 {
    2 * align_up(KEY_WRAP_SIZE as u32, write_size)
}

#[cfg(not(feature = "encryption"))]
fn enc_keys_size(_write_size: u32) -> u32 {
    0
}

/// Reader/writer for the trailer of one flash region. The codec is the only
/// code aware of field positions; everything else goes through it.
pub struct Trailer<'a, F: FlashArea> {
    area: &'a mut F,
    entries: u32,
    write_size: u32,
}

impl<'a, F: FlashArea> Trailer<'a, F> {
    /// Trailer of an image slot, able to track every granule of a swap.
    pub fn for_slot(area: &'a mut F, write_size: u32) -> Self {
        Self::new(area, MAX_IMAGE_SECTORS as u32, write_size)
    }

    /// Trailer of the scratch area.
    pub fn for_scratch(area: &'a mut F, write_size: u32) -> Self {
        Self::new(area, 1, write_size)
    }

    fn new(area: &'a mut F, entries: u32, write_size: u32) -> Self {
        debug_assert!(write_size as usize <= MAX_WRITE_SIZE);
        debug_assert!(MAGIC_SIZE % write_size == 0);
        Trailer { area, entries, write_size }
    }

    /// Total trailer size for this region.
    pub fn size(&self) -> u32 {
        fixed_fields_size(self.write_size) + self.entries * granule_progress_size(self.write_size)
    }

    /// Offset of the progress table, i.e. where the trailer begins.
    pub fn status_offset(&self) -> u32 {
        self.area.size() - self.size()
    }

    /// Number of progress cells this region holds.
    pub fn entry_count(&self) -> u32 {
        self.entries * Phase::COUNT
    }

    fn magic_offset(&self) -> u32 {
        self.area.size() - MAGIC_SIZE
    }

    fn image_ok_offset(&self) -> u32 {
        self.magic_offset() - self.write_size
    }

    fn copy_done_offset(&self) -> u32 {
        self.image_ok_offset() - self.write_size
    }

    fn swap_info_offset(&self) -> u32 {
        self.copy_done_offset() - self.write_size
    }

    #[cfg(feature = "encryption")]
    fn enc_key_offset(&self, slot: usize) -> u32 {
        let cell = align_up(KEY_WRAP_SIZE as u32, self.write_size);
        self.swap_info_offset() - cell * (2 - slot as u32)
    }

    fn swap_size_offset(&self) -> u32 {
        self.swap_info_offset() - enc_keys_size(self.write_size) - align_up(4, self.write_size)
    }

    fn read_at(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Error> {
        block!(self.area.read(offset, bytes)).map_err(|_| Error::Flash(F::label()))
    }

    fn write_at(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Error> {
        block!(self.area.write(offset, bytes)).map_err(|_| Error::Flash(F::label()))
    }

    /// Writes one octet into its own cell, repeated across the cell so the
    /// whole write granule is programmed in one go.
    fn write_octet_cell(&mut self, offset: u32, value: u8) -> Result<(), Error> {
        let cell = [value; MAX_WRITE_SIZE];
        let write_size = self.write_size as usize;
        self.write_at(offset, &cell[..write_size])
    }

    fn read_flag(&mut self, offset: u32) -> Result<FlagState, Error> {
        let mut octet = [0u8; 1];
        self.read_at(offset, &mut octet)?;
        Ok(if self.area.is_erased(&octet) {
            FlagState::Unset
        } else if octet[0] == FLAG_SET {
            FlagState::Set
        } else {
            FlagState::Bad
        })
    }

    /// Decodes the durable swap state of this region.
    pub fn read_state(&mut self) -> Result<SwapState, Error> {
        let mut magic = [0u8; MAGIC_SIZE as usize];
        self.read_at(self.magic_offset(), &mut magic)?;
        let magic = if magic == MAGIC {
            MagicState::Good
        } else if self.area.is_erased(&magic) {
            MagicState::Unset
        } else {
            MagicState::Bad
        };

        let mut swap_info = [0u8; 1];
        self.read_at(self.swap_info_offset(), &mut swap_info)?;
        let (swap_type, image_num) = if self.area.is_erased(&swap_info) {
            (SwapType::None, 0)
        } else {
            (SwapType::from_octet(swap_info[0] & 0x0F), swap_info[0] >> 4)
        };

        let copy_done = self.read_flag(self.copy_done_offset())?;
        let image_ok = self.read_flag(self.image_ok_offset())?;

        Ok(SwapState { magic, swap_type, image_num, copy_done, image_ok })
    }

    pub fn write_magic(&mut self) -> Result<(), Error> {
        let offset = self.magic_offset();
        self.write_at(offset, &MAGIC)
    }

    pub fn write_copy_done(&mut self) -> Result<(), Error> {
        let offset = self.copy_done_offset();
        self.write_octet_cell(offset, FLAG_SET)
    }

    pub fn write_image_ok(&mut self) -> Result<(), Error> {
        let offset = self.image_ok_offset();
        self.write_octet_cell(offset, FLAG_SET)
    }

    pub fn write_swap_info(&mut self, swap_type: SwapType, image_num: u8) -> Result<(), Error> {
        let offset = self.swap_info_offset();
        self.write_octet_cell(offset, (image_num << 4) | (swap_type.to_octet() & 0x0F))
    }

    pub fn write_swap_size(&mut self, size: u32) -> Result<(), Error> {
        let mut cell = [0u8; MAX_WRITE_SIZE];
        cell[..4].copy_from_slice(&size.to_le_bytes());
        let length = align_up(4, self.write_size) as usize;
        let offset = self.swap_size_offset();
        self.write_at(offset, &cell[..length])
    }

    pub fn read_swap_size(&mut self) -> Result<u32, Error> {
        let mut bytes = [0u8; 4];
        self.read_at(self.swap_size_offset(), &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    #[cfg(feature = "encryption")]
    pub fn write_enc_key(&mut self, slot: usize, key: &[u8; KEY_WRAP_SIZE]) -> Result<(), Error> {
        let mut cell = [0u8; 2 * MAX_WRITE_SIZE];
        cell[..KEY_WRAP_SIZE].copy_from_slice(key);
        let length = align_up(KEY_WRAP_SIZE as u32, self.write_size) as usize;
        let offset = self.enc_key_offset(slot);
        self.write_at(offset, &cell[..length])
    }

    #[cfg(feature = "encryption")]
    pub fn read_enc_key(&mut self, slot: usize) -> Result<[u8; KEY_WRAP_SIZE], Error> {
        let mut key = [0u8; KEY_WRAP_SIZE];
        let offset = self.enc_key_offset(slot);
        self.read_at(offset, &mut key)?;
        Ok(key)
    }

    /// Records completion of `phase` for granule `idx`. One durable write
    /// per phase; the cell content itself carries no information beyond
    /// being non-erased.
    pub fn write_progress_entry(&mut self, idx: u32, phase: Phase) -> Result<(), Error> {
        debug_assert!(idx >= 1 && idx <= self.entries);
        let offset = self.status_offset() + progress_entry_offset(idx, phase, self.write_size);
        self.write_octet_cell(offset, phase.ordinal() as u8 + 1)
    }

    /// Whether the progress cell at `position` has been written.
    pub fn read_progress_entry(&mut self, position: u32) -> Result<bool, Error> {
        let mut octet = [0u8; 1];
        let offset = self.status_offset() + position * self.write_size;
        self.read_at(offset, &mut octet)?;
        Ok(!self.area.is_erased(&octet))
    }

    /// Destroys trailer validity by erasing every sector that holds trailer
    /// bytes. Required before a fresh trailer can be written.
    pub fn scramble(&mut self, sectors: &[Sector]) -> Result<(), Error> {
        let first = geometry::first_trailer_sector(sectors, self.size());
        let offset = sectors[first].offset;
        let length = self.area.size() - offset;
        block!(self.area.erase(offset, length, false)).map_err(|_| Error::Flash(F::label()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::doubles::flash::FakeFlash;

    const WRITE_SIZE: u32 = 4;

    fn slot_flash() -> FakeFlash {
        FakeFlash::uniform(4, 0x1000, WRITE_SIZE)
    }

    #[cfg(not(feature = "encryption"))]
    #[test]
    fn trailer_sizes_follow_the_write_granularity() {
        // magic + three flag cells + swap size cell + progress table.
        assert_eq!(slot_trailer_size(4), 16 + 12 + 4 + 128 * 12);
        assert_eq!(scratch_trailer_size(4), 16 + 12 + 4 + 12);
        assert_eq!(slot_trailer_size(8), 16 + 24 + 8 + 128 * 24);
    }

    #[cfg(feature = "encryption")]
    #[test]
    fn trailer_sizes_reserve_room_for_wrapped_keys() {
        // As above, plus one aligned cell per wrapped key.
        assert_eq!(slot_trailer_size(4), 16 + 12 + 4 + 2 * 16 + 128 * 12);
        assert_eq!(scratch_trailer_size(4), 16 + 12 + 4 + 2 * 16 + 12);
        assert_eq!(slot_trailer_size(8), 16 + 24 + 8 + 2 * 16 + 128 * 24);
    }

    #[test]
    fn progress_entries_are_laid_out_per_granule_and_phase() {
        assert_eq!(progress_entry_offset(1, Phase::Stage, 4), 0);
        assert_eq!(progress_entry_offset(1, Phase::Publish, 4), 8);
        assert_eq!(progress_entry_offset(3, Phase::Move, 4), 2 * 12 + 4);
    }

    #[test]
    fn pristine_trailer_reads_fully_unset() {
        let mut flash = slot_flash();
        let state = Trailer::for_slot(&mut flash, WRITE_SIZE).read_state().unwrap();
        assert_eq!(state.magic, MagicState::Unset);
        assert_eq!(state.swap_type, SwapType::None);
        assert_eq!(state.copy_done, FlagState::Unset);
        assert_eq!(state.image_ok, FlagState::Unset);
    }

    #[test]
    fn fields_round_trip() {
        let mut flash = slot_flash();
        let mut trailer = Trailer::for_slot(&mut flash, WRITE_SIZE);
        trailer.write_magic().unwrap();
        trailer.write_swap_info(SwapType::Test, 3).unwrap();
        trailer.write_swap_size(0x3000).unwrap();
        trailer.write_copy_done().unwrap();
        trailer.write_image_ok().unwrap();

        let state = trailer.read_state().unwrap();
        assert_eq!(state.magic, MagicState::Good);
        assert_eq!(state.swap_type, SwapType::Test);
        assert_eq!(state.image_num, 3);
        assert_eq!(state.copy_done, FlagState::Set);
        assert_eq!(state.image_ok, FlagState::Set);
        assert_eq!(trailer.read_swap_size().unwrap(), 0x3000);
    }

    #[test]
    fn mangled_magic_reads_bad() {
        let mut flash = slot_flash();
        let offset = flash.size() - 16;
        use crate::hal::flash::FlashArea;
        flash.write(offset, &[0xAA; 16]).unwrap();
        let state = Trailer::for_slot(&mut flash, WRITE_SIZE).read_state().unwrap();
        assert_eq!(state.magic, MagicState::Bad);
    }

    #[cfg(feature = "encryption")]
    #[test]
    fn wrapped_keys_round_trip() {
        let mut flash = slot_flash();
        let mut trailer = Trailer::for_slot(&mut flash, WRITE_SIZE);
        let key = [0x42u8; KEY_WRAP_SIZE];
        trailer.write_enc_key(0, &key).unwrap();
        trailer.write_enc_key(1, &[0x43u8; KEY_WRAP_SIZE]).unwrap();
        assert_eq!(trailer.read_enc_key(0).unwrap(), key);
        assert_eq!(trailer.read_enc_key(1).unwrap(), [0x43u8; KEY_WRAP_SIZE]);
    }

    #[test]
    fn scrambling_erases_every_trailer_sector() {
        use crate::devices::image::Sector;
        let mut flash = slot_flash();
        let sectors: Vec<_> = (0..4).map(|i| Sector::new(i * 0x1000, 0x1000)).collect();
        let mut trailer = Trailer::for_slot(&mut flash, WRITE_SIZE);
        trailer.write_magic().unwrap();
        trailer.write_copy_done().unwrap();
        trailer.scramble(&sectors).unwrap();

        let state = Trailer::for_slot(&mut flash, WRITE_SIZE).read_state().unwrap();
        assert_eq!(state.magic, MagicState::Unset);
        assert_eq!(state.copy_done, FlagState::Unset);
    }
}
