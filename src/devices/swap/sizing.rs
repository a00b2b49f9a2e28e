//! Reports how much application payload a slot can actually hold.

use super::{geometry, trailer};
use crate::devices::image::Sector;

/// Largest application payload that fits, in bytes, or zero when the slots
/// are not compatible.
///
/// Beyond reserving the slot trailer itself, padding may be needed between
/// the end of the image and the trailer: when the trailer-bearing sector is
/// staged into scratch, the scratch trailer must not collide with payload
/// bytes, so any shortfall between the trailer portion in that first sector
/// and the scratch trailer size comes out of the payload budget.
pub fn app_max_size(
    primary: &[Sector],
    secondary: &[Sector],
    scratch_size: u32,
    write_size: u32,
) -> u32 {
    match geometry::paired_slot_size(primary, secondary, scratch_size) {
        None => 0,
        Some(slot_size) => adjust_to_trailer(primary, secondary, slot_size, write_size),
    }
}

fn adjust_to_trailer(
    primary: &[Sector],
    secondary: &[Sector],
    slot_size: u32,
    write_size: u32,
) -> u32 {
    let trailer_size = trailer::slot_trailer_size(write_size);
    let slot_trailer_off = slot_size - trailer_size;

    // The swap always copies along common boundaries, so the authoritative
    // first trailer sector is the larger of the two slots' answers.
    let trailer_sector_end_off = geometry::first_trailer_sector_end_off(primary, trailer_size)
        .max(geometry::first_trailer_sector_end_off(secondary, trailer_size));
    let trailer_size_in_first_sector = trailer_sector_end_off - slot_trailer_off;

    let scratch_trailer_size = trailer::scratch_trailer_size(write_size);
    let padding = scratch_trailer_size.saturating_sub(trailer_size_in_first_sector);

    slot_trailer_off - padding
}
