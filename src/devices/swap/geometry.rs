//! Sector-level geometry analysis for the two image slots.
//!
//! Slots may have entirely different sector layouts; everything here reasons
//! in terms of *common boundaries*, offsets where the running sector sums of
//! both slots coincide. The swap always copies whole spans between
//! successive common boundaries, so each span must fit in the scratch area.

use crate::{
    devices::image::{total_size, Sector, MAX_IMAGE_SECTORS},
    error::Error,
    log::warn,
};

/// Which slot contributed multiple sectors to the span being walked.
#[derive(Clone, Copy, PartialEq)]
enum Smaller {
    Neither,
    Primary,
    Secondary,
}

/// Walks both sector lists in lock step and returns the summed size of all
/// spans between common boundaries, or `None` when the layouts cannot be
/// paired: both slots contributing multiple sectors to one span, a span
/// exceeding the scratch area, or one list running out early.
pub(super) fn paired_slot_size(
    primary: &[Sector],
    secondary: &[Sector],
    scratch_size: u32,
) -> Option<u32> {
    let (mut i, mut j) = (0usize, 0usize);
    let (mut sz0, mut sz1) = (0u32, 0u32);
    let mut paired = 0u32;
    let mut smaller = Smaller::Neither;

    while i < primary.len() || j < secondary.len() {
        if sz0 == sz1 {
            match (primary.get(i), secondary.get(j)) {
                (Some(p), Some(s)) => {
                    sz0 += p.size;
                    sz1 += s.size;
                    i += 1;
                    j += 1;
                }
                _ => {
                    warn!("Cannot upgrade: slots are not compatible");
                    return None;
                }
            }
        } else if sz0 < sz1 {
            // Multiple primary sectors pair against one secondary sector, so
            // the secondary must not have contributed several already.
            if smaller == Smaller::Secondary {
                warn!("Cannot upgrade: slots have non-compatible sectors");
                return None;
            }
            match primary.get(i) {
                Some(p) => sz0 += p.size,
                None => {
                    warn!("Cannot upgrade: slots are not compatible");
                    return None;
                }
            }
            smaller = Smaller::Primary;
            i += 1;
        } else {
            if smaller == Smaller::Primary {
                warn!("Cannot upgrade: slots have non-compatible sectors");
                return None;
            }
            match secondary.get(j) {
                Some(s) => sz1 += s.size,
                #[cfg(feature = "decompress-images")]
                None => break,
                #[cfg(not(feature = "decompress-images"))]
                None => {
                    warn!("Cannot upgrade: slots are not compatible");
                    return None;
                }
            }
            smaller = Smaller::Secondary;
            j += 1;
        }

        if sz0 == sz1 {
            // Common boundary. Every swap iteration copies at most the span
            // on either side of it, which therefore must fit in scratch.
            if sz0 > scratch_size || sz1 > scratch_size {
                warn!("Cannot upgrade: not all sectors fit inside scratch");
                return None;
            }
            paired += sz0;
            smaller = Smaller::Neither;
            sz0 = 0;
            sz1 = 0;
        }
    }

    Some(paired)
}

/// Whether the two slots can be exchanged through the given scratch area.
/// Failure is reported but not an error: the outer loader simply refuses
/// the upgrade.
pub fn slots_compatible(primary: &[Sector], secondary: &[Sector], scratch_size: u32) -> bool {
    if primary.len() > MAX_IMAGE_SECTORS || secondary.len() > MAX_IMAGE_SECTORS {
        warn!("Cannot upgrade: more sectors than allowed");
        return false;
    }

    if paired_slot_size(primary, secondary, scratch_size).is_none() {
        return false;
    }

    #[cfg(not(feature = "decompress-images"))]
    if total_size(primary) != total_size(secondary) {
        warn!("Cannot upgrade: slots are not compatible");
        return false;
    }

    true
}

/// Finds the range of primary sectors ending at `last_sector_idx`
/// (inclusive) that fits in the scratch area. Images are copied backwards,
/// from the final sector towards sector zero, so the range is grown
/// downwards. Returns the first sector of the range and its byte count.
///
/// The secondary slot needs no checking here: compatibility has already
/// established that every common span fits scratch on both sides.
pub fn copy_granule(primary: &[Sector], last_sector_idx: usize, scratch_size: u32) -> (usize, u32) {
    let mut size = 0u32;
    let mut first_sector_idx = last_sector_idx + 1;
    for i in (0..=last_sector_idx).rev() {
        let grown = size + primary[i].size;
        if grown > scratch_size {
            break;
        }
        size = grown;
        first_sector_idx = i;
    }
    (first_sector_idx, size)
}

/// Index of the last primary sector that participates in a swap of
/// `copy_size` bytes. Both slots' cumulative sizes are advanced until they
/// cover `copy_size` *and* agree, i.e. until a common boundary.
pub fn last_sector_idx(
    primary: &[Sector],
    secondary: &[Sector],
    copy_size: u32,
) -> Result<usize, Error> {
    if copy_size == 0 {
        return Err(Error::BadArgs("nothing to swap"));
    }

    let (mut primary_size, mut secondary_size) = (0u32, 0u32);
    let (mut i, mut j) = (0usize, 0usize);
    loop {
        if primary_size < copy_size || primary_size < secondary_size {
            let sector =
                primary.get(i).ok_or(Error::BadArgs("copy size exceeds primary slot"))?;
            primary_size += sector.size;
            i += 1;
        }
        if secondary_size < copy_size || secondary_size < primary_size {
            let sector =
                secondary.get(j).ok_or(Error::BadArgs("copy size exceeds secondary slot"))?;
            secondary_size += sector.size;
            j += 1;
        }
        if primary_size >= copy_size && secondary_size >= copy_size && primary_size == secondary_size
        {
            break;
        }
    }

    Ok(i - 1)
}

/// Number of swap iterations needed to exchange `copy_size` bytes.
pub fn swap_count(
    primary: &[Sector],
    secondary: &[Sector],
    scratch_size: u32,
    copy_size: u32,
) -> Result<u32, Error> {
    let mut last = last_sector_idx(primary, secondary, copy_size)?;
    let mut count = 0;
    loop {
        let (first, _) = copy_granule(primary, last, scratch_size);
        if first > last {
            return Err(Error::BadArgs("sector does not fit in scratch"));
        }
        count += 1;
        if first == 0 {
            break;
        }
        last = first - 1;
    }
    Ok(count)
}

/// Index of the first sector of a slot that holds image trailer data. The
/// trailer may span several sectors of different sizes.
pub fn first_trailer_sector(sectors: &[Sector], trailer_size: u32) -> usize {
    let mut index = sectors.len() - 1;
    let mut accumulated = sectors[index].size;
    while accumulated < trailer_size && index > 0 {
        index -= 1;
        accumulated += sectors[index].size;
    }
    index
}

/// Offset just past the first trailer-bearing sector of a slot. When slots
/// have different layouts the larger of the two slots' answers is the
/// boundary the engine treats specially.
pub fn first_trailer_sector_end_off(sectors: &[Sector], trailer_size: u32) -> u32 {
    let sector = sectors[first_trailer_sector(sectors, trailer_size)];
    sector.offset + sector.size
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(count: usize, size: u32) -> Vec<Sector> {
        (0..count as u32).map(|i| Sector::new(i * size, size)).collect()
    }

    #[test]
    fn homogeneous_slots_are_compatible() {
        let primary = uniform(4, 0x1000);
        let secondary = uniform(4, 0x1000);
        assert!(slots_compatible(&primary, &secondary, 0x1000));
    }

    #[test]
    fn mutually_divisible_heterogeneous_slots_are_compatible() {
        let primary = [
            Sector::new(0, 0x1000),
            Sector::new(0x1000, 0x1000),
            Sector::new(0x2000, 0x2000),
        ];
        let secondary = [
            Sector::new(0, 0x2000),
            Sector::new(0x2000, 0x1000),
            Sector::new(0x3000, 0x1000),
        ];
        assert!(slots_compatible(&primary, &secondary, 0x2000));
        assert_eq!(paired_slot_size(&primary, &secondary, 0x2000), Some(0x4000));
    }

    #[test]
    fn spans_with_multiple_sectors_on_both_sides_are_rejected() {
        // Between offsets 0x1000 and 0x2800 both slots contribute two
        // sectors without meeting at a boundary.
        let primary = [
            Sector::new(0, 0x1000),
            Sector::new(0x1000, 0x800),
            Sector::new(0x1800, 0x800),
            Sector::new(0x2000, 0x1000),
        ];
        let secondary = [
            Sector::new(0, 0x800),
            Sector::new(0x800, 0x1000),
            Sector::new(0x1800, 0x800),
            Sector::new(0x2000, 0x1000),
        ];
        assert!(!slots_compatible(&primary, &secondary, 0x2000));
    }

    #[test]
    fn span_larger_than_scratch_is_rejected() {
        let primary = uniform(2, 0x2000);
        let secondary = uniform(2, 0x2000);
        assert!(!slots_compatible(&primary, &secondary, 0x1000));
    }

    #[test]
    fn too_many_sectors_are_rejected() {
        let primary = uniform(MAX_IMAGE_SECTORS + 1, 0x100);
        let secondary = uniform(MAX_IMAGE_SECTORS + 1, 0x100);
        assert!(!slots_compatible(&primary, &secondary, 0x100));
    }

    #[cfg(not(feature = "decompress-images"))]
    #[test]
    fn slots_of_different_totals_are_rejected() {
        let primary = uniform(1, 0x1000);
        let secondary = uniform(1, 0x2000);
        assert!(!slots_compatible(&primary, &secondary, 0x2000));
    }

    #[test]
    fn granules_grow_downwards_up_to_scratch_size() {
        let primary = uniform(4, 0x1000);
        // Scratch takes two sectors, so the granule ending at index 2
        // stretches down to index 1.
        assert_eq!(copy_granule(&primary, 2, 0x2000), (1, 0x2000));
        // A one-sector scratch pins the granule to a single sector.
        assert_eq!(copy_granule(&primary, 2, 0x1000), (2, 0x1000));
        // Scratch bigger than everything consumes down to sector zero.
        assert_eq!(copy_granule(&primary, 3, 0x1_0000), (0, 0x4000));
    }

    #[test]
    fn last_sector_converges_on_a_common_boundary() {
        let primary = uniform(4, 0x1000);
        let secondary = uniform(4, 0x1000);
        assert_eq!(last_sector_idx(&primary, &secondary, 0x3000), Ok(2));

        let primary = [
            Sector::new(0, 0x1000),
            Sector::new(0x1000, 0x1000),
            Sector::new(0x2000, 0x2000),
        ];
        let secondary = [
            Sector::new(0, 0x2000),
            Sector::new(0x2000, 0x1000),
            Sector::new(0x3000, 0x1000),
        ];
        // 0x2800 of payload only settles once both slots reach 0x4000.
        assert_eq!(last_sector_idx(&primary, &secondary, 0x2800), Ok(2));
    }

    #[test]
    fn swapping_nothing_is_refused() {
        let primary = uniform(2, 0x1000);
        assert_eq!(last_sector_idx(&primary, &primary, 0), Err(Error::BadArgs("nothing to swap")));
    }

    #[test]
    fn swap_count_matches_granule_layout() {
        let primary = uniform(4, 0x1000);
        let secondary = uniform(4, 0x1000);
        assert_eq!(swap_count(&primary, &secondary, 0x1000, 0x3000), Ok(3));
        assert_eq!(swap_count(&primary, &secondary, 0x2000, 0x3000), Ok(2));

        let primary = [
            Sector::new(0, 0x1000),
            Sector::new(0x1000, 0x1000),
            Sector::new(0x2000, 0x2000),
        ];
        let secondary = [
            Sector::new(0, 0x2000),
            Sector::new(0x2000, 0x1000),
            Sector::new(0x3000, 0x1000),
        ];
        assert_eq!(swap_count(&primary, &secondary, 0x2000, 0x4000), Ok(2));
    }

    #[test]
    fn trailer_sector_may_span_several_small_sectors() {
        let sectors = uniform(4, 0x1000);
        assert_eq!(first_trailer_sector(&sectors, 0x800), 3);
        assert_eq!(first_trailer_sector_end_off(&sectors, 0x800), 0x4000);

        let sectors = [
            Sector::new(0, 0x1000),
            Sector::new(0x1000, 0x200),
            Sector::new(0x1200, 0x200),
            Sector::new(0x1400, 0x200),
        ];
        // 0x500 of trailer spreads across all three small tail sectors.
        assert_eq!(first_trailer_sector(&sectors, 0x500), 1);
        assert_eq!(first_trailer_sector_end_off(&sectors, 0x500), 0x1200);
    }
}
