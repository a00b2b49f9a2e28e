use core::fmt;

/// A single bounded flash region (an image slot or the scratch area),
/// addressed by byte offsets from its start.
///
/// The engine assumes writes of `align()` bytes are atomic, erases operate
/// at sector granularity, and reads observe prior writes.
pub trait FlashArea {
    type Error: Clone + Copy + fmt::Debug;

    /// Short human readable name for this region, used in log output.
    fn label() -> &'static str;

    /// Total size of the region in bytes.
    fn size(&self) -> u32;

    /// Write granularity in bytes (the smallest atomically programmable
    /// unit). Must divide 16 so the trailer magic stays aligned.
    fn align(&self) -> u32;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> nb::Result<(), Self::Error>;
    fn write(&mut self, offset: u32, bytes: &[u8]) -> nb::Result<(), Self::Error>;

    /// Erases `[offset, offset + length)`, which must cover whole sectors.
    /// With `reverse` the sectors are erased from the highest offset down.
    fn erase(&mut self, offset: u32, length: u32, reverse: bool) -> nb::Result<(), Self::Error>;

    /// Whether a buffer read from this region contains only the flash's
    /// native erase value.
    fn is_erased(&self, bytes: &[u8]) -> bool;
}
