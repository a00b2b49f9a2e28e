use crate::{error::Error, hal::flash::FlashArea};
use std::{cell::Cell, rc::Rc};

pub const ERASED_VALUE: u8 = 0xFF;

/// Failure reported by a [`FakeFlash`], naming what went wrong instead of
/// silently swallowing the detail the fake already knows.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum FakeError {
    /// The shared [`PowerFailure`] plan cut this mutating operation off.
    PowerCut,
    /// Access past the end of the region.
    OutOfBounds { offset: u32, length: u32 },
}

impl From<FakeError> for Error {
    fn from(error: FakeError) -> Self {
        Error::Flash(match error {
            FakeError::PowerCut => "fake flash lost power [TESTING ONLY]",
            FakeError::OutOfBounds { .. } => "fake flash access out of bounds [TESTING ONLY]",
        })
    }
}

/// Mutating operations performed on a [`FakeFlash`], recorded in order so
/// tests can assert on sequencing (e.g. reverse-order scratch erasure).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operation {
    Write { offset: u32, length: u32 },
    EraseSector { offset: u32, size: u32 },
}

/// Shared countdown of surviving mutating operations across a set of fakes.
/// When it reaches zero every further write or erase fails, simulating a
/// power cut at that exact point of the swap.
#[derive(Clone, Default)]
pub struct PowerFailure(Rc<Cell<Option<usize>>>);

impl PowerFailure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the failure: the next `operations` mutating calls succeed, all
    /// later ones fail.
    pub fn arm(&self, operations: usize) {
        self.0.set(Some(operations));
    }

    pub fn disarm(&self) {
        self.0.set(None);
    }

    fn consume(&self) -> Result<(), FakeError> {
        match self.0.get() {
            None => Ok(()),
            Some(0) => Err(FakeError::PowerCut),
            Some(remaining) => {
                self.0.set(Some(remaining - 1));
                Ok(())
            }
        }
    }
}

/// In-memory flash region with NOR-style semantics: erases to `0xFF` at
/// sector granularity, and cells are only ever programmed once between
/// erases (asserted, to catch protocol violations in tests).
pub struct FakeFlash {
    data: Vec<u8>,
    sectors: Vec<u32>,
    align: u32,
    pub operations: Vec<Operation>,
    power: PowerFailure,
}

impl FakeFlash {
    pub fn new(sector_sizes: &[u32], align: u32) -> FakeFlash {
        let total: u32 = sector_sizes.iter().sum();
        FakeFlash {
            data: vec![ERASED_VALUE; total as usize],
            sectors: sector_sizes.to_vec(),
            align,
            operations: Vec::new(),
            power: PowerFailure::new(),
        }
    }

    /// A region of `count` equally sized sectors.
    pub fn uniform(count: usize, sector_size: u32, align: u32) -> FakeFlash {
        FakeFlash::new(&vec![sector_size; count], align)
    }

    /// Ties this fake to a shared power failure plan.
    pub fn powered_by(mut self, power: &PowerFailure) -> FakeFlash {
        self.power = power.clone();
        self
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    /// `(offset, size)` pairs of the sectors overlapping the given range,
    /// which must start and end on sector boundaries.
    fn sectors_in(&self, offset: u32, length: u32) -> Vec<(u32, u32)> {
        let mut found = Vec::new();
        let mut start = 0u32;
        for &size in &self.sectors {
            if start >= offset && start < offset + length {
                found.push((start, size));
            }
            start += size;
        }
        assert!(found.first().map(|&(o, _)| o) == Some(offset), "erase start not sector aligned");
        let end = found.last().map(|&(o, s)| o + s).unwrap();
        assert!(end == offset + length, "erase end not sector aligned");
        found
    }
}

impl FlashArea for FakeFlash {
    type Error = FakeError;

    fn label() -> &'static str {
        "fake flash"
    }

    fn size(&self) -> u32 {
        self.data.len() as u32
    }

    fn align(&self) -> u32 {
        self.align
    }

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> nb::Result<(), Self::Error> {
        let start = offset as usize;
        let end = start + bytes.len();
        if end > self.data.len() {
            return Err(nb::Error::Other(FakeError::OutOfBounds {
                offset,
                length: bytes.len() as u32,
            }));
        }
        bytes.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> nb::Result<(), Self::Error> {
        self.power.consume()?;
        let start = offset as usize;
        let end = start + bytes.len();
        if end > self.data.len() {
            return Err(nb::Error::Other(FakeError::OutOfBounds {
                offset,
                length: bytes.len() as u32,
            }));
        }
        assert!(
            self.data[start..end].iter().all(|&b| b == ERASED_VALUE),
            "programming a cell twice between erases (offset {:#x})",
            offset
        );
        self.data[start..end].copy_from_slice(bytes);
        self.operations.push(Operation::Write { offset, length: bytes.len() as u32 });
        Ok(())
    }

    fn erase(&mut self, offset: u32, length: u32, reverse: bool) -> nb::Result<(), Self::Error> {
        if offset + length > self.size() {
            return Err(nb::Error::Other(FakeError::OutOfBounds { offset, length }));
        }
        if length == 0 {
            return Ok(());
        }
        let mut sectors = self.sectors_in(offset, length);
        if reverse {
            sectors.reverse();
        }
        for (start, size) in sectors {
            self.power.consume()?;
            let range = start as usize..(start + size) as usize;
            self.data[range].fill(ERASED_VALUE);
            self.operations.push(Operation::EraseSector { offset: start, size });
        }
        Ok(())
    }

    fn is_erased(&self, bytes: &[u8]) -> bool {
        bytes.iter().all(|&b| b == ERASED_VALUE)
    }
}
