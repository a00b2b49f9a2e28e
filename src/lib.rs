//! # Scratch Swap Engine
//!
//! This crate contains the flash image exchange machinery for a dual-slot
//! bootloader: a power-fail safe, sector-by-sector swap of a primary and a
//! secondary slot through a small scratch region, with durable progress
//! tracking so that a reset at any instant resumes or completes cleanly.
#![cfg_attr(not(test), no_std)]

#[macro_use]
pub mod utilities;

/// Hardware Abstraction Layer, containing interfaces
/// for low level drivers.
pub mod hal;
pub mod devices;
pub mod error;

#[cfg(feature = "use-defmt")]
pub(crate) use defmt as log;

#[cfg(feature = "use-log")]
pub(crate) use ::log;

#[cfg(not(any(feature = "use-defmt", feature = "use-log")))]
pub(crate) mod log {
    macro_rules! debug {
        ( $( $x:expr ),* ) => {{ $( let _ = &$x; )* }};
    }
    pub(crate) use debug;
    macro_rules! info {
        ( $( $x:expr ),* ) => {{ $( let _ = &$x; )* }};
    }
    pub(crate) use info;
    macro_rules! error {
        ( $( $x:expr ),* ) => {{ $( let _ = &$x; )* }};
    }
    pub(crate) use error;
    macro_rules! warner {
        ( $( $x:expr ),* ) => {{ $( let _ = &$x; )* }};
    }
    pub(crate) use warner as warn;
}
