//! Error types for the swap engine.

/// Top level error type for the swap engine. Failures are terminal for the
/// current boot: the caller either resets (letting the resume protocol
/// re-run the interrupted phase) or refuses the upgrade.
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "use-defmt", derive(defmt::Format))]
pub enum Error {
    /// A flash read, write or erase failed. Carries the label of the
    /// offending area.
    Flash(&'static str),
    /// Slot or trailer geometry inconsistent with the configured layout,
    /// detected after compatibility was supposedly established.
    BadArgs(&'static str),
    /// The progress table holds a written entry past the erased boundary,
    /// so the swap position cannot be trusted.
    InconsistentStatus,
}
