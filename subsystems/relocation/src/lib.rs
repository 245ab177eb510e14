//! # Helix Relocation Subsystem
//!
//! Relocation records for pre-generated code units, and the
//! per-architecture strategies used to rewrite code-to-code call targets
//! when a unit's bytes are copied to a new location.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │  RelocRecord[]  │────▶│  RelocIterator  │────▶│ TargetEncoding  │
//! │ (mode + offset) │     │ (mask + base pc)│     │ (read / patch)  │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//!                                                          ▲
//!                                  RelocationStrategy ─────┘
//!                                  (chosen per Architecture)
//! ```
//!
//! Architectures with pc-relative call encodings use a
//! [`RelocationStrategy::Direct`] strategy; the others route every
//! code-to-code call through a register and must never carry code-target
//! records at all ([`RelocationStrategy::Indirect`]). Absolute code targets
//! are rejected by both.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod arch;
pub mod info;

use core::fmt;

pub use arch::{Architecture, Register, RelocationStrategy, TargetEncoding};
pub use info::{RelocInfo, RelocIterator, RelocMode, RelocModeMask, RelocRecord};

// ============================================================================
// ERRORS
// ============================================================================

/// Relocation result type
pub type RelocResult<T> = Result<T, RelocError>;

/// Relocation error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocError {
    /// A code-target record reached a strategy that forbids them
    UnexpectedCodeTarget {
        /// Owning code unit
        unit: usize,
        /// Record offset within the unit
        offset: u32,
    },
    /// An absolute code target would tie the code to one address
    AbsoluteCodeTarget {
        /// Owning code unit
        unit: usize,
        /// Record offset within the unit
        offset: u32,
    },
    /// Record location exceeds the unit's instructions
    OutOfBounds {
        /// Byte offset of the record
        offset: u64,
        /// Instruction size of the unit
        size: u64,
    },
    /// New target does not fit the encoding
    Overflow {
        /// Byte offset of the record
        offset: u64,
        /// Displacement that did not fit
        value: i64,
    },
    /// Instruction at the record is not one the encoding can patch
    InvalidInstruction {
        /// Byte offset of the record
        offset: u64,
    },
    /// Original target is not the start of any known code unit
    UnresolvedTarget {
        /// Unit containing the record
        unit: usize,
        /// Target address decoded from the original bytes
        target: u64,
    },
    /// Target unit cannot be embedded
    TargetNotRelocatable {
        /// Unit containing the record
        unit: usize,
        /// Unit the record points at
        target_unit: usize,
    },
    /// Strategy has no encoding for this record mode
    UnsupportedMode(RelocMode),
}

impl fmt::Display for RelocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedCodeTarget { unit, offset } => write!(
                f,
                "Unit {} has a code target at offset {} but calls must be indirect",
                unit, offset
            ),
            Self::AbsoluteCodeTarget { unit, offset } => write!(
                f,
                "Unit {} has an absolute code target at offset {}",
                unit, offset
            ),
            Self::OutOfBounds { offset, size } => {
                write!(f, "Relocation at offset {} exceeds size {}", offset, size)
            },
            Self::Overflow { offset, value } => {
                write!(f, "Overflow at offset {}: value {}", offset, value)
            },
            Self::InvalidInstruction { offset } => {
                write!(f, "No patchable branch at offset {}", offset)
            },
            Self::UnresolvedTarget { unit, target } => write!(
                f,
                "Unit {} targets {:#x}, which starts no known code unit",
                unit, target
            ),
            Self::TargetNotRelocatable { unit, target_unit } => write!(
                f,
                "Unit {} targets unit {}, which is not relocatable",
                unit, target_unit
            ),
            Self::UnsupportedMode(mode) => {
                write!(f, "Unsupported relocation mode: {}", mode.name())
            },
        }
    }
}

impl std::error::Error for RelocError {}

// ============================================================================
// STATISTICS
// ============================================================================

/// Relocation statistics for one fix-up pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RelocStats {
    /// Code units visited
    pub units: usize,
    /// Pc-relative code targets rewritten
    pub relative_code_targets: usize,
}

impl RelocStats {
    /// Creates a new `RelocStats` with all counters initialized to zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total records rewritten
    pub fn total_applied(&self) -> usize {
        self.relative_code_targets
    }

    /// Count one rewritten record
    pub fn record(&mut self, mode: RelocMode) {
        if mode == RelocMode::RelativeCodeTarget {
            self.relative_code_targets += 1;
        }
    }
}

impl fmt::Display for RelocStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Relocation Statistics:")?;
        writeln!(f, "  Units:            {}", self.units)?;
        writeln!(f, "  Applied:          {}", self.total_applied())?;
        write!(f, "    REL_CODE_TARGET: {}", self.relative_code_targets)
    }
}

// ============================================================================
// TESTS
// ============================================================================
