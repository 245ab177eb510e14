//! # Helix Embedded Code
//!
//! Packs a set of pre-generated code units into one contiguous,
//! position-independent blob, and re-hosts that blob in fresh executable
//! pages for every runtime instance that needs it.
//!
//! ## Architecture
//!
//! ```text
//!                     ┌──────────────┐
//!   CodeSource ──────▶│    Safety    │── violations ──▶ BlobError
//!                     └──────┬───────┘
//!                            ▼
//!                     ┌──────────────┐     ┌──────────────┐
//!                     │    Layout    │────▶│   Builder    │
//!                     └──────────────┘     │ zap / copy / │
//!                                          │ fix / hash   │
//!                                          └──────┬───────┘
//!                                                 ▼
//!   resolve(pc) ◀───── EmbeddedData ◀──────────  Blob
//!                           ▲                     │
//!                           │                     ▼ instantiate
//!                           └────────── OffHeapInstructionStream ── dispose
//! ```
//!
//! A [`Blob`] is built once and never mutated afterwards. Share it as an
//! [`Arc<Blob>`](std::sync::Arc) ([`SharedBlob`]); every consumer gets an
//! [`EmbeddedData`] view, whether it reads the build-time buffers or a
//! hosted [`OffHeapInstructionStream`].
//!
//! ## Errors
//!
//! Every failure is final. [`build`](Blob::build),
//! [`instantiate`](OffHeapInstructionStream::instantiate) and
//! [`dispose`](OffHeapInstructionStream::dispose) report it as a
//! [`BlobError`]; no partially built blob or half-mapped stream is ever
//! returned. Broken internal invariants panic.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod blob;
pub mod checksum;
pub mod code;
pub mod config;
pub mod data;
pub mod fixup;
pub mod layout;
pub mod safety;
pub mod stats;
pub mod stream;

use core::fmt;

use helix_hal::PageError;
use helix_relocation::RelocError;

pub use blob::{Blob, SharedBlob};
pub use code::{CallDescriptor, CodeKind, CodeSource, CodeUnit, CodeUnitSet};
pub use config::{BlobConfig, BlobConfigBuilder};
pub use data::EmbeddedData;
pub use layout::{Layout, MetadataEntry};
pub use safety::{SafetyViolation, Violation};
pub use stats::{DiagnosticsSink, EmbeddedStats, LogSink};
pub use stream::OffHeapInstructionStream;

// ============================================================================
// ERRORS
// ============================================================================

/// Blob result type
pub type BlobResult<T> = Result<T, BlobError>;

/// Blob error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobError {
    /// One or more code units cannot be hosted off-heap
    UnsafeCodeUnits(Vec<SafetyViolation>),
    /// A code target could not be rewritten
    Relocation(RelocError),
    /// Page allocation, protection or release failed
    Page(PageError),
    /// Configuration rejected
    InvalidConfig(&'static str),
    /// Blob exceeds the 32-bit offset space
    TooLarge {
        /// Size that did not fit
        size: u64,
    },
    /// Build buffer allocation failed
    OutOfMemory {
        /// Requested bytes
        size: usize,
    },
    /// Two code units claim the same start address
    DuplicateAddress {
        /// Start address already taken
        address: usize,
    },
    /// Serialized blob is structurally invalid
    Malformed(&'static str),
    /// Stored integrity hash does not match the contents
    HashMismatch {
        /// Hash stored in the metadata
        stored: u64,
        /// Hash computed from the contents
        computed: u64,
    },
    /// Blob was generated against a different context
    ContextMismatch {
        /// Context hash the caller runs with
        expected: u64,
        /// Context hash stored in the blob
        found: u64,
    },
}

impl fmt::Display for BlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsafeCodeUnits(violations) => {
                write!(f, "{} code unit(s) cannot be embedded", violations.len())?;
                for violation in violations {
                    write!(f, "\n  {}", violation)?;
                }
                Ok(())
            },
            Self::Relocation(err) => write!(f, "Relocation failed: {}", err),
            Self::Page(err) => write!(f, "Page operation failed: {}", err),
            Self::InvalidConfig(what) => write!(f, "Invalid configuration: {}", what),
            Self::TooLarge { size } => {
                write!(f, "Blob too large: {} bytes exceed 32-bit offsets", size)
            },
            Self::OutOfMemory { size } => write!(f, "Failed to allocate {} bytes", size),
            Self::DuplicateAddress { address } => {
                write!(f, "Two code units start at {:#x}", address)
            },
            Self::Malformed(what) => write!(f, "Malformed blob: {}", what),
            Self::HashMismatch { stored, computed } => write!(
                f,
                "Blob hash mismatch: stored {:#018x}, computed {:#018x}",
                stored, computed
            ),
            Self::ContextMismatch { expected, found } => write!(
                f,
                "Blob generated for context {:#018x}, expected {:#018x}",
                found, expected
            ),
        }
    }
}

impl std::error::Error for BlobError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Relocation(err) => Some(err),
            Self::Page(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RelocError> for BlobError {
    fn from(err: RelocError) -> Self {
        Self::Relocation(err)
    }
}

impl From<PageError> for BlobError {
    fn from(err: PageError) -> Self {
        Self::Page(err)
    }
}
