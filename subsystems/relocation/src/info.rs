//! # Relocation Records
//!
//! A relocation record marks a location inside a code unit whose bytes
//! encode a reference to another address. Records are produced by the code
//! generator and never change; the same record list describes the unit
//! wherever its bytes live, so iterating it against two different base
//! addresses yields two views of the same references.

// ============================================================================
// MODES
// ============================================================================

/// Kind of reference encoded at a record's location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocMode {
    /// Absolute address of another code unit
    CodeTarget,
    /// Pc-relative call/jump to another code unit
    RelativeCodeTarget,
    /// Pointer to a runtime-managed object
    EmbeddedObject,
    /// Address of a host function or variable
    ExternalReference,
    /// Absolute address within the same unit
    InternalReference,
    /// Entry point of a runtime function
    RuntimeEntry,
    /// Target that already lives outside any runtime heap
    OffHeapTarget,
    /// Start of an inline constant pool
    ConstPool,
    /// Start of a branch veneer pool
    VeneerPool,
}

impl RelocMode {
    /// All modes, in mask bit order
    pub const ALL: [RelocMode; 9] = [
        Self::CodeTarget,
        Self::RelativeCodeTarget,
        Self::EmbeddedObject,
        Self::ExternalReference,
        Self::InternalReference,
        Self::RuntimeEntry,
        Self::OffHeapTarget,
        Self::ConstPool,
        Self::VeneerPool,
    ];

    /// Mask containing only this mode
    pub const fn mask(self) -> RelocModeMask {
        RelocModeMask::from_bits_retain(1 << self as u32)
    }

    /// Mode encodes a reference to another code unit
    pub const fn is_code_target(self) -> bool {
        matches!(self, Self::CodeTarget | Self::RelativeCodeTarget)
    }

    /// Mode marks data layout rather than a reference
    pub const fn is_marker(self) -> bool {
        matches!(self, Self::ConstPool | Self::VeneerPool)
    }

    /// Mode ties the code to one runtime instance
    pub const fn is_context_specific(self) -> bool {
        matches!(
            self,
            Self::EmbeddedObject
                | Self::ExternalReference
                | Self::InternalReference
                | Self::RuntimeEntry
        )
    }

    /// Mode name
    pub const fn name(self) -> &'static str {
        match self {
            Self::CodeTarget => "CODE_TARGET",
            Self::RelativeCodeTarget => "RELATIVE_CODE_TARGET",
            Self::EmbeddedObject => "EMBEDDED_OBJECT",
            Self::ExternalReference => "EXTERNAL_REFERENCE",
            Self::InternalReference => "INTERNAL_REFERENCE",
            Self::RuntimeEntry => "RUNTIME_ENTRY",
            Self::OffHeapTarget => "OFF_HEAP_TARGET",
            Self::ConstPool => "CONST_POOL",
            Self::VeneerPool => "VENEER_POOL",
        }
    }
}

bitflags::bitflags! {
    /// Set of relocation modes an iterator yields
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RelocModeMask: u32 {
        /// Absolute code target
        const CODE_TARGET = 1 << 0;
        /// Pc-relative code target
        const RELATIVE_CODE_TARGET = 1 << 1;
        /// Embedded object
        const EMBEDDED_OBJECT = 1 << 2;
        /// External reference
        const EXTERNAL_REFERENCE = 1 << 3;
        /// Internal reference
        const INTERNAL_REFERENCE = 1 << 4;
        /// Runtime entry
        const RUNTIME_ENTRY = 1 << 5;
        /// Off-heap target
        const OFF_HEAP_TARGET = 1 << 6;
        /// Constant pool marker
        const CONST_POOL = 1 << 7;
        /// Veneer pool marker
        const VENEER_POOL = 1 << 8;

        /// Every code-to-code reference
        const ALL_CODE_TARGETS = Self::CODE_TARGET.bits() | Self::RELATIVE_CODE_TARGET.bits();
        /// Every mode that encodes a reference
        const ALL_REAL = Self::ALL_CODE_TARGETS.bits()
            | Self::EMBEDDED_OBJECT.bits()
            | Self::EXTERNAL_REFERENCE.bits()
            | Self::INTERNAL_REFERENCE.bits()
            | Self::RUNTIME_ENTRY.bits()
            | Self::OFF_HEAP_TARGET.bits();
    }
}

impl RelocModeMask {
    /// Mask admits `mode`
    #[inline]
    pub const fn admits(self, mode: RelocMode) -> bool {
        self.contains(mode.mask())
    }
}

// ============================================================================
// RECORDS
// ============================================================================

/// One relocation record of a code unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelocRecord {
    /// Reference kind
    pub mode: RelocMode,
    /// Byte offset of the encoded reference from the unit's first instruction
    pub offset: u32,
}

impl RelocRecord {
    /// Create a record
    pub const fn new(mode: RelocMode, offset: u32) -> Self {
        Self { mode, offset }
    }

    /// Pc-relative code target at `offset`
    pub const fn relative_code_target(offset: u32) -> Self {
        Self::new(RelocMode::RelativeCodeTarget, offset)
    }

    /// Absolute code target at `offset`
    pub const fn code_target(offset: u32) -> Self {
        Self::new(RelocMode::CodeTarget, offset)
    }
}

/// A record resolved against a base address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocInfo {
    /// Reference kind
    pub mode: RelocMode,
    /// Offset from the unit's first instruction
    pub offset: u32,
    /// Address of the encoded reference (`base + offset`)
    pub pc: usize,
}

// ============================================================================
// ITERATOR
// ============================================================================

/// Iterates the records of one unit that match a mode mask
///
/// `base` is the address of the unit's first instruction in whichever copy
/// of the bytes is being walked.
#[derive(Debug, Clone)]
pub struct RelocIterator<'a> {
    records: core::slice::Iter<'a, RelocRecord>,
    base: usize,
    mask: RelocModeMask,
}

impl<'a> RelocIterator<'a> {
    /// Create an iterator over `records` located at `base`
    pub fn new(records: &'a [RelocRecord], base: usize, mask: RelocModeMask) -> Self {
        Self {
            records: records.iter(),
            base,
            mask,
        }
    }

    /// Address of the unit's first instruction
    pub fn base(&self) -> usize {
        self.base
    }
}

impl Iterator for RelocIterator<'_> {
    type Item = RelocInfo;

    fn next(&mut self) -> Option<RelocInfo> {
        let mask = self.mask;
        let base = self.base;
        self.records
            .find(|record| mask.admits(record.mode))
            .map(|record| RelocInfo {
                mode: record.mode,
                offset: record.offset,
                pc: base + record.offset as usize,
            })
    }
}

// ============================================================================
// TESTS
// ============================================================================
