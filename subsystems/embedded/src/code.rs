//! # Code Units
//!
//! The build-time view of the code generator's output. A code unit is an
//! immutable run of instruction bytes plus the facts the builder needs to
//! decide whether the unit can be hosted off-heap: its kind, its calling
//! convention and its relocation records.
//!
//! [`CodeSource`] is the collaborator seam; [`CodeUnitSet`] is an in-memory
//! implementation for generators that hand over owned bytes.

use helix_relocation::{Register, RelocRecord};

use crate::{BlobError, BlobResult};

// ============================================================================
// KIND
// ============================================================================

/// How a code unit was generated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeKind {
    /// Adapter into a host (native) function
    HostCall,
    /// Called with the scripting-language calling convention
    ScriptLinkage,
    /// Stub with a register-based call descriptor
    Stub,
    /// Stub taking its arguments on the stack
    StackStub,
    /// Inline-cache or property handler
    Handler,
    /// Interpreter bytecode handler
    BytecodeHandler,
    /// Hand-written assembly
    Assembly,
}

impl CodeKind {
    /// All kinds
    pub const ALL: [CodeKind; 7] = [
        Self::HostCall,
        Self::ScriptLinkage,
        Self::Stub,
        Self::StackStub,
        Self::Handler,
        Self::BytecodeHandler,
        Self::Assembly,
    ];

    /// Short tag
    pub const fn tag(self) -> &'static str {
        match self {
            Self::HostCall => "HCL",
            Self::ScriptLinkage => "SCL",
            Self::Stub => "STB",
            Self::StackStub => "SST",
            Self::Handler => "HDL",
            Self::BytecodeHandler => "BCH",
            Self::Assembly => "ASM",
        }
    }

    /// Unit is entered through its call descriptor
    ///
    /// Bytecode handlers and hand-written assembly manage their own
    /// registers and never carry a descriptor worth checking.
    pub const fn has_call_descriptor(self) -> bool {
        !matches!(self, Self::BytecodeHandler | Self::Assembly)
    }
}

// ============================================================================
// CALL DESCRIPTOR
// ============================================================================

/// Registers a unit expects its caller to set up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallDescriptor {
    /// Register carrying the context, if any
    pub context_register: Option<Register>,
    /// Parameters passed in registers, in order
    pub register_params: Vec<Register>,
}

impl CallDescriptor {
    /// Descriptor with no register usage
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the context register
    pub fn with_context(mut self, register: Register) -> Self {
        self.context_register = Some(register);
        self
    }

    /// Append a register parameter
    pub fn with_param(mut self, register: Register) -> Self {
        self.register_params.push(register);
        self
    }

    /// Descriptor reads `register` on entry
    pub fn uses(&self, register: Register) -> bool {
        self.context_register == Some(register) || self.register_params.contains(&register)
    }
}

// ============================================================================
// SOURCE TRAIT
// ============================================================================

/// Read access to the code generator's output
///
/// Units are indexed `0..unit_count()`; the index order is the order they
/// are packed in.
pub trait CodeSource {
    /// Number of units
    fn unit_count(&self) -> usize;

    /// Unit name for diagnostics
    fn name(&self, index: usize) -> &str;

    /// Instruction bytes as generated
    fn raw_bytes(&self, index: usize) -> &[u8];

    /// Instruction length in bytes
    fn length(&self, index: usize) -> usize {
        self.raw_bytes(index).len()
    }

    /// How the unit was generated
    fn kind(&self, index: usize) -> CodeKind;

    /// Calling convention
    fn call_descriptor(&self, index: usize) -> &CallDescriptor;

    /// Address the generator placed the unit's first instruction at
    ///
    /// Encoded code targets in [`raw_bytes`](CodeSource::raw_bytes) are
    /// relative to these addresses.
    fn instruction_start(&self, index: usize) -> usize;

    /// Relocation records, offsets relative to the first instruction
    fn relocations(&self, index: usize) -> &[RelocRecord];

    /// Hash of the runtime state the units were generated against
    fn context_hash(&self) -> u64;

    /// Unit whose first instruction is at `address`
    fn unit_at(&self, address: usize) -> Option<usize> {
        (0..self.unit_count()).find(|&index| self.instruction_start(index) == address)
    }

    /// Unit references no per-instance runtime state
    fn is_context_independent(&self, index: usize) -> bool {
        !self
            .relocations(index)
            .iter()
            .any(|record| record.mode.is_context_specific())
    }
}

// ============================================================================
// IN-MEMORY UNITS
// ============================================================================

/// First address handed to units pushed without one
const DEFAULT_HEAP_BASE: usize = 0x10_0000;
/// Gap left between automatically placed units
const DEFAULT_HEAP_ALIGNMENT: usize = 64;

/// One generated code unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeUnit {
    name: String,
    kind: CodeKind,
    bytes: Vec<u8>,
    descriptor: CallDescriptor,
    relocations: Vec<RelocRecord>,
    address: Option<usize>,
    context_dependent: bool,
}

impl CodeUnit {
    /// Unit with the given instructions and no relocations
    pub fn new(name: impl Into<String>, kind: CodeKind, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            kind,
            bytes: bytes.into(),
            descriptor: CallDescriptor::new(),
            relocations: Vec::new(),
            address: None,
            context_dependent: false,
        }
    }

    /// Set the calling convention
    pub fn with_descriptor(mut self, descriptor: CallDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    /// Add a relocation record
    pub fn with_relocation(mut self, record: RelocRecord) -> Self {
        self.relocations.push(record);
        self
    }

    /// Place the first instruction at `address`
    pub fn at(mut self, address: usize) -> Self {
        self.address = Some(address);
        self
    }

    /// Mark the unit as depending on per-instance state the records do
    /// not show
    pub fn context_dependent(mut self) -> Self {
        self.context_dependent = true;
        self
    }

    /// Unit name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instruction bytes
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Owned set of code units
#[derive(Debug, Clone)]
pub struct CodeUnitSet {
    units: Vec<CodeUnit>,
    addresses: Vec<usize>,
    next_address: usize,
    context_hash: u64,
}

impl CodeUnitSet {
    /// Empty set generated against context `context_hash`
    pub fn new(context_hash: u64) -> Self {
        Self {
            units: Vec::new(),
            addresses: Vec::new(),
            next_address: DEFAULT_HEAP_BASE,
            context_hash,
        }
    }

    /// Add a unit, returning its index
    ///
    /// Units without an explicit address are placed after the previous
    /// automatically placed one, skipping starts already taken.
    ///
    /// # Panics
    ///
    /// If the unit's explicit address is already taken; see
    /// [`try_push`](Self::try_push).
    pub fn push(&mut self, unit: CodeUnit) -> usize {
        match self.try_push(unit) {
            Ok(index) => index,
            Err(err) => panic!("{}", err),
        }
    }

    /// Add a unit, rejecting an explicit address that is already taken
    pub fn try_push(&mut self, unit: CodeUnit) -> BlobResult<usize> {
        let address = match unit.address {
            Some(address) => {
                if self.addresses.contains(&address) {
                    return Err(BlobError::DuplicateAddress { address });
                }
                address
            },
            None => {
                let span = unit.bytes.len().max(1);
                let mut address = self.next_address;
                while self.addresses.contains(&address) {
                    address = helix_hal::round_up(address + 1, DEFAULT_HEAP_ALIGNMENT);
                }
                self.next_address =
                    helix_hal::round_up(address + span, DEFAULT_HEAP_ALIGNMENT);
                address
            },
        };
        self.addresses.push(address);
        self.units.push(unit);
        Ok(self.units.len() - 1)
    }

    /// Unit at `index`
    pub fn unit(&self, index: usize) -> &CodeUnit {
        &self.units[index]
    }

    /// Number of units
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Set has no units
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl Default for CodeUnitSet {
    fn default() -> Self {
        Self::new(0)
    }
}

impl FromIterator<CodeUnit> for CodeUnitSet {
    fn from_iter<I: IntoIterator<Item = CodeUnit>>(iter: I) -> Self {
        let mut set = Self::new(0);
        for unit in iter {
            set.push(unit);
        }
        set
    }
}

impl CodeSource for CodeUnitSet {
    fn unit_count(&self) -> usize {
        self.units.len()
    }

    fn name(&self, index: usize) -> &str {
        &self.units[index].name
    }

    fn raw_bytes(&self, index: usize) -> &[u8] {
        &self.units[index].bytes
    }

    fn kind(&self, index: usize) -> CodeKind {
        self.units[index].kind
    }

    fn call_descriptor(&self, index: usize) -> &CallDescriptor {
        &self.units[index].descriptor
    }

    fn instruction_start(&self, index: usize) -> usize {
        self.addresses[index]
    }

    fn relocations(&self, index: usize) -> &[RelocRecord] {
        &self.units[index].relocations
    }

    fn context_hash(&self) -> u64 {
        self.context_hash
    }

    fn unit_at(&self, address: usize) -> Option<usize> {
        self.addresses.iter().position(|&start| start == address)
    }

    fn is_context_independent(&self, index: usize) -> bool {
        let unit = &self.units[index];
        !unit.context_dependent
            && !unit
                .relocations
                .iter()
                .any(|record| record.mode.is_context_specific())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use helix_relocation::arch::x64;
    use helix_relocation::RelocMode;

    #[test]
    fn test_kinds_with_descriptors() {
        let skipped: Vec<_> = CodeKind::ALL
            .iter()
            .filter(|kind| !kind.has_call_descriptor())
            .map(|kind| kind.tag())
            .collect();
        assert_eq!(skipped, vec!["BCH", "ASM"]);
    }

    #[test]
    fn test_descriptor_uses() {
        let descriptor = CallDescriptor::new()
            .with_context(x64::RSI)
            .with_param(x64::RAX)
            .with_param(x64::RBX);
        assert!(descriptor.uses(x64::RSI));
        assert!(descriptor.uses(x64::RBX));
        assert!(!descriptor.uses(x64::R10));
    }

    #[test]
    fn test_automatic_placement() {
        let mut set = CodeUnitSet::new(7);
        let a = set.push(CodeUnit::new("a", CodeKind::Stub, vec![0x90; 100]));
        let b = set.push(CodeUnit::new("b", CodeKind::Stub, vec![0x90; 4]));
        let c = set.push(CodeUnit::new("c", CodeKind::Stub, vec![0x90; 4]).at(0x9000));

        assert_eq!(set.instruction_start(a), DEFAULT_HEAP_BASE);
        assert_eq!(set.instruction_start(b), DEFAULT_HEAP_BASE + 128);
        assert_eq!(set.instruction_start(c), 0x9000);
        assert_eq!(set.unit_at(DEFAULT_HEAP_BASE + 128), Some(b));
        assert_eq!(set.unit_at(DEFAULT_HEAP_BASE + 1), None);
        assert_eq!(set.context_hash(), 7);
        assert_eq!(set.length(a), 100);
    }

    #[test]
    fn test_duplicate_start_rejected() {
        let mut set = CodeUnitSet::new(0);
        let auto = set.push(CodeUnit::new("auto", CodeKind::Stub, vec![0x90; 4]));
        let err = set
            .try_push(CodeUnit::new("clash", CodeKind::Stub, vec![0xC3]).at(DEFAULT_HEAP_BASE))
            .unwrap_err();
        assert_eq!(
            err,
            BlobError::DuplicateAddress {
                address: DEFAULT_HEAP_BASE
            }
        );
        assert_eq!(set.unit_count(), 1);
        assert_eq!(set.unit_at(DEFAULT_HEAP_BASE), Some(auto));

        set.push(CodeUnit::new("fixed", CodeKind::Stub, vec![0xC3]).at(0x9000));
        assert!(set
            .try_push(CodeUnit::new("again", CodeKind::Stub, vec![0xC3]).at(0x9000))
            .is_err());
    }

    #[test]
    fn test_automatic_placement_skips_taken_starts() {
        let mut set = CodeUnitSet::new(0);
        let fixed = set.push(
            CodeUnit::new("fixed", CodeKind::Stub, vec![0xC3]).at(DEFAULT_HEAP_BASE),
        );
        let auto = set.push(CodeUnit::new("auto", CodeKind::Stub, vec![0x90; 4]));

        assert_eq!(set.instruction_start(auto), DEFAULT_HEAP_BASE + DEFAULT_HEAP_ALIGNMENT);
        assert_eq!(set.unit_at(DEFAULT_HEAP_BASE), Some(fixed));
        assert_eq!(set.unit_at(DEFAULT_HEAP_BASE + DEFAULT_HEAP_ALIGNMENT), Some(auto));
    }

    #[test]
    #[should_panic(expected = "Two code units start at 0x9000")]
    fn test_push_panics_on_duplicate_start() {
        let mut set = CodeUnitSet::new(0);
        set.push(CodeUnit::new("a", CodeKind::Stub, vec![0xC3]).at(0x9000));
        set.push(CodeUnit::new("b", CodeKind::Stub, vec![0xC3]).at(0x9000));
    }

    #[test]
    fn test_context_independence() {
        let set: CodeUnitSet = [
            CodeUnit::new("clean", CodeKind::Stub, vec![0xC3])
                .with_relocation(RelocRecord::relative_code_target(0))
                .with_relocation(RelocRecord::new(RelocMode::OffHeapTarget, 0))
                .with_relocation(RelocRecord::new(RelocMode::ConstPool, 0)),
            CodeUnit::new("object", CodeKind::Stub, vec![0xC3])
                .with_relocation(RelocRecord::new(RelocMode::EmbeddedObject, 0)),
            CodeUnit::new("marked", CodeKind::Stub, vec![0xC3]).context_dependent(),
        ]
        .into_iter()
        .collect();

        assert!(set.is_context_independent(0));
        assert!(!set.is_context_independent(1));
        assert!(!set.is_context_independent(2));
    }
}
