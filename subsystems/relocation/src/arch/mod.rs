//! # Architecture-Specific Relocation
//!
//! Per-architecture call-target encodings and the relocation strategy each
//! architecture uses for code-to-code calls.
//!
//! The strategy is plain data selected once from an [`Architecture`], so
//! every strategy can be exercised on any host.

use crate::{RelocError, RelocMode, RelocResult};

// ============================================================================
// ARCHITECTURES
// ============================================================================

/// Target architectures with a known code layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    /// x86-64
    X64,
    /// 32-bit x86
    Ia32,
    /// 32-bit ARM (A32)
    Arm,
    /// AArch64
    Arm64,
    /// RISC-V 64
    Riscv64,
    /// POWER 64-bit (little endian)
    Ppc64,
}

impl Architecture {
    /// Architecture this crate was compiled for, if it has a known layout
    pub const fn host() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(Self::X64)
        } else if cfg!(target_arch = "x86") {
            Some(Self::Ia32)
        } else if cfg!(target_arch = "arm") {
            Some(Self::Arm)
        } else if cfg!(target_arch = "aarch64") {
            Some(Self::Arm64)
        } else if cfg!(target_arch = "riscv64") {
            Some(Self::Riscv64)
        } else if cfg!(target_arch = "powerpc64") {
            Some(Self::Ppc64)
        } else {
            None
        }
    }

    /// Architecture name
    pub const fn name(self) -> &'static str {
        match self {
            Self::X64 => "x64",
            Self::Ia32 => "ia32",
            Self::Arm => "arm",
            Self::Arm64 => "arm64",
            Self::Riscv64 => "riscv64",
            Self::Ppc64 => "ppc64",
        }
    }

    /// Register reserved to carry context into off-heap code
    pub const fn trampoline_register(self) -> Register {
        match self {
            Self::X64 => x64::R10,
            Self::Ia32 => ia32::ECX,
            Self::Arm => Register::new(12),   // ip
            Self::Arm64 => Register::new(16), // ip0
            Self::Riscv64 => Register::new(31), // t6
            Self::Ppc64 => Register::new(12),
        }
    }

    /// Byte pattern that traps when executed
    pub const fn trap_pattern(self) -> &'static [u8] {
        match self {
            // int3
            Self::X64 | Self::Ia32 => &[0xCC],
            // udf #0xfdee
            Self::Arm => &[0xFE, 0xDE, 0xFF, 0xE7],
            // brk #0
            Self::Arm64 => &[0x00, 0x00, 0x20, 0xD4],
            // ebreak
            Self::Riscv64 => &[0x73, 0x00, 0x10, 0x00],
            // trap
            Self::Ppc64 => &[0x08, 0x00, 0xE0, 0x7F],
        }
    }

    /// How code-to-code calls are encoded
    pub const fn strategy(self) -> RelocationStrategy {
        match self {
            Self::X64 | Self::Ia32 => RelocationStrategy::Direct {
                relative: TargetEncoding::Rel32,
            },
            Self::Arm => RelocationStrategy::Direct {
                relative: TargetEncoding::ArmBranch24,
            },
            Self::Arm64 => RelocationStrategy::Direct {
                relative: TargetEncoding::Arm64Branch26,
            },
            Self::Riscv64 | Self::Ppc64 => RelocationStrategy::Indirect,
        }
    }
}

// ============================================================================
// REGISTERS
// ============================================================================

/// A general-purpose register, by hardware encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Register(u8);

impl Register {
    /// Register with hardware code `code`
    pub const fn new(code: u8) -> Self {
        Self(code)
    }

    /// Hardware code
    pub const fn code(self) -> u8 {
        self.0
    }
}

/// x86-64 general-purpose registers
#[allow(missing_docs)]
pub mod x64 {
    use super::Register;

    pub const RAX: Register = Register::new(0);
    pub const RCX: Register = Register::new(1);
    pub const RDX: Register = Register::new(2);
    pub const RBX: Register = Register::new(3);
    pub const RSP: Register = Register::new(4);
    pub const RBP: Register = Register::new(5);
    pub const RSI: Register = Register::new(6);
    pub const RDI: Register = Register::new(7);
    pub const R8: Register = Register::new(8);
    pub const R9: Register = Register::new(9);
    pub const R10: Register = Register::new(10);
    pub const R11: Register = Register::new(11);
    pub const R12: Register = Register::new(12);
    pub const R13: Register = Register::new(13);
    pub const R14: Register = Register::new(14);
    pub const R15: Register = Register::new(15);
}

/// 32-bit x86 general-purpose registers
#[allow(missing_docs)]
pub mod ia32 {
    use super::Register;

    pub const EAX: Register = Register::new(0);
    pub const ECX: Register = Register::new(1);
    pub const EDX: Register = Register::new(2);
    pub const EBX: Register = Register::new(3);
    pub const ESI: Register = Register::new(6);
    pub const EDI: Register = Register::new(7);
}

// ============================================================================
// TARGET ENCODINGS
// ============================================================================

/// How a call/jump target is encoded at a record location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetEncoding {
    /// x86 `call`/`jmp rel32`: `target = pc + 4 + disp32`, pc at the field
    Rel32,
    /// AArch64 `b`/`bl`: `target = pc + imm26 * 4`, pc at the instruction
    Arm64Branch26,
    /// A32 `b`/`bl`: `target = pc + 8 + imm24 * 4`, pc at the instruction
    ArmBranch24,
}

impl TargetEncoding {
    /// Bytes occupied at the record location
    pub const fn width(self) -> usize {
        match self {
            Self::Rel32 | Self::Arm64Branch26 | Self::ArmBranch24 => 4,
        }
    }

    fn field(self, bytes: &[u8], offset: u32) -> RelocResult<[u8; 4]> {
        let start = offset as usize;
        let end = start + self.width();
        let src = bytes.get(start..end).ok_or(RelocError::OutOfBounds {
            offset: offset as u64,
            size: bytes.len() as u64,
        })?;
        Ok([src[0], src[1], src[2], src[3]])
    }

    fn field_mut(self, bytes: &mut [u8], offset: u32) -> RelocResult<&mut [u8]> {
        let start = offset as usize;
        let end = start + self.width();
        let size = bytes.len() as u64;
        bytes.get_mut(start..end).ok_or(RelocError::OutOfBounds {
            offset: offset as u64,
            size,
        })
    }

    /// Decode the target of the record at `offset` in `bytes`
    ///
    /// `pc` is the address the record occupies in the copy `bytes` belongs
    /// to.
    pub fn target_address(self, bytes: &[u8], offset: u32, pc: usize) -> RelocResult<usize> {
        let word = u32::from_le_bytes(self.field(bytes, offset)?);
        let target = match self {
            Self::Rel32 => (pc as i64 + 4 + word as i32 as i64) as usize,
            Self::Arm64Branch26 => {
                if !is_arm64_branch(word) {
                    return Err(RelocError::InvalidInstruction {
                        offset: offset as u64,
                    });
                }
                let imm = sign_extend(word & 0x03FF_FFFF, 26);
                (pc as i64 + imm * 4) as usize
            },
            Self::ArmBranch24 => {
                if !is_arm_branch(word) {
                    return Err(RelocError::InvalidInstruction {
                        offset: offset as u64,
                    });
                }
                let imm = sign_extend(word & 0x00FF_FFFF, 24);
                (pc as i64 + 8 + imm * 4) as usize
            },
        };
        Ok(target)
    }

    /// Point the record at `offset` in `bytes` to `target`
    ///
    /// Only the encoded target changes; opcode and condition bits are kept.
    pub fn set_target_address(
        self,
        bytes: &mut [u8],
        offset: u32,
        pc: usize,
        target: usize,
    ) -> RelocResult<()> {
        let overflow = |value: i64| RelocError::Overflow {
            offset: offset as u64,
            value,
        };
        let field = self.field_mut(bytes, offset)?;
        match self {
            Self::Rel32 => {
                let disp = target as i64 - (pc as i64 + 4);
                let disp = i32::try_from(disp).map_err(|_| overflow(disp))?;
                field.copy_from_slice(&disp.to_le_bytes());
            },
            Self::Arm64Branch26 => {
                let word = u32::from_le_bytes([field[0], field[1], field[2], field[3]]);
                if !is_arm64_branch(word) {
                    return Err(RelocError::InvalidInstruction {
                        offset: offset as u64,
                    });
                }
                let imm = branch_immediate(target as i64 - pc as i64, 26).ok_or_else(|| {
                    overflow(target as i64 - pc as i64)
                })?;
                let word = (word & !0x03FF_FFFF) | imm;
                field.copy_from_slice(&word.to_le_bytes());
            },
            Self::ArmBranch24 => {
                let word = u32::from_le_bytes([field[0], field[1], field[2], field[3]]);
                if !is_arm_branch(word) {
                    return Err(RelocError::InvalidInstruction {
                        offset: offset as u64,
                    });
                }
                let delta = target as i64 - (pc as i64 + 8);
                let imm = branch_immediate(delta, 24).ok_or_else(|| overflow(delta))?;
                let word = (word & !0x00FF_FFFF) | imm;
                field.copy_from_slice(&word.to_le_bytes());
            },
        }
        Ok(())
    }
}

/// `b` or `bl`
fn is_arm64_branch(word: u32) -> bool {
    word & 0x7C00_0000 == 0x1400_0000
}

/// `b`/`bl` with any condition (excluding the unconditional-space `blx`)
fn is_arm_branch(word: u32) -> bool {
    (word >> 25) & 0b111 == 0b101 && (word >> 28) != 0xF
}

fn sign_extend(value: u32, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value as i64) << shift) >> shift
}

/// Word-scaled branch immediate of `bits` width, if `delta` is encodable
fn branch_immediate(delta: i64, bits: u32) -> Option<u32> {
    if delta % 4 != 0 {
        return None;
    }
    let words = delta / 4;
    let limit = 1i64 << (bits - 1);
    if words < -limit || words >= limit {
        return None;
    }
    Some((words as u32) & ((1u32 << bits) - 1))
}

// ============================================================================
// STRATEGY
// ============================================================================

/// How code-to-code references are handled when code moves
///
/// Only pc-relative targets are rewritten. An absolute target would have
/// to name the address the code is finally hosted at, which is not known
/// when the code is packed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocationStrategy {
    /// Calls encode a pc-relative target that must be rewritten
    Direct {
        /// Encoding of [`RelocMode::RelativeCodeTarget`] records
        relative: TargetEncoding,
    },
    /// Calls go through a register loaded from context state; code-target
    /// records must not exist
    Indirect,
}

impl RelocationStrategy {
    /// Strategy for the host architecture
    pub const fn host() -> Option<Self> {
        match Architecture::host() {
            Some(arch) => Some(arch.strategy()),
            None => None,
        }
    }

    /// Strategy rewrites targets in place
    pub const fn is_direct(self) -> bool {
        matches!(self, Self::Direct { .. })
    }

    /// Encoding used for records of `mode`
    pub fn encoding_for(self, mode: RelocMode) -> RelocResult<TargetEncoding> {
        match (self, mode) {
            (Self::Direct { relative }, RelocMode::RelativeCodeTarget) => Ok(relative),
            _ => Err(RelocError::UnsupportedMode(mode)),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
