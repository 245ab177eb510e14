//! # Code Target Fix-Up
//!
//! After the units are copied into the code region, every code-to-code
//! call in the copy still points at the generator's original addresses.
//! This pass walks each unit's code-target records twice in lockstep, once
//! against the original placement and once against the copy, decodes the
//! original target, maps it to its unit, and rewrites the copy to point at
//! that unit's instructions inside the blob.
//!
//! Targets are always decoded from the original bytes, so running the pass
//! again over an already fixed region writes the same bytes.
//!
//! Only pc-relative targets are accepted. The rewritten displacement
//! depends on unit offsets alone, so the region stays valid wherever it is
//! copied and two builds of the same units are byte-identical.

use helix_relocation::{
    RelocError, RelocIterator, RelocMode, RelocModeMask, RelocResult, RelocStats,
    RelocationStrategy,
};

use crate::code::CodeSource;
use crate::layout::{CODE_HEADER_SIZE, Layout};

/// Rewrite the code targets of every unit copied into `code`
///
/// `code` is the whole code region, laid out by `layout`. On an
/// [`Indirect`](RelocationStrategy::Indirect) strategy any code-target
/// record is an error; on a direct one any absolute code-target record is.
pub fn finalize_code_targets<S>(
    source: &S,
    strategy: RelocationStrategy,
    layout: &Layout,
    code: &mut [u8],
) -> RelocResult<RelocStats>
where
    S: CodeSource + ?Sized,
{
    assert_eq!(layout.unit_count(), source.unit_count());
    assert_eq!(code.len(), layout.code_size());

    let blob_base = code.as_ptr() as usize;
    let blob_start_of = |unit: usize| -> usize {
        blob_base + CODE_HEADER_SIZE + layout.entries()[unit].offset as usize
    };

    let mut stats = RelocStats::new();

    for unit in 0..source.unit_count() {
        let records = source.relocations(unit);
        let original = source.raw_bytes(unit);
        let entry = layout.entries()[unit];

        let mut on_heap = RelocIterator::new(
            records,
            source.instruction_start(unit),
            RelocModeMask::ALL_CODE_TARGETS,
        );
        let mut off_heap =
            RelocIterator::new(records, blob_start_of(unit), RelocModeMask::ALL_CODE_TARGETS);

        let copy_start = CODE_HEADER_SIZE + entry.offset as usize;
        let copy = &mut code[copy_start..copy_start + entry.length as usize];

        loop {
            let (on, off) = match (on_heap.next(), off_heap.next()) {
                (Some(on), Some(off)) => (on, off),
                (None, None) => break,
                _ => panic!("relocation iterators of unit {} out of lockstep", unit),
            };
            assert_eq!(on.mode, off.mode);
            assert_eq!(on.offset, off.offset);

            let encoding = match strategy {
                RelocationStrategy::Indirect => {
                    return Err(RelocError::UnexpectedCodeTarget {
                        unit,
                        offset: on.offset,
                    });
                },
                RelocationStrategy::Direct { .. } if on.mode == RelocMode::CodeTarget => {
                    return Err(RelocError::AbsoluteCodeTarget {
                        unit,
                        offset: on.offset,
                    });
                },
                RelocationStrategy::Direct { .. } => strategy.encoding_for(on.mode)?,
            };

            let target = encoding.target_address(original, on.offset, on.pc)?;
            let target_unit = source.unit_at(target).ok_or(RelocError::UnresolvedTarget {
                unit,
                target: target as u64,
            })?;
            if !source.is_context_independent(target_unit) {
                return Err(RelocError::TargetNotRelocatable { unit, target_unit });
            }

            let new_target = blob_start_of(target_unit);
            encoding.set_target_address(copy, off.offset, off.pc, new_target)?;
            stats.record(on.mode);

            #[cfg(feature = "debug_reloc")]
            log::debug!(
                "embedded: {} +{:#x} {} -> {} ({:#x})",
                source.name(unit),
                off.offset,
                on.mode.name(),
                source.name(target_unit),
                new_target
            );
        }

        stats.units += 1;
    }

    Ok(stats)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CodeKind, CodeUnit, CodeUnitSet};
    use helix_relocation::{Architecture, RelocRecord, TargetEncoding};

    const CALLER: usize = 0x1000;
    const CALLEE: usize = 0x2000;

    /// `call <target>; ret` placed at `at`
    fn call_unit(name: &str, at: usize, target: usize) -> CodeUnit {
        let mut bytes = vec![0xE8, 0, 0, 0, 0, 0xC3];
        TargetEncoding::Rel32
            .set_target_address(&mut bytes, 1, at + 1, target)
            .unwrap();
        CodeUnit::new(name, CodeKind::Stub, bytes)
            .at(at)
            .with_relocation(RelocRecord::relative_code_target(1))
    }

    fn two_units() -> CodeUnitSet {
        let mut set = CodeUnitSet::new(0);
        set.push(call_unit("Caller", CALLER, CALLEE));
        set.push(CodeUnit::new("Callee", CodeKind::Stub, vec![0x90; 40]).at(CALLEE));
        set
    }

    /// Code region with every unit copied in, before fix-up
    fn copied(source: &CodeUnitSet, layout: &Layout) -> Vec<u8> {
        let mut code = vec![0xCC; layout.code_size()];
        for (unit, entry) in layout.entries().iter().enumerate() {
            let start = CODE_HEADER_SIZE + entry.offset as usize;
            code[start..start + entry.length as usize].copy_from_slice(source.raw_bytes(unit));
        }
        code
    }

    fn layout_of(source: &CodeUnitSet) -> Layout {
        Layout::compute((0..source.unit_count()).map(|i| source.length(i) as u32), 32).unwrap()
    }

    #[test]
    fn test_rewrites_relative_call_into_blob() {
        let source = two_units();
        let layout = layout_of(&source);
        let mut code = copied(&source, &layout);

        let stats =
            finalize_code_targets(&source, Architecture::X64.strategy(), &layout, &mut code)
                .unwrap();
        assert_eq!(stats.relative_code_targets, 1);
        assert_eq!(stats.units, 2);

        let base = code.as_ptr() as usize;
        let caller = CODE_HEADER_SIZE;
        let callee = CODE_HEADER_SIZE + layout.entries()[1].offset as usize;
        let target = TargetEncoding::Rel32
            .target_address(&code[caller..], 1, base + caller + 1)
            .unwrap();
        assert_eq!(target, base + callee);

        // 6-byte caller padded to 32: callee is 32 bytes later
        let disp = i32::from_le_bytes([
            code[caller + 1],
            code[caller + 2],
            code[caller + 3],
            code[caller + 4],
        ]);
        assert_eq!(disp, 32 - 5);
        assert_eq!(code[caller], 0xE8);
        assert_eq!(code[caller + 5], 0xC3);
    }

    #[test]
    fn test_fixup_is_idempotent() {
        let source = two_units();
        let layout = layout_of(&source);
        let mut code = copied(&source, &layout);
        let strategy = Architecture::X64.strategy();

        finalize_code_targets(&source, strategy, &layout, &mut code).unwrap();
        let once = code.clone();
        finalize_code_targets(&source, strategy, &layout, &mut code).unwrap();
        assert_eq!(code, once);
    }

    #[test]
    fn test_indirect_strategy_rejects_code_targets() {
        let source = two_units();
        let layout = layout_of(&source);
        let mut code = copied(&source, &layout);

        let err = finalize_code_targets(
            &source,
            RelocationStrategy::Indirect,
            &layout,
            &mut code,
        )
        .unwrap_err();
        assert_eq!(err, RelocError::UnexpectedCodeTarget { unit: 0, offset: 1 });
    }

    #[test]
    fn test_indirect_strategy_without_records() {
        let mut source = CodeUnitSet::new(0);
        source.push(
            CodeUnit::new("Leaf", CodeKind::Stub, vec![0x13, 0, 0, 0])
                .with_relocation(RelocRecord::new(RelocMode::OffHeapTarget, 0)),
        );
        let layout = layout_of(&source);
        let mut code = copied(&source, &layout);
        let before = code.clone();

        let stats = finalize_code_targets(
            &source,
            Architecture::Riscv64.strategy(),
            &layout,
            &mut code,
        )
        .unwrap();
        assert_eq!(stats.total_applied(), 0);
        assert_eq!(code, before);
    }

    #[test]
    fn test_unresolved_target() {
        let mut source = CodeUnitSet::new(0);
        source.push(call_unit("Stray", CALLER, 0x7777));
        let layout = layout_of(&source);
        let mut code = copied(&source, &layout);

        let err = finalize_code_targets(&source, Architecture::X64.strategy(), &layout, &mut code)
            .unwrap_err();
        assert_eq!(
            err,
            RelocError::UnresolvedTarget {
                unit: 0,
                target: 0x7777
            }
        );
    }

    #[test]
    fn test_target_must_be_relocatable() {
        let mut source = CodeUnitSet::new(0);
        source.push(call_unit("Caller", CALLER, CALLEE));
        source.push(
            CodeUnit::new("Bound", CodeKind::Stub, vec![0x90; 8])
                .at(CALLEE)
                .context_dependent(),
        );
        let layout = layout_of(&source);
        let mut code = copied(&source, &layout);

        let err = finalize_code_targets(&source, Architecture::X64.strategy(), &layout, &mut code)
            .unwrap_err();
        assert_eq!(
            err,
            RelocError::TargetNotRelocatable {
                unit: 0,
                target_unit: 1
            }
        );
    }

    #[test]
    fn test_absolute_targets_are_rejected() {
        let mut source = CodeUnitSet::new(0);
        // movabs r10, <callee>; jmp r10
        let mut bytes = vec![0x49, 0xBA, 0, 0, 0, 0, 0, 0, 0, 0, 0x41, 0xFF, 0xE2];
        bytes[2..10].copy_from_slice(&(CALLEE as u64).to_le_bytes());
        source.push(
            CodeUnit::new("Jump", CodeKind::Stub, bytes)
                .at(CALLER)
                .with_relocation(RelocRecord::code_target(2)),
        );
        source.push(CodeUnit::new("Callee", CodeKind::Stub, vec![0xC3]).at(CALLEE));
        let layout = layout_of(&source);
        let mut code = copied(&source, &layout);
        let before = code.clone();

        for arch in [Architecture::X64, Architecture::Ia32, Architecture::Arm64] {
            let err = finalize_code_targets(&source, arch.strategy(), &layout, &mut code)
                .unwrap_err();
            assert_eq!(err, RelocError::AbsoluteCodeTarget { unit: 0, offset: 2 });
        }
        assert_eq!(code, before);
    }

    #[test]
    fn test_rewrite_is_independent_of_buffer_address() {
        let source = two_units();
        let layout = layout_of(&source);
        let strategy = Architecture::X64.strategy();

        let mut first = copied(&source, &layout);
        let mut second = copied(&source, &layout);
        assert_ne!(first.as_ptr(), second.as_ptr());
        finalize_code_targets(&source, strategy, &layout, &mut first).unwrap();
        finalize_code_targets(&source, strategy, &layout, &mut second).unwrap();
        assert_eq!(first, second);
    }
}
