//! # Blob Builder
//!
//! Builds a [`Blob`] from a [`CodeSource`]:
//!
//! 1. Check every unit is safe to embed.
//! 2. Lay out the units and allocate both regions.
//! 3. Fill the code region with the architecture's trap pattern.
//! 4. Store the generation context hash and the metadata table.
//! 5. Copy each unit's instructions to its offset.
//! 6. Rewrite code targets to point into the blob.
//! 7. Store the integrity hash and check it reads back.
//!
//! Any failure aborts the whole build; no partial blob is returned.

use std::sync::Arc;

use helix_relocation::RelocStats;

use crate::code::CodeSource;
use crate::config::BlobConfig;
use crate::data::{self, EmbeddedData};
use crate::fixup;
use crate::layout::{
    BLOB_HASH_OFFSET, CODE_HEADER_SIZE, CONTEXT_HASH_OFFSET, Layout, METADATA_ENTRY_SIZE,
    METADATA_TABLE_OFFSET,
};
use crate::safety;
use crate::stats::{DiagnosticsSink, EmbeddedStats, LogSink};
use crate::{BlobError, BlobResult};

/// Reference-counted handle to a published blob
pub type SharedBlob = Arc<Blob>;

/// A finished blob: code region and metadata region
///
/// Immutable once built. Code targets are pc-relative, so the code region
/// stays valid wherever it is copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    code: Vec<u8>,
    metadata: Vec<u8>,
}

impl Blob {
    /// Build a blob, reporting statistics to the `log` facade
    pub fn build<S>(source: &S, config: &BlobConfig) -> BlobResult<Self>
    where
        S: CodeSource + ?Sized,
    {
        Self::build_with_sink(source, config, &LogSink)
    }

    /// Build a blob, reporting statistics to `sink`
    pub fn build_with_sink<S>(
        source: &S,
        config: &BlobConfig,
        sink: &dyn DiagnosticsSink,
    ) -> BlobResult<Self>
    where
        S: CodeSource + ?Sized,
    {
        let arch = config.architecture();
        safety::ensure_embeddable(source, arch)?;

        let mut lengths = Vec::with_capacity(source.unit_count());
        for unit in 0..source.unit_count() {
            debug_assert_eq!(source.length(unit), source.raw_bytes(unit).len());
            let length = source.raw_bytes(unit).len();
            lengths.push(u32::try_from(length).map_err(|_| BlobError::TooLarge {
                size: length as u64,
            })?);
        }
        let layout = Layout::compute(lengths, config.code_alignment())?;

        let mut code = allocate(layout.code_size())?;
        let mut metadata = allocate(layout.metadata_size())?;

        zap(&mut code, arch.trap_pattern());

        data::write_u64(&mut metadata, CONTEXT_HASH_OFFSET, source.context_hash());

        for (unit, entry) in layout.entries().iter().enumerate() {
            let start = METADATA_TABLE_OFFSET + unit * METADATA_ENTRY_SIZE;
            entry.write(&mut metadata[start..start + METADATA_ENTRY_SIZE]);
        }

        for (unit, entry) in layout.entries().iter().enumerate() {
            let start = CODE_HEADER_SIZE + entry.offset as usize;
            debug_assert!(start + entry.length as usize <= code.len());
            code[start..start + entry.length as usize].copy_from_slice(source.raw_bytes(unit));
        }

        let reloc_stats =
            fixup::finalize_code_targets(source, config.strategy(), &layout, &mut code)?;

        let hash = EmbeddedData::new(&code, &metadata).create_embedded_blob_hash();
        data::write_u64(&mut metadata, BLOB_HASH_OFFSET, hash);

        let blob = Self { code, metadata };
        let view = blob.data();
        assert_eq!(
            view.embedded_blob_hash(),
            view.create_embedded_blob_hash(),
            "blob hash does not read back"
        );

        log::info!(
            "embedded: built blob with {} units ({} code bytes, {} metadata bytes, {} targets rewritten)",
            view.unit_count(),
            view.code_size(),
            view.metadata_size(),
            reloc_stats.total_applied()
        );
        if config.print_statistics() {
            report_statistics(&view, &reloc_stats, sink);
        }

        Ok(blob)
    }

    /// Reassemble a blob from serialized regions
    ///
    /// The regions are checked for structure and against the stored
    /// integrity hash.
    pub fn from_parts(code: Vec<u8>, metadata: Vec<u8>) -> BlobResult<Self> {
        EmbeddedData::from_raw(&code, &metadata)?;
        Ok(Self { code, metadata })
    }

    /// Split into the code and metadata regions
    pub fn into_parts(self) -> (Vec<u8>, Vec<u8>) {
        (self.code, self.metadata)
    }

    /// Publish as a shared handle
    pub fn into_shared(self) -> SharedBlob {
        Arc::new(self)
    }

    /// View of both regions
    pub fn data(&self) -> EmbeddedData<'_> {
        EmbeddedData::new(&self.code, &self.metadata)
    }

    /// Code region
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Metadata region
    pub fn metadata(&self) -> &[u8] {
        &self.metadata
    }
}

fn allocate(size: usize) -> BlobResult<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(size)
        .map_err(|_| BlobError::OutOfMemory { size })?;
    buffer.resize(size, 0);
    Ok(buffer)
}

/// Fill `code` with repetitions of `pattern`
fn zap(code: &mut [u8], pattern: &[u8]) {
    for chunk in code.chunks_mut(pattern.len()) {
        chunk.copy_from_slice(&pattern[..chunk.len()]);
    }
}

fn report_statistics(data: &EmbeddedData<'_>, reloc: &RelocStats, sink: &dyn DiagnosticsSink) {
    sink.report(&EmbeddedStats::collect(data).to_string());
    sink.report(&reloc.to_string());
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CallDescriptor, CodeKind, CodeUnit, CodeUnitSet};
    use crate::safety::Violation;
    use helix_relocation::arch::x64;
    use helix_relocation::{Architecture, RelocError, RelocMode, RelocRecord, TargetEncoding};
    use std::cell::RefCell;

    fn x64_config(alignment: u32) -> BlobConfig {
        BlobConfig::builder()
            .architecture(Architecture::X64)
            .code_alignment(alignment)
            .print_statistics(false)
            .build()
            .unwrap()
    }

    fn three_units() -> CodeUnitSet {
        let mut set = CodeUnitSet::new(0xC0FFEE);
        set.push(CodeUnit::new("A", CodeKind::Stub, vec![0x11; 10]));
        set.push(CodeUnit::new("B", CodeKind::ScriptLinkage, vec![0x22; 37]));
        set.push(CodeUnit::new("C", CodeKind::Assembly, vec![0x33; 4]));
        set
    }

    #[test]
    fn test_build_layout_and_contents() {
        let blob = Blob::build(&three_units(), &x64_config(16)).unwrap();
        let data = blob.data();

        assert_eq!(data.unit_count(), 3);
        assert_eq!(data.code_size(), CODE_HEADER_SIZE + 80);
        assert_eq!(data.metadata_size(), METADATA_TABLE_OFFSET + 3 * 8);
        assert_eq!(data.context_hash(), 0xC0FFEE);

        assert_eq!(data.instructions_of(0), &[0x11; 10]);
        assert_eq!(data.instructions_of(1), &[0x22; 37]);
        assert_eq!(data.instructions_of(2), &[0x33; 4]);

        // Header and padding trap
        assert!(blob.code()[..CODE_HEADER_SIZE].iter().all(|&b| b == 0xCC));
        assert!(blob.code()[CODE_HEADER_SIZE + 10..CODE_HEADER_SIZE + 16]
            .iter()
            .all(|&b| b == 0xCC));
        assert!(blob.code()[CODE_HEADER_SIZE + 68..].iter().all(|&b| b == 0xCC));

        assert!(data.verify_blob_hash().is_ok());
    }

    #[test]
    fn test_multi_byte_trap_pattern() {
        let config = BlobConfig::builder()
            .architecture(Architecture::Arm64)
            .code_alignment(16)
            .build()
            .unwrap();
        let mut set = CodeUnitSet::new(0);
        set.push(CodeUnit::new("A", CodeKind::Stub, vec![0x1F, 0x20, 0x03, 0xD5]));
        let blob = Blob::build(&set, &config).unwrap();

        let padding = &blob.code()[CODE_HEADER_SIZE + 4..];
        assert_eq!(padding.len(), 12);
        for word in padding.chunks(4) {
            assert_eq!(word, Architecture::Arm64.trap_pattern());
        }
    }

    /// Two units calling a third at 0x3000
    fn calling_units() -> CodeUnitSet {
        let mut set = CodeUnitSet::new(0xC0FFEE);
        for (name, at) in [("A", 0x1000), ("B", 0x2000)] {
            let mut bytes = vec![0xE8, 0, 0, 0, 0, 0xC3];
            TargetEncoding::Rel32
                .set_target_address(&mut bytes, 1, at + 1, 0x3000)
                .unwrap();
            set.push(
                CodeUnit::new(name, CodeKind::Stub, bytes)
                    .at(at)
                    .with_relocation(RelocRecord::relative_code_target(1)),
            );
        }
        set.push(CodeUnit::new("C", CodeKind::Assembly, vec![0xC3]).at(0x3000));
        set
    }

    #[test]
    fn test_build_is_deterministic() {
        for source in [three_units(), calling_units()] {
            let a = Blob::build(&source, &x64_config(32)).unwrap();
            let b = Blob::build(&source, &x64_config(32)).unwrap();
            assert_ne!(a.code().as_ptr(), b.code().as_ptr());
            assert_eq!(a, b);
            assert_eq!(a.data().embedded_blob_hash(), b.data().embedded_blob_hash());
        }
    }

    #[test]
    fn test_absolute_code_target_fails_build() {
        let mut bytes = vec![0x49, 0xBA, 0, 0, 0, 0, 0, 0, 0, 0, 0x41, 0xFF, 0xE2];
        bytes[2..10].copy_from_slice(&0x2000u64.to_le_bytes());
        let mut set = CodeUnitSet::new(0);
        set.push(
            CodeUnit::new("Jump", CodeKind::Stub, bytes)
                .at(0x1000)
                .with_relocation(RelocRecord::code_target(2)),
        );
        set.push(CodeUnit::new("Callee", CodeKind::Stub, vec![0xC3]).at(0x2000));

        assert!(matches!(
            Blob::build(&set, &x64_config(32)),
            Err(BlobError::Relocation(RelocError::AbsoluteCodeTarget { unit: 0, offset: 2 }))
        ));
    }

    #[test]
    fn test_unsafe_units_fail_build() {
        let mut set = three_units();
        set.push(
            CodeUnit::new("Clobber", CodeKind::Handler, vec![0xC3])
                .with_descriptor(CallDescriptor::new().with_param(x64::R10)),
        );
        set.push(
            CodeUnit::new("Bound", CodeKind::Stub, vec![0xC3])
                .with_relocation(RelocRecord::new(RelocMode::RuntimeEntry, 0)),
        );

        match Blob::build(&set, &x64_config(32)) {
            Err(BlobError::UnsafeCodeUnits(violations)) => {
                assert_eq!(violations.len(), 2);
                assert_eq!(violations[0].name, "Clobber");
                assert_eq!(violations[1].violation, Violation::ContextDependent);
            },
            other => panic!("unsafe units were embedded: {:?}", other),
        }
    }

    #[test]
    fn test_relocation_failure_fails_build() {
        let mut bytes = vec![0xE8, 0, 0, 0, 0];
        TargetEncoding::Rel32
            .set_target_address(&mut bytes, 1, 0x1001, 0x5555)
            .unwrap();
        let mut set = CodeUnitSet::new(0);
        set.push(
            CodeUnit::new("Stray", CodeKind::Stub, bytes)
                .at(0x1000)
                .with_relocation(RelocRecord::relative_code_target(1)),
        );

        assert!(matches!(
            Blob::build(&set, &x64_config(32)),
            Err(BlobError::Relocation(_))
        ));
    }

    #[test]
    fn test_from_parts_round_trip() {
        let blob = Blob::build(&three_units(), &x64_config(16)).unwrap();
        let (code, metadata) = blob.clone().into_parts();
        let restored = Blob::from_parts(code.clone(), metadata.clone()).unwrap();
        assert_eq!(restored.data().unit_count(), 3);
        assert_eq!(restored.data().instructions_of(1), &[0x22; 37]);

        let mut corrupt = metadata;
        corrupt[CONTEXT_HASH_OFFSET] ^= 1;
        assert!(matches!(
            Blob::from_parts(code, corrupt),
            Err(BlobError::HashMismatch { .. })
        ));
    }

    #[derive(Default)]
    struct Capture(RefCell<Vec<String>>);

    impl DiagnosticsSink for Capture {
        fn report(&self, text: &str) {
            self.0.borrow_mut().push(text.to_owned());
        }
    }

    #[test]
    fn test_statistics_reported_when_enabled() {
        let config = BlobConfig::builder()
            .architecture(Architecture::X64)
            .code_alignment(16)
            .print_statistics(true)
            .build()
            .unwrap();
        let sink = Capture::default();
        Blob::build_with_sink(&three_units(), &config, &sink).unwrap();

        let reports = sink.0.borrow();
        assert_eq!(reports.len(), 2);
        assert!(reports[0].contains("Embedded unit count:                3"));
        assert!(reports[0].contains("Instruction size:                   51"));
        assert!(reports[1].starts_with("Relocation Statistics:"));

        let quiet = Capture::default();
        Blob::build_with_sink(&three_units(), &x64_config(16), &quiet).unwrap();
        assert!(quiet.0.borrow().is_empty());
    }

    #[test]
    fn test_empty_source() {
        let blob = Blob::build(&CodeUnitSet::new(5), &x64_config(32)).unwrap();
        assert_eq!(blob.data().unit_count(), 0);
        assert_eq!(blob.code().len(), CODE_HEADER_SIZE);
        assert_eq!(blob.data().context_hash(), 5);
    }
}
