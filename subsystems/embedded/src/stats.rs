//! # Blob Statistics
//!
//! Size breakdown and instruction-size percentiles of a finished blob,
//! and the sink they are reported to.

use core::fmt;

use crate::data::EmbeddedData;

// ============================================================================
// SINK
// ============================================================================

/// Receives formatted diagnostics; must not fail or block
pub trait DiagnosticsSink {
    /// Report one block of text
    fn report(&self, text: &str);
}

/// Forwards diagnostics to the `log` facade at info level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticsSink for LogSink {
    fn report(&self, text: &str) {
        for line in text.lines() {
            log::info!("{}", line);
        }
    }
}

// ============================================================================
// STATISTICS
// ============================================================================

/// Size statistics of one blob
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EmbeddedStats {
    /// Code and metadata regions together
    pub total_size: usize,
    /// Metadata region
    pub metadata_size: usize,
    /// Sum of instruction sizes
    pub instruction_size: usize,
    /// Code region bytes that are not instructions (header included)
    pub padding: usize,
    /// Number of units
    pub unit_count: usize,
    /// Median instruction size
    pub p50: u32,
    /// 75th percentile instruction size
    pub p75: u32,
    /// 90th percentile instruction size
    pub p90: u32,
    /// 99th percentile instruction size
    pub p99: u32,
}

impl EmbeddedStats {
    /// Gather statistics from `data`
    pub fn collect(data: &EmbeddedData<'_>) -> Self {
        let mut sizes: Vec<u32> = data.entries().map(|entry| entry.length).collect();
        sizes.sort_unstable();

        let instruction_size = sizes.iter().map(|&size| size as usize).sum::<usize>();

        Self {
            total_size: data.code_size() + data.metadata_size(),
            metadata_size: data.metadata_size(),
            instruction_size,
            padding: data.code_size() - instruction_size,
            unit_count: sizes.len(),
            p50: percentile(&sizes, 50),
            p75: percentile(&sizes, 75),
            p90: percentile(&sizes, 90),
            p99: percentile(&sizes, 99),
        }
    }
}

/// Nearest-rank-below percentile of sorted `sizes`
fn percentile(sizes: &[u32], percent: usize) -> u32 {
    if sizes.is_empty() {
        return 0;
    }
    sizes[sizes.len() * percent / 100]
}

impl fmt::Display for EmbeddedStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "EmbeddedData:")?;
        writeln!(f, "  Total size:                         {}", self.total_size)?;
        writeln!(f, "  Metadata size:                      {}", self.metadata_size)?;
        writeln!(f, "  Instruction size:                   {}", self.instruction_size)?;
        writeln!(f, "  Padding:                            {}", self.padding)?;
        writeln!(f, "  Embedded unit count:                {}", self.unit_count)?;
        writeln!(f, "  Instruction size (50th percentile): {}", self.p50)?;
        writeln!(f, "  Instruction size (75th percentile): {}", self.p75)?;
        writeln!(f, "  Instruction size (90th percentile): {}", self.p90)?;
        write!(f, "  Instruction size (99th percentile): {}", self.p99)
    }
}
