//! # Build Configuration

use helix_relocation::{Architecture, RelocationStrategy};

use crate::layout::{DEFAULT_CODE_ALIGNMENT, MAX_CODE_ALIGNMENT};
use crate::{BlobError, BlobResult};

/// Blob build configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobConfig {
    code_alignment: u32,
    architecture: Architecture,
    strategy: RelocationStrategy,
    print_statistics: bool,
}

impl BlobConfig {
    /// Default configuration for `architecture`
    pub const fn for_architecture(architecture: Architecture) -> Self {
        Self {
            code_alignment: DEFAULT_CODE_ALIGNMENT,
            architecture,
            strategy: architecture.strategy(),
            print_statistics: cfg!(feature = "stats"),
        }
    }

    /// Create builder
    pub fn builder() -> BlobConfigBuilder {
        BlobConfigBuilder::new()
    }

    /// Alignment of every unit's first instruction
    pub fn code_alignment(&self) -> u32 {
        self.code_alignment
    }

    /// Target architecture
    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// Code-target rewriting strategy
    pub fn strategy(&self) -> RelocationStrategy {
        self.strategy
    }

    /// Report statistics after every build
    pub fn print_statistics(&self) -> bool {
        self.print_statistics
    }
}

impl Default for BlobConfig {
    /// Host architecture, or x64 when the host has no known layout
    fn default() -> Self {
        Self::for_architecture(Architecture::host().unwrap_or(Architecture::X64))
    }
}

/// Builder for BlobConfig
#[derive(Debug, Default)]
pub struct BlobConfigBuilder {
    code_alignment: Option<u32>,
    architecture: Option<Architecture>,
    strategy: Option<RelocationStrategy>,
    print_statistics: Option<bool>,
}

impl BlobConfigBuilder {
    /// Create new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set code alignment
    pub fn code_alignment(mut self, alignment: u32) -> Self {
        self.code_alignment = Some(alignment);
        self
    }

    /// Set target architecture
    pub fn architecture(mut self, architecture: Architecture) -> Self {
        self.architecture = Some(architecture);
        self
    }

    /// Override the architecture's relocation strategy
    pub fn strategy(mut self, strategy: RelocationStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Enable or disable statistics
    pub fn print_statistics(mut self, enabled: bool) -> Self {
        self.print_statistics = Some(enabled);
        self
    }

    /// Build the configuration
    pub fn build(self) -> BlobResult<BlobConfig> {
        let mut config = match self.architecture {
            Some(architecture) => BlobConfig::for_architecture(architecture),
            None => BlobConfig::default(),
        };

        if let Some(alignment) = self.code_alignment {
            if !alignment.is_power_of_two() || alignment > MAX_CODE_ALIGNMENT {
                return Err(BlobError::InvalidConfig(
                    "code alignment must be a power of two no larger than the code header",
                ));
            }
            if (alignment as usize) < config.architecture.trap_pattern().len() {
                return Err(BlobError::InvalidConfig(
                    "code alignment must cover the architecture's trap instruction",
                ));
            }
            config.code_alignment = alignment;
        }
        if let Some(strategy) = self.strategy {
            config.strategy = strategy;
        }
        if let Some(enabled) = self.print_statistics {
            config.print_statistics = enabled;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_architecture() {
        let config = BlobConfig::for_architecture(Architecture::Riscv64);
        assert_eq!(config.code_alignment(), DEFAULT_CODE_ALIGNMENT);
        assert_eq!(config.strategy(), RelocationStrategy::Indirect);
    }

    #[test]
    fn test_builder() {
        let config = BlobConfig::builder()
            .architecture(Architecture::Arm64)
            .code_alignment(16)
            .print_statistics(true)
            .build()
            .unwrap();
        assert_eq!(config.architecture(), Architecture::Arm64);
        assert_eq!(config.code_alignment(), 16);
        assert!(config.print_statistics());
        assert!(config.strategy().is_direct());
    }

    #[test]
    fn test_builder_rejects_alignment() {
        for alignment in [0, 3, 48, 128] {
            let result = BlobConfig::builder().code_alignment(alignment).build();
            assert!(matches!(result, Err(BlobError::InvalidConfig(_))), "{}", alignment);
        }
    }

    #[test]
    fn test_alignment_covers_trap_instruction() {
        for arch in [Architecture::Arm, Architecture::Arm64, Architecture::Riscv64] {
            for alignment in [1, 2] {
                let result = BlobConfig::builder()
                    .architecture(arch)
                    .code_alignment(alignment)
                    .build();
                assert!(
                    matches!(result, Err(BlobError::InvalidConfig(_))),
                    "{} {}",
                    arch.name(),
                    alignment
                );
            }
            let config = BlobConfig::builder()
                .architecture(arch)
                .code_alignment(4)
                .build()
                .unwrap();
            assert_eq!(config.code_alignment(), 4);
        }

        let config = BlobConfig::builder()
            .architecture(Architecture::X64)
            .code_alignment(1)
            .build()
            .unwrap();
        assert_eq!(config.code_alignment(), 1);
    }

    #[test]
    fn test_strategy_override() {
        let config = BlobConfig::builder()
            .architecture(Architecture::X64)
            .strategy(RelocationStrategy::Indirect)
            .build()
            .unwrap();
        assert_eq!(config.strategy(), RelocationStrategy::Indirect);
    }
}
