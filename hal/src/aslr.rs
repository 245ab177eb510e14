//! # Address Randomization for Mapped Regions
//!
//! Picks unpredictable placement hints for freshly mapped regions so that
//! every runtime instance maps its copy of the embedded code at a different
//! address.
//!
//! ## Hint Range
//!
//! ```text
//! 0x0000_1000_0000_0000  ┌────────────────────┐
//!                        │  Hint region       │ ◄── regions requested here
//!                        │  (page aligned)    │
//! 0x0000_3FFF_FFFF_0000  └────────────────────┘
//! ```
//!
//! Hints are suggestions only: the page allocator may place the region
//! elsewhere if the hinted range is occupied.

use core::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Randomized placement configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AslrConfig {
    /// Lowest hint address
    pub min_address: usize,
    /// Highest hint address (exclusive)
    pub max_address: usize,
    /// Hint granularity (page size or larger)
    pub alignment: usize,
    /// Enable randomization (disabled hints are always 0)
    pub enabled: bool,
}

impl Default for AslrConfig {
    #[cfg(target_pointer_width = "64")]
    fn default() -> Self {
        Self {
            min_address: 0x0000_1000_0000_0000,
            max_address: 0x0000_3FFF_FFFF_0000,
            alignment: 0x1000,
            enabled: true,
        }
    }

    // Address space is too small to randomize usefully
    #[cfg(not(target_pointer_width = "64"))]
    fn default() -> Self {
        Self::disabled()
    }
}

impl AslrConfig {
    /// Create configuration with custom range
    pub fn with_range(min: usize, max: usize) -> Self {
        Self {
            min_address: min,
            max_address: max,
            ..Default::default()
        }
    }

    /// Disable randomization; every hint is 0 ("anywhere")
    pub fn disabled() -> Self {
        Self {
            min_address: 0,
            max_address: 0,
            alignment: 0x1000,
            enabled: false,
        }
    }

    /// Number of distinct hint slots
    pub fn num_slots(&self) -> usize {
        if self.alignment == 0 {
            return 0;
        }
        self.max_address.saturating_sub(self.min_address) / self.alignment
    }

    /// Effective entropy bits of a hint
    pub fn effective_entropy(&self) -> u8 {
        let slots = self.num_slots();
        if slots == 0 {
            return 0;
        }
        (usize::BITS - 1 - slots.leading_zeros()) as u8
    }

    fn is_valid(&self) -> bool {
        self.alignment.is_power_of_two() && self.max_address > self.min_address
    }
}

// ============================================================================
// ENTROPY SOURCES
// ============================================================================

/// Entropy quality rating
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntropyQuality {
    /// Fixed seed; predictable by construction
    None = 0,
    /// Clock and address jitter only
    Weak = 1,
    /// Hardware RNG (RDRAND)
    Strong = 2,
}

/// Get 64-bit random value from RDRAND
///
/// Returns `None` if RDRAND is not supported or keeps failing.
#[cfg(target_arch = "x86_64")]
pub fn rdrand64() -> Option<u64> {
    if !std::arch::is_x86_feature_detected!("rdrand") {
        return None;
    }

    // RDRAND can transiently fail under contention
    for _ in 0..10 {
        let mut value = 0u64;
        // SAFETY: feature presence checked above
        let ok = unsafe { core::arch::x86_64::_rdrand64_step(&mut value) };
        if ok == 1 {
            return Some(value);
        }
        core::hint::spin_loop();
    }

    None
}

/// Hardware RNG is x86_64-only here
#[cfg(not(target_arch = "x86_64"))]
pub fn rdrand64() -> Option<u64> {
    None
}

/// Clock-derived jitter, always available
fn clock_jitter() -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let stack_marker = 0u8;
    nanos ^ ((&stack_marker as *const u8 as u64).rotate_left(32))
}

/// Simple entropy mixer using XORshift-multiply rounds
#[derive(Debug, Clone, Copy)]
struct EntropyMixer {
    state: u64,
}

impl EntropyMixer {
    fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x853c49e6748fea9b } else { seed },
        }
    }

    fn mix(&mut self, entropy: u64) {
        self.state ^= entropy;
        self.state = self.state.wrapping_mul(0x2545F4914F6CDD1D);
        self.state ^= self.state >> 27;
    }

    fn finalize(mut self) -> u64 {
        self.state ^= self.state >> 33;
        self.state = self.state.wrapping_mul(0xFF51AFD7ED558CCD);
        self.state ^= self.state >> 33;
        self.state = self.state.wrapping_mul(0xC4CEB9FE1A85EC53);
        self.state ^= self.state >> 33;
        self.state
    }
}

/// Distinguishes randomizers seeded within the same clock tick
static SEED_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Collect entropy from all available sources
pub fn collect_entropy() -> (u64, EntropyQuality) {
    let mut mixer = EntropyMixer::new(0);
    let mut quality = EntropyQuality::Weak;

    if let Some(val) = rdrand64() {
        mixer.mix(val);
        quality = EntropyQuality::Strong;
    }

    mixer.mix(clock_jitter());
    mixer.mix(SEED_COUNTER.fetch_add(1, Ordering::Relaxed));

    (mixer.finalize(), quality)
}

// ============================================================================
// RANDOMIZER
// ============================================================================

/// Process-wide source of randomized mapping hints
///
/// Shared by every instantiation; the internal state is guarded by a spin
/// lock since hint generation is short and never blocks.
#[derive(Debug)]
pub struct MmapRandomizer {
    config: AslrConfig,
    quality: EntropyQuality,
    state: spin::Mutex<u64>,
}

impl MmapRandomizer {
    /// Create a randomizer seeded from the best available entropy
    pub fn new(config: AslrConfig) -> Self {
        let (seed, quality) = collect_entropy();
        if config.enabled && !config.is_valid() {
            log::warn!("aslr: invalid hint range {:?}, hints disabled", config);
        }
        Self {
            config,
            quality,
            state: spin::Mutex::new(seed),
        }
    }

    /// Create a deterministic randomizer (tests and reproducible layouts)
    pub fn with_seed(config: AslrConfig, seed: u64) -> Self {
        Self {
            config,
            quality: EntropyQuality::None,
            state: spin::Mutex::new(seed),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &AslrConfig {
        &self.config
    }

    /// Quality of the seed
    pub fn quality(&self) -> EntropyQuality {
        self.quality
    }

    fn next_random(&self) -> u64 {
        let mut state = self.state.lock();
        let mut mixer = EntropyMixer::new(*state);
        mixer.mix(0x9E3779B97F4A7C15);
        *state = mixer.state;
        mixer.finalize()
    }

    /// Next random hint address, or 0 when randomization is off
    pub fn random_mmap_addr(&self) -> usize {
        if !self.config.enabled || !self.config.is_valid() {
            return 0;
        }

        let slots = self.config.num_slots() as u64;
        if slots == 0 {
            return 0;
        }

        let slot = (self.next_random() % slots) as usize;
        let address = self.config.min_address + slot * self.config.alignment;

        debug_assert!(address % self.config.alignment == 0);
        debug_assert!(address >= self.config.min_address);
        debug_assert!(address < self.config.max_address);

        address
    }

    /// Random hint rounded down to `alignment` (a power of two)
    pub fn random_aligned_addr(&self, alignment: usize) -> usize {
        crate::page::align_down(self.random_mmap_addr(), alignment)
    }
}

impl Default for MmapRandomizer {
    fn default() -> Self {
        Self::new(AslrConfig::default())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = AslrConfig::default();
        if config.enabled {
            assert!(config.alignment.is_power_of_two());
            assert!(config.max_address > config.min_address);
            assert!(config.effective_entropy() > 20);
        }
    }

    #[test]
    fn test_disabled_hint_is_zero() {
        let rng = MmapRandomizer::new(AslrConfig::disabled());
        assert_eq!(rng.random_mmap_addr(), 0);
        assert_eq!(rng.random_aligned_addr(0x10000), 0);
    }

    #[test]
    fn test_hints_stay_in_range() {
        let config = AslrConfig::with_range(0x1000_0000, 0x2000_0000);
        let rng = MmapRandomizer::with_seed(config.clone(), 42);
        for _ in 0..1000 {
            let addr = rng.random_mmap_addr();
            assert!(addr >= config.min_address);
            assert!(addr < config.max_address);
            assert_eq!(addr % config.alignment, 0);
        }
    }

    #[test]
    fn test_seeded_randomizer_is_deterministic() {
        let config = AslrConfig::with_range(0x1000_0000, 0x2000_0000);
        let a = MmapRandomizer::with_seed(config.clone(), 7);
        let b = MmapRandomizer::with_seed(config, 7);
        let xs: Vec<usize> = (0..16).map(|_| a.random_mmap_addr()).collect();
        let ys: Vec<usize> = (0..16).map(|_| b.random_mmap_addr()).collect();
        assert_eq!(xs, ys);
        assert!(xs.windows(2).any(|w| w[0] != w[1]));
    }

    #[test]
    fn test_invalid_range_yields_zero() {
        let config = AslrConfig::with_range(0x2000_0000, 0x1000_0000);
        let rng = MmapRandomizer::with_seed(config, 1);
        assert_eq!(rng.random_mmap_addr(), 0);
    }

    #[test]
    fn test_mixer() {
        let mut mixer = EntropyMixer::new(12345);
        mixer.mix(0xDEADBEEF);
        mixer.mix(0xCAFEBABE);
        let result = mixer.finalize();
        assert_ne!(result, 0);
        assert_ne!(result, 12345);
    }

    #[test]
    fn test_entropy_quality_order() {
        assert!(EntropyQuality::Strong > EntropyQuality::Weak);
        assert!(EntropyQuality::Weak > EntropyQuality::None);
        assert!(collect_entropy().1 >= EntropyQuality::Weak);
    }
}
