//! # Blob Checksum
//!
//! FNV-1a over any number of byte ranges, fed in order. Used for the blob
//! integrity hash; not a cryptographic digest.

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Incremental FNV-1a checksum
#[derive(Debug, Clone, Copy)]
pub struct Checksum {
    value: u64,
}

impl Checksum {
    /// Create new checksum
    pub const fn new() -> Self {
        Self { value: FNV_OFFSET }
    }

    /// Update checksum with data
    pub fn update(&mut self, data: &[u8]) {
        for byte in data {
            self.value ^= *byte as u64;
            self.value = self.value.wrapping_mul(FNV_PRIME);
        }
    }

    /// Finalize and get checksum
    pub fn finalize(self) -> u64 {
        self.value
    }
}

impl Default for Checksum {
    fn default() -> Self {
        Self::new()
    }
}

/// Checksum of `ranges`, concatenated in order
pub fn checksum(ranges: &[&[u8]]) -> u64 {
    let mut checksum = Checksum::new();
    for range in ranges {
        checksum.update(range);
    }
    checksum.finalize()
}
