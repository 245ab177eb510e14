//! # Helix Hardware Abstraction Layer
//!
//! Host memory primitives used to re-host pre-generated code:
//!
//! - **Page allocation**: reserve-and-commit of aligned, page-sized regions,
//!   protection transitions (RW → RX / RO) and release.
//! - **Address randomization**: unpredictable placement hints for freshly
//!   mapped regions, so that every runtime instance maps its copy of the
//!   code at a different address.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │ MmapRandomizer  │────▶│  PageAllocator  │────▶│  mapped region  │
//! │  (hint address) │     │ (reserve/protect│     │  (RX or RO)     │
//! └─────────────────┘     │   /release)     │     └─────────────────┘
//!                         └─────────────────┘
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod aslr;
pub mod page;

pub use aslr::{AslrConfig, EntropyQuality, MmapRandomizer};
pub use page::{
    HostPageAllocator, PageAllocator, PageError, PageProtection, PageResult, align_down,
    round_up,
};
