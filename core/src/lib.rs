//! Rainbow-table engine over MD5: index/string codec, reduction family,
//! chain construction, the sorted chain store, and CPU and OpenCL
//! implementations of table builds and lookups.

#[cfg(feature = "opencl")]
mod backend;
mod chain;
mod cpu;
mod ctx;
mod driver;
mod error;
#[cfg(feature = "opencl")]
mod gpu;
mod hash;
#[cfg(feature = "opencl")]
mod primitives;
mod table;

pub use {
    chain::{chain_end, chain_end_from_hash, index_from_string, reduce, string_from_index, ChainIter},
    cpu::CpuEngine,
    ctx::{RainbowTableParams, RainbowTableParamsBuilder},
    driver::{build_table, lookup_tables, sample_digests, Backend, Engine},
    error::{RtError, RtResult},
    hash::{format_hex_digest, md5, parse_hex_digest, Digest},
    table::{RainbowChain, RainbowTable},
};

#[cfg(feature = "opencl")]
pub use {
    backend::ClSession,
    gpu::{GpuConfig, GpuEngine},
};

/// Sentinel for an unresolved query, device-side and in raw result vectors.
pub const NOT_FOUND: u64 = u64::MAX;

/// Mixing constant for the table index in the reduction family.
/// Multiplying the table index by a large odd constant makes the reduction
/// families of sibling tables diverge much faster than adding the bare
/// index, which measurably improves multi-table success rates.
/// Part of the on-disk contract: tables built with a different constant are
/// incompatible.
pub const TABLE_MIX: u64 = 0x9e37_79b9_7f4a_7c15;

/// The default fraction of the preimage space used as start values.
pub const DEFAULT_ALPHA: f64 = 0.01;

/// The default chain length.
pub const DEFAULT_CHAIN_LENGTH: u64 = 1000;

/// The largest supported preimage length, so that every preimage fits a
/// single MD5 block in the device kernels.
pub const MAX_PREIMAGE_LENGTH: u64 = 55;

/// Spaces must stay below 2^56 strings: the reduction fold multiplies a
/// residue by 256 and the device only has 64-bit integers.
pub const MAX_SPACE_BITS: u32 = 56;
