//! Hash-mask partitioning primitives
//!
//! Keys are partitioned into buckets by masking the low bits of a 64-bit
//! key hash: `index = key_hash & mask`.  The mask is always one less than a
//! power of two, and only ever grows (by doubling, or by a larger power of
//! two when catching up with a peer).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// 64-bit hash identifying a key within a map.
pub type KeyHash = u64;

/// 64-bit hash identifying a map (namespace) of keys.
pub type MapHash = u64;

/// The bucket-partitioning mask.  Value is `2^k - 1` for some `k >= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HashMask(u64);

impl HashMask {
    /// Create a mask, validating the all-ones form.
    pub fn new(mask: u64) -> Result<Self> {
        if Self::is_valid(mask) {
            Ok(Self(mask))
        } else {
            Err(Error::InvalidMask(mask))
        }
    }

    /// Mask covering `buckets` buckets; `buckets` must be a power of two >= 2.
    pub fn from_buckets(buckets: u64) -> Result<Self> {
        if buckets >= 2 && buckets.is_power_of_two() {
            Ok(Self(buckets - 1))
        } else {
            Err(Error::InvalidMask(buckets.wrapping_sub(1)))
        }
    }

    /// True when `mask` is `2^k - 1` with `k >= 1`.
    pub fn is_valid(mask: u64) -> bool {
        mask >= 1 && mask & (mask.wrapping_add(1)) == 0
    }

    /// Raw mask value.
    pub fn get(self) -> u64 {
        self.0
    }

    /// Number of buckets under this mask.
    pub fn bucket_count(self) -> u64 {
        self.0 + 1
    }

    /// The bucket a key hash falls into.  Constant time.
    pub fn bucket_of(self, key_hash: KeyHash) -> u64 {
        key_hash & self.0
    }

    /// The next larger mask: twice the fan-out.
    pub fn doubled(self) -> HashMask {
        HashMask((self.0 << 1) | 1)
    }
}

impl fmt::Display for HashMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
