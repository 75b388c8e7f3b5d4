//! Core identifiers for the blockio engine
//!
//! An object is a fixed-size chunk of a virtual image, addressed by
//! `(inode, stripe)`. The pool id lives in the top bits of the inode;
//! versions are per-object monotonic counters whose top bits carry an
//! epoch assigned by the layer above. The engine itself only relies on
//! the total ordering of `(oid, version)` pairs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of inode bits reserved for the pool id.
pub const POOL_ID_BITS: u32 = 16;

/// Number of version bits reserved for the writer epoch.
pub const EPOCH_BITS: u32 = 16;

/// Pool identifier extracted from the inode high bits.
pub type PoolId = u16;

/// Object identifier: a stripe of an inode.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Oid {
    /// Inode number; the top [`POOL_ID_BITS`] bits encode the pool.
    pub inode: u64,
    /// Stripe number within the inode. Opaque to the engine.
    pub stripe: u64,
}

impl Oid {
    /// Create a new object id
    #[must_use]
    pub const fn new(inode: u64, stripe: u64) -> Self {
        Self { inode, stripe }
    }

    /// Pool id encoded in the inode high bits
    #[must_use]
    pub const fn pool(&self) -> PoolId {
        (self.inode >> (64 - POOL_ID_BITS)) as PoolId
    }

    /// Inode number without the pool id bits
    #[must_use]
    pub const fn inode_in_pool(&self) -> u64 {
        self.inode & ((1 << (64 - POOL_ID_BITS)) - 1)
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({:x}:{:x})", self.inode, self.stripe)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{:x}", self.inode, self.stripe)
    }
}

/// Ordering key of the dirty index: object id, then version.
///
/// The lexicographic order makes "all versions of one object" a contiguous
/// range and "latest version of an object" a reverse-range lookup.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjVer {
    pub oid: Oid,
    pub version: u64,
}

impl ObjVer {
    /// Create a new `(oid, version)` key
    #[must_use]
    pub const fn new(oid: Oid, version: u64) -> Self {
        Self { oid, version }
    }

    /// The highest possible key for this object, for reverse-range lookups
    #[must_use]
    pub const fn max_for(oid: Oid) -> Self {
        Self {
            oid,
            version: u64::MAX,
        }
    }

    /// Epoch carried in the version high bits
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.version >> (64 - EPOCH_BITS)
    }

    /// Version counter without the epoch bits
    #[must_use]
    pub const fn counter(&self) -> u64 {
        self.version & ((1 << (64 - EPOCH_BITS)) - 1)
    }
}

impl fmt::Debug for ObjVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.oid, self.version)
    }
}

impl fmt::Display for ObjVer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.oid, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_pool_bits() {
        let oid = Oid::new((5u64 << 48) | 42, 7);
        assert_eq!(oid.pool(), 5);
        assert_eq!(oid.inode_in_pool(), 42);
    }

    #[test]
    fn test_objver_ordering() {
        let a = Oid::new(1, 0);
        let b = Oid::new(1, 1);
        assert!(ObjVer::new(a, 10) < ObjVer::new(a, 11));
        assert!(ObjVer::new(a, u64::MAX) < ObjVer::new(b, 0));
        assert!(ObjVer::new(a, 5) < ObjVer::max_for(a));
    }

    #[test]
    fn test_version_epoch() {
        let ov = ObjVer::new(Oid::new(1, 0), (3u64 << 48) | 9);
        assert_eq!(ov.epoch(), 3);
        assert_eq!(ov.counter(), 9);
    }
}
