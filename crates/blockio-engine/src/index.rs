//! Clean and dirty metadata indices
//!
//! The clean index maps each object id to its flushed state (version,
//! data block location); it is a hash-sharded map rebuilt from the
//! metadata area at open. The dirty index is an ordered map keyed by
//! `(oid, version)` holding every journaled-but-not-flushed write or
//! delete together with its workflow state. Ordering the dirty index by
//! `(oid, version)` makes same-object version chains contiguous, which
//! the write path, read path and flusher all rely on.

use blockio_common::{Oid, ObjVer};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::ops::Bound;
use std::rc::Rc;

/// Number of clean index shards
const CLEAN_SHARDS: usize = 16;

/// What kind of dirty entry this is
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteKind {
    /// Block-aligned or full-overwrite, placed directly in the data area
    Big,
    /// Sub-block write copied through the journal
    Small,
    /// Object deletion
    Delete,
}

/// Workflow position of a dirty entry
///
/// The order is meaningful: an entry only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Parked behind an unflushed delete of the same object
    WaitDel,
    /// Small write parked behind an unsynced big write
    WaitBig,
    /// Ready for submission
    InFlight,
    /// I/O submitted
    Submitted,
    /// All I/O completed
    Written,
    /// Journal sector fsynced
    Synced,
    /// Committed by a stabilize marker; flushable
    Stable,
}

/// Largest dynamic region stored inline in a dirty entry
const DYN_INLINE_CAP: usize = 24;

/// Dynamic per-entry data: presence bitmap plus optional checksums.
///
/// Small regions are stored inline; larger ones are heap-allocated and
/// reference-counted so the dirty entry and in-flight journal entry
/// copies can share one allocation.
#[derive(Clone, Debug)]
pub enum DynData {
    Inline { len: u8, bytes: [u8; DYN_INLINE_CAP] },
    Shared(Rc<[u8]>),
}

impl DynData {
    /// Maximum size stored without a heap allocation
    pub const INLINE_CAP: usize = DYN_INLINE_CAP;

    /// Build from a byte vector
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        if data.len() <= Self::INLINE_CAP {
            let mut bytes = [0u8; Self::INLINE_CAP];
            bytes[..data.len()].copy_from_slice(&data);
            Self::Inline {
                len: data.len() as u8,
                bytes,
            }
        } else {
            Self::Shared(Rc::from(data.into_boxed_slice()))
        }
    }

    /// View the dynamic region
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Inline { len, bytes } => &bytes[..*len as usize],
            Self::Shared(rc) => rc,
        }
    }

    /// Length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether the region is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A not-yet-flushed write or delete
#[derive(Clone, Debug)]
pub struct DirtyEntry {
    pub kind: WriteKind,
    pub stage: Stage,
    /// Treat as stable as soon as synced (WRITE_STABLE)
    pub instant: bool,
    /// Write range within the object block
    pub offset: u32,
    pub len: u32,
    /// Big write: byte offset in the data area.
    /// Small write: byte offset of the payload in the journal ring.
    pub location: u64,
    /// Ring offset of the journal sector holding this entry's record,
    /// `u64::MAX` while none exists yet
    pub journal_sector: u64,
    /// Presence bitmap followed by per-sub-block checksums
    pub dyn_data: DynData,
}

impl DirtyEntry {
    /// Whether the entry's journal record exists (sector assigned)
    #[must_use]
    pub fn journalled(&self) -> bool {
        self.journal_sector != u64::MAX
    }

    /// The presence bitmap prefix of the dynamic region
    #[must_use]
    pub fn bitmap(&self, bitmap_size: usize) -> &[u8] {
        &self.dyn_data.as_slice()[..bitmap_size]
    }

    /// The checksum suffix of the dynamic region
    #[must_use]
    pub fn csums(&self, bitmap_size: usize) -> &[u8] {
        &self.dyn_data.as_slice()[bitmap_size..]
    }
}

/// Ordered index of all dirty entries
#[derive(Default)]
pub struct DirtyIndex {
    map: BTreeMap<ObjVer, DirtyEntry>,
}

impl DirtyIndex {
    /// Create an empty index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ov: ObjVer, entry: DirtyEntry) {
        self.map.insert(ov, entry);
    }

    pub fn remove(&mut self, ov: &ObjVer) -> Option<DirtyEntry> {
        self.map.remove(ov)
    }

    #[must_use]
    pub fn get(&self, ov: &ObjVer) -> Option<&DirtyEntry> {
        self.map.get(ov)
    }

    pub fn get_mut(&mut self, ov: &ObjVer) -> Option<&mut DirtyEntry> {
        self.map.get_mut(ov)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Latest version of an object, if any
    #[must_use]
    pub fn latest(&self, oid: Oid) -> Option<(&ObjVer, &DirtyEntry)> {
        self.map
            .range(..=ObjVer::max_for(oid))
            .next_back()
            .filter(|(ov, _)| ov.oid == oid)
    }

    /// All versions of one object, ascending
    pub fn versions_of(&self, oid: Oid) -> impl Iterator<Item = (&ObjVer, &DirtyEntry)> {
        self.map
            .range((
                Bound::Included(ObjVer::new(oid, 0)),
                Bound::Included(ObjVer::max_for(oid)),
            ))
            .filter(move |(ov, _)| ov.oid == oid)
    }

    /// Version keys of one object, ascending (for mutation loops)
    #[must_use]
    pub fn version_keys_of(&self, oid: Oid) -> Vec<ObjVer> {
        self.versions_of(oid).map(|(ov, _)| *ov).collect()
    }

    /// The entry preceding `ov` for the same object, if any
    #[must_use]
    pub fn predecessor(&self, ov: &ObjVer) -> Option<(&ObjVer, &DirtyEntry)> {
        self.map
            .range(..*ov)
            .next_back()
            .filter(|(prev, _)| prev.oid == ov.oid)
    }

    /// Iterate everything, ascending
    pub fn iter(&self) -> impl Iterator<Item = (&ObjVer, &DirtyEntry)> {
        self.map.iter()
    }

    /// Whether any entry has outstanding I/O
    #[must_use]
    pub fn has_submitted(&self) -> bool {
        self.map.values().any(|e| e.stage == Stage::Submitted)
    }
}

/// Flushed state of one object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CleanEntry {
    pub version: u64,
    /// Byte offset of the object's block in the data area
    pub location: u64,
}

/// Hash-sharded index of clean entries
pub struct CleanIndex {
    shards: Vec<HashMap<Oid, CleanEntry>>,
}

impl Default for CleanIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl CleanIndex {
    /// Create an empty index
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: (0..CLEAN_SHARDS).map(|_| HashMap::new()).collect(),
        }
    }

    fn shard(&self, oid: Oid) -> usize {
        let mut hasher = DefaultHasher::new();
        oid.hash(&mut hasher);
        (hasher.finish() as usize) % CLEAN_SHARDS
    }

    #[must_use]
    pub fn get(&self, oid: Oid) -> Option<CleanEntry> {
        self.shards[self.shard(oid)].get(&oid).copied()
    }

    pub fn insert(&mut self, oid: Oid, entry: CleanEntry) {
        let shard = self.shard(oid);
        self.shards[shard].insert(oid, entry);
    }

    pub fn remove(&mut self, oid: Oid) -> Option<CleanEntry> {
        let shard = self.shard(oid);
        self.shards[shard].remove(&oid)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(HashMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate all clean entries, unordered
    pub fn iter(&self) -> impl Iterator<Item = (&Oid, &CleanEntry)> {
        self.shards.iter().flat_map(HashMap::iter)
    }
}
